// src/store/memory.rs

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::Appointment;
use crate::scheduling::conflict::{blocks, SlotWindow};
use crate::scheduling::query::{AppointmentQuery, SortOrder};
use crate::store::{AppointmentStore, StoreError};

/// Process-local store. Check-and-write happens under one write lock.
#[derive(Debug, Default)]
pub struct MemoryAppointmentStore {
    rows: RwLock<HashMap<Uuid, Appointment>>,
}

impl MemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn collect_conflicts(
    rows: &HashMap<Uuid, Appointment>,
    doctor_id: Uuid,
    window: &SlotWindow,
    exclude: Option<Uuid>,
) -> Vec<Appointment> {
    let mut out: Vec<Appointment> = rows
        .values()
        .filter(|a| blocks(a, doctor_id, window, exclude))
        .cloned()
        .collect();
    out.sort_by_key(|a| (a.appointment_date, a.created_at));
    out
}

fn matches(a: &Appointment, q: &AppointmentQuery) -> bool {
    if q.status.is_some_and(|s| a.status != s) {
        return false;
    }
    if q.exclude_status.is_some_and(|s| a.status == s) {
        return false;
    }
    if q.department.is_some_and(|d| a.department != d) {
        return false;
    }
    if q.doctor_id.is_some_and(|d| a.doctor_id != d) {
        return false;
    }
    if q.patient_id.is_some_and(|p| a.patient_id != p) {
        return false;
    }
    if q.from.is_some_and(|t| a.appointment_date < t) {
        return false;
    }
    if q.after.is_some_and(|t| a.appointment_date <= t) {
        return false;
    }
    if q.before.is_some_and(|t| a.appointment_date >= t) {
        return false;
    }
    if let Some(text) = &q.text {
        let hit = text.patient_ids.contains(&a.patient_id)
            || text.doctor_ids.contains(&a.doctor_id)
            || text.matches_text(a.reason.as_str())
            || a.notes.as_deref().is_some_and(|n| text.matches_text(n));
        if !hit {
            return false;
        }
    }
    true
}

#[async_trait]
impl AppointmentStore for MemoryAppointmentStore {
    async fn insert_checked(&self, appointment: &Appointment, window: SlotWindow) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let taken = collect_conflicts(&rows, appointment.doctor_id, &window, None);
        if !taken.is_empty() {
            return Err(StoreError::SlotTaken(
                taken.into_iter().map(|a| a.appointment_id).collect(),
            ));
        }
        rows.insert(appointment.appointment_id, appointment.clone());
        Ok(())
    }

    async fn replace(
        &self,
        appointment: &Appointment,
        expected_version: i64,
        window: Option<SlotWindow>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;
        match rows.get(&appointment.appointment_id) {
            None => return Ok(false),
            Some(stored) if stored.version != expected_version => {
                return Err(StoreError::Stale(appointment.appointment_id));
            }
            Some(_) => {}
        }
        if let Some(window) = window {
            let taken = collect_conflicts(
                &rows,
                appointment.doctor_id,
                &window,
                Some(appointment.appointment_id),
            );
            if !taken.is_empty() {
                return Err(StoreError::SlotTaken(
                    taken.into_iter().map(|a| a.appointment_id).collect(),
                ));
            }
        }
        rows.insert(appointment.appointment_id, appointment.clone());
        Ok(true)
    }

    async fn fetch(&self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.rows.read().await.get(&appointment_id).cloned())
    }

    async fn remove(&self, appointment_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.rows.write().await.remove(&appointment_id).is_some())
    }

    async fn conflicts(
        &self,
        doctor_id: Uuid,
        window: SlotWindow,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let rows = self.rows.read().await;
        Ok(collect_conflicts(&rows, doctor_id, &window, exclude))
    }

    async fn query(&self, query: &AppointmentQuery) -> Result<(Vec<Appointment>, u64), StoreError> {
        let rows = self.rows.read().await;
        let mut hits: Vec<&Appointment> = rows.values().filter(|a| matches(a, query)).collect();
        hits.sort_by_key(|a| (a.appointment_date, a.created_at));
        if query.order == SortOrder::Descending {
            hits.reverse();
        }

        let total = hits.len() as u64;
        let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        let page = hits.into_iter().skip(offset).take(limit).cloned().collect();
        Ok((page, total))
    }
}
