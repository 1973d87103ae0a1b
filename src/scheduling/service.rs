// src/scheduling/service.rs

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directory::{Directory, DoctorProfile, PatientProfile};
use crate::error::{AppointmentError, Entity};
use crate::finance::{FinanceSink, PaymentReceived};
use crate::models::{
    Appointment, AppointmentStatus, AppointmentView, Caller, Department, PaymentMethod, PaymentStatus,
    PersonBrief, VisitReason,
};
use crate::scheduling::conflict::{Availability, SlotWindow};
use crate::scheduling::lifecycle::{authorize_transition, is_allowed, TransitionOutcome};
use crate::scheduling::query::{
    self, day_bounds, local_day, page_count, AppointmentQuery, ListFilter, Page, PageRequest, SortOrder,
    TextMatch, DASHBOARD_LIMIT,
};
use crate::store::{AppointmentStore, StoreError};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Attempts at a read-modify-write before giving up on a busy appointment.
const WRITE_ATTEMPTS: usize = 5;

/* ============================================================
   Requests
   ============================================================ */

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewAppointment {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub department: Department,
    pub appointment_date: String,
    pub reason: VisitReason,
    #[serde(default)]
    pub notes: Option<String>,
}

fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // only called when the field is present: null => Some(None)
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

/// General edit. Status and payment have their own operations and are
/// rejected here as unknown fields.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppointmentChanges {
    pub patient_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub department: Option<Department>,
    pub appointment_date: Option<String>,
    pub reason: Option<VisitReason>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusUpdate {
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentUpdate {
    pub payment_status: String,
    #[serde(default)]
    pub payment_method: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusChange {
    pub previous_status: AppointmentStatus,
    pub status: AppointmentStatus,
    pub appointment: AppointmentView,
}

fn clean_notes(notes: Option<String>) -> Option<String> {
    notes
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

/// What a read-modify-write step wants stored.
enum Write {
    /// Nothing to change.
    Skip,
    Plain,
    /// Re-check the doctor's slot atomically with the write.
    Rechecked(SlotWindow),
}

/// The row as read and as written by a successful `modify`.
struct Modified {
    before: Appointment,
    after: Appointment,
}

fn conflict_from(doctor_id: Uuid, at: DateTime<Utc>) -> impl FnOnce(StoreError) -> AppointmentError {
    move |e| match e {
        StoreError::SlotTaken(conflicting) => AppointmentError::Conflict {
            doctor_id,
            at,
            conflicting,
        },
        other => AppointmentError::Store(other),
    }
}

/* ============================================================
   Service
   ============================================================ */

pub struct AppointmentService {
    store: Arc<dyn AppointmentStore>,
    directory: Arc<dyn Directory>,
    finance: Arc<dyn FinanceSink>,
    clinic_offset: FixedOffset,
    clock: Clock,
}

impl AppointmentService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        directory: Arc<dyn Directory>,
        finance: Arc<dyn FinanceSink>,
        clinic_offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            directory,
            finance,
            clinic_offset,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn parse_instant(&self, raw: &str) -> Result<DateTime<Utc>, AppointmentError> {
        query::parse_instant(raw, self.clinic_offset)
    }

    pub fn parse_day(&self, raw: &str) -> Result<NaiveDate, AppointmentError> {
        query::parse_day(raw, self.clinic_offset)
    }

    async fn load(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        self.store
            .fetch(appointment_id)
            .await?
            .ok_or(AppointmentError::NotFound {
                entity: Entity::Appointment,
                id: appointment_id,
            })
    }

    async fn require_doctor(&self, doctor_id: Uuid) -> Result<DoctorProfile, AppointmentError> {
        self.directory
            .doctor(doctor_id)
            .await?
            .ok_or(AppointmentError::NotFound {
                entity: Entity::Doctor,
                id: doctor_id,
            })
    }

    async fn require_patient(&self, patient_id: Uuid) -> Result<PatientProfile, AppointmentError> {
        self.directory
            .patient(patient_id)
            .await?
            .ok_or(AppointmentError::NotFound {
                entity: Entity::Patient,
                id: patient_id,
            })
    }

    /// Load, apply, and write back only if nobody wrote in between; on a lost
    /// race the step is re-run against the fresh row.
    async fn modify<F>(&self, appointment_id: Uuid, mut apply: F) -> Result<Modified, AppointmentError>
    where
        F: FnMut(&mut Appointment) -> Result<Write, AppointmentError>,
    {
        for attempt in 1..=WRITE_ATTEMPTS {
            let before = self.load(appointment_id).await?;
            let mut after = before.clone();
            let window = match apply(&mut after)? {
                Write::Skip => return Ok(Modified { before, after }),
                Write::Plain => None,
                Write::Rechecked(window) => Some(window),
            };
            after.version = before.version + 1;

            match self.store.replace(&after, before.version, window).await {
                Ok(true) => return Ok(Modified { before, after }),
                Ok(false) => {
                    return Err(AppointmentError::NotFound {
                        entity: Entity::Appointment,
                        id: appointment_id,
                    });
                }
                Err(StoreError::Stale(_)) => {
                    tracing::debug!(%appointment_id, attempt, "appointment changed concurrently, retrying");
                }
                Err(e) => {
                    let err = conflict_from(after.doctor_id, after.appointment_date)(e);
                    if matches!(err, AppointmentError::Conflict { .. }) {
                        tracing::warn!(%appointment_id, doctor_id = %after.doctor_id, "write rejected: slot unavailable");
                    }
                    return Err(err);
                }
            }
        }

        tracing::warn!(%appointment_id, "gave up after {WRITE_ATTEMPTS} concurrent write attempts");
        Err(AppointmentError::Contended { id: appointment_id })
    }

    /// Attach patient/doctor briefs from the directory, one lookup per kind.
    async fn resolve(&self, rows: Vec<Appointment>) -> Result<Vec<AppointmentView>, AppointmentError> {
        let mut patient_ids: Vec<Uuid> = rows.iter().map(|a| a.patient_id).collect();
        let mut doctor_ids: Vec<Uuid> = rows.iter().map(|a| a.doctor_id).collect();
        patient_ids.sort_unstable();
        patient_ids.dedup();
        doctor_ids.sort_unstable();
        doctor_ids.dedup();

        let patients: HashMap<Uuid, PersonBrief> = self
            .directory
            .patients(&patient_ids)
            .await?
            .iter()
            .map(|p| (p.patient_id, p.brief()))
            .collect();
        let doctors: HashMap<Uuid, PersonBrief> = self
            .directory
            .doctors(&doctor_ids)
            .await?
            .iter()
            .map(|d| (d.doctor_id, d.brief()))
            .collect();

        Ok(rows
            .into_iter()
            .map(|appointment| AppointmentView {
                patient: patients.get(&appointment.patient_id).cloned(),
                doctor: doctors.get(&appointment.doctor_id).cloned(),
                appointment,
            })
            .collect())
    }

    async fn resolve_one(&self, appointment: Appointment) -> Result<AppointmentView, AppointmentError> {
        let id = appointment.appointment_id;
        self.resolve(vec![appointment])
            .await?
            .pop()
            .ok_or(AppointmentError::NotFound {
                entity: Entity::Appointment,
                id,
            })
    }

    async fn paged(
        &self,
        mut q: AppointmentQuery,
        page: PageRequest,
    ) -> Result<Page<AppointmentView>, AppointmentError> {
        q.offset = page.offset();
        q.limit = Some(page.limit);
        let (rows, total) = self.store.query(&q).await?;
        Ok(Page {
            appointments: self.resolve(rows).await?,
            total,
            page: page.page,
            limit: page.limit,
            pages: page_count(total, page.limit),
        })
    }

    /* ------------------------------------------------------------
       Query surface
       ------------------------------------------------------------ */

    /// General admin listing, soonest first.
    pub async fn list(&self, filter: ListFilter, page: PageRequest) -> Result<Page<AppointmentView>, AppointmentError> {
        tracing::debug!(?filter, ?page, "listing appointments");

        let mut q = AppointmentQuery {
            status: filter.status,
            department: filter.department,
            doctor_id: filter.doctor_id,
            patient_id: filter.patient_id,
            order: SortOrder::Ascending,
            ..Default::default()
        };
        if let Some(day) = filter.date {
            let (start, end) = day_bounds(day, self.clinic_offset);
            q.from = Some(start);
            q.before = Some(end);
        }
        if let Some(needle) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            // names live in the directory; resolve them to ids first
            let hits = self.directory.search(needle).await?;
            q.text = Some(TextMatch {
                needle: needle.to_string(),
                patient_ids: hits.patient_ids,
                doctor_ids: hits.doctor_ids,
            });
        }

        self.paged(q, page).await
    }

    /// Everything on the current clinic-local calendar day, any status.
    pub async fn today(&self) -> Result<Vec<AppointmentView>, AppointmentError> {
        let (start, end) = day_bounds(local_day(self.now(), self.clinic_offset), self.clinic_offset);
        let q = AppointmentQuery {
            from: Some(start),
            before: Some(end),
            order: SortOrder::Ascending,
            ..Default::default()
        };
        let (rows, _) = self.store.query(&q).await?;
        self.resolve(rows).await
    }

    pub async fn upcoming(&self) -> Result<Vec<AppointmentView>, AppointmentError> {
        let q = AppointmentQuery {
            after: Some(self.now()),
            exclude_status: Some(AppointmentStatus::Cancelled),
            order: SortOrder::Ascending,
            limit: Some(DASHBOARD_LIMIT),
            ..Default::default()
        };
        let (rows, _) = self.store.query(&q).await?;
        self.resolve(rows).await
    }

    pub async fn past(&self) -> Result<Vec<AppointmentView>, AppointmentError> {
        let q = AppointmentQuery {
            before: Some(self.now()),
            order: SortOrder::Descending,
            limit: Some(DASHBOARD_LIMIT),
            ..Default::default()
        };
        let (rows, _) = self.store.query(&q).await?;
        self.resolve(rows).await
    }

    /// One patient's history, most recent first.
    pub async fn for_patient(&self, patient_id: Uuid, page: PageRequest) -> Result<Page<AppointmentView>, AppointmentError> {
        let q = AppointmentQuery {
            patient_id: Some(patient_id),
            order: SortOrder::Descending,
            ..Default::default()
        };
        self.paged(q, page).await
    }

    /// One doctor's schedule, most recent first.
    pub async fn for_doctor(&self, doctor_id: Uuid, page: PageRequest) -> Result<Page<AppointmentView>, AppointmentError> {
        let q = AppointmentQuery {
            doctor_id: Some(doctor_id),
            order: SortOrder::Descending,
            ..Default::default()
        };
        self.paged(q, page).await
    }

    pub async fn check_availability(
        &self,
        doctor_id: Uuid,
        at: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<Availability, AppointmentError> {
        tracing::debug!(%doctor_id, %at, ?exclude, "checking availability");
        let conflicts = self
            .store
            .conflicts(doctor_id, SlotWindow::around(at)?, exclude)
            .await?;
        Ok(Availability::from_conflicts(conflicts))
    }

    /* ------------------------------------------------------------
       Writes
       ------------------------------------------------------------ */

    pub async fn create(&self, caller: &Caller, req: NewAppointment) -> Result<AppointmentView, AppointmentError> {
        tracing::debug!(doctor_id = %req.doctor_id, patient_id = %req.patient_id, "booking appointment");
        let at = self.parse_instant(&req.appointment_date)?;
        let window = SlotWindow::around(at)?;
        let doctor = self.require_doctor(req.doctor_id).await?;
        let patient = self.require_patient(req.patient_id).await?;

        let now = self.now();
        let appointment = Appointment {
            appointment_id: Uuid::new_v4(),
            patient_id: patient.patient_id,
            doctor_id: doctor.doctor_id,
            created_by: Some(caller.user_id),
            updated_by: Some(caller.user_id),
            department: req.department,
            appointment_date: at,
            reason: req.reason,
            notes: clean_notes(req.notes),
            status: AppointmentStatus::Upcoming,
            payment_status: PaymentStatus::Pending,
            amount_cents: doctor.consultation_fee_cents.max(0),
            payment_method: None,
            payment_date: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        if let Err(e) = self
            .store
            .insert_checked(&appointment, window)
            .await
        {
            let err = conflict_from(doctor.doctor_id, at)(e);
            if matches!(err, AppointmentError::Conflict { .. }) {
                tracing::warn!(doctor_id = %doctor.doctor_id, %at, "booking rejected: slot unavailable");
            }
            return Err(err);
        }

        tracing::info!(
            appointment_id = %appointment.appointment_id,
            doctor_id = %appointment.doctor_id,
            patient_id = %appointment.patient_id,
            at = %appointment.appointment_date,
            "appointment booked"
        );

        Ok(AppointmentView {
            patient: Some(patient.brief()),
            doctor: Some(doctor.brief()),
            appointment,
        })
    }

    pub async fn get(&self, appointment_id: Uuid) -> Result<AppointmentView, AppointmentError> {
        let appointment = self.load(appointment_id).await?;
        self.resolve_one(appointment).await
    }

    pub async fn update(
        &self,
        caller: &Caller,
        appointment_id: Uuid,
        changes: AppointmentChanges,
    ) -> Result<AppointmentView, AppointmentError> {
        tracing::debug!(%appointment_id, ?changes, "updating appointment");
        let new_date = changes
            .appointment_date
            .as_deref()
            .map(|raw| self.parse_instant(raw))
            .transpose()?;

        let current = self.load(appointment_id).await?;
        if let Some(doctor_id) = changes.doctor_id.filter(|d| *d != current.doctor_id) {
            self.require_doctor(doctor_id).await?;
        }
        if let Some(patient_id) = changes.patient_id.filter(|p| *p != current.patient_id) {
            self.require_patient(patient_id).await?;
        }

        // slot is re-checked only when the edit moves both doctor and time
        let recheck = match (changes.doctor_id, new_date) {
            (Some(_), Some(at)) => Some(SlotWindow::around(at)?),
            _ => None,
        };

        let now = self.now();
        let Modified { after, .. } = self
            .modify(appointment_id, |a| {
                if let Some(doctor_id) = changes.doctor_id {
                    a.doctor_id = doctor_id;
                }
                if let Some(patient_id) = changes.patient_id {
                    a.patient_id = patient_id;
                }
                if let Some(department) = changes.department {
                    a.department = department;
                }
                if let Some(reason) = changes.reason {
                    a.reason = reason;
                }
                if let Some(notes) = &changes.notes {
                    a.notes = clean_notes(notes.clone());
                }
                if let Some(at) = new_date {
                    a.appointment_date = at;
                }
                a.updated_by = Some(caller.user_id);
                a.updated_at = now;

                Ok(match recheck {
                    Some(window) => Write::Rechecked(window),
                    None => Write::Plain,
                })
            })
            .await?;

        tracing::info!(%appointment_id, "appointment updated");
        self.resolve_one(after).await
    }

    /// Administrative hard delete.
    pub async fn delete(&self, appointment_id: Uuid) -> Result<(), AppointmentError> {
        if !self.store.remove(appointment_id).await? {
            return Err(AppointmentError::NotFound {
                entity: Entity::Appointment,
                id: appointment_id,
            });
        }
        tracing::info!(%appointment_id, "appointment deleted");
        Ok(())
    }

    pub async fn update_status(
        &self,
        caller: &Caller,
        appointment_id: Uuid,
        requested: &str,
    ) -> Result<StatusChange, AppointmentError> {
        tracing::debug!(%appointment_id, requested, "changing appointment status");
        let to: AppointmentStatus = requested
            .trim()
            .parse()
            .map_err(|_| AppointmentError::InvalidStatus(requested.to_string()))?;

        let now = self.now();
        let Modified { before, after } = self
            .modify(appointment_id, |a| {
                let from = a.status;
                let outcome = authorize_transition(from, to, caller).inspect_err(|_| {
                    tracing::warn!(%appointment_id, %from, %to, user_id = %caller.user_id, "status transition rejected");
                })?;
                if outcome == TransitionOutcome::Unchanged {
                    return Ok(Write::Skip);
                }

                a.status = to;
                if to == AppointmentStatus::Completed {
                    a.completed_at = Some(now);
                }
                a.updated_by = Some(caller.user_id);
                a.updated_at = now;

                // a cancelled appointment gave its slot up; taking it back must re-check
                if from == AppointmentStatus::Cancelled {
                    return Ok(Write::Rechecked(SlotWindow::around(a.appointment_date)?));
                }
                Ok(Write::Plain)
            })
            .await?;

        let from = before.status;
        if from != to {
            if !is_allowed(from, to) {
                tracing::warn!(
                    target: "audit",
                    user_id = %caller.user_id,
                    %appointment_id,
                    %from,
                    %to,
                    "status transition outside the allow-list by admin override"
                );
            }
            tracing::info!(%appointment_id, %from, %to, "appointment status changed");
        }

        Ok(StatusChange {
            previous_status: from,
            status: to,
            appointment: self.resolve_one(after).await?,
        })
    }

    /// Record a payment outcome. Moving into `paid` stamps the payment date and
    /// notifies finance exactly once.
    pub async fn update_payment(
        &self,
        caller: &Caller,
        appointment_id: Uuid,
        req: PaymentUpdate,
    ) -> Result<AppointmentView, AppointmentError> {
        tracing::debug!(%appointment_id, payment_status = %req.payment_status, "updating appointment payment");
        let status: PaymentStatus = req
            .payment_status
            .trim()
            .parse()
            .map_err(|_| AppointmentError::InvalidStatus(req.payment_status.clone()))?;
        let method: Option<PaymentMethod> = req
            .payment_method
            .as_deref()
            .map(|m| m.trim().parse::<PaymentMethod>())
            .transpose()
            .map_err(|e| AppointmentError::Validation(e.to_string()))?;

        if method.is_some() && status != PaymentStatus::Paid {
            return Err(AppointmentError::Validation(
                "payment_method can only be set when payment_status is 'paid'".into(),
            ));
        }

        let now = self.now();
        let Modified { before, after } = self
            .modify(appointment_id, |a| {
                if status == PaymentStatus::Paid {
                    let method = method.or(a.payment_method).ok_or_else(|| {
                        AppointmentError::Validation(
                            "payment_method is required when marking an appointment paid".into(),
                        )
                    })?;
                    a.payment_method = Some(method);
                    if a.payment_status != PaymentStatus::Paid {
                        a.payment_date = Some(now);
                    }
                }
                a.payment_status = status;
                a.updated_by = Some(caller.user_id);
                a.updated_at = now;
                Ok(Write::Plain)
            })
            .await?;

        // decided on the version the write replaced, so only one writer sees the move
        let newly_paid =
            after.payment_status == PaymentStatus::Paid && before.payment_status != PaymentStatus::Paid;
        if newly_paid {
            if let (Some(payment_method), Some(paid_at)) = (after.payment_method, after.payment_date) {
                let event = PaymentReceived {
                    appointment_id,
                    appointment_version: after.version,
                    patient_id: after.patient_id,
                    doctor_id: after.doctor_id,
                    department: after.department,
                    amount_cents: after.amount_cents,
                    payment_method,
                    paid_at,
                    recorded_by: caller.user_id,
                };
                if let Err(e) = self.finance.payment_received(&event).await {
                    tracing::error!(%appointment_id, "revenue record failed: {e}");
                    return Err(AppointmentError::Finance(e.to_string()));
                }
            }
        }

        tracing::info!(%appointment_id, payment_status = %status, "appointment payment updated");
        self.resolve_one(after).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::testing::{at, Harness};

    fn booking(h: &Harness, when: &str) -> NewAppointment {
        NewAppointment {
            patient_id: h.patient_id,
            doctor_id: h.doctor_id,
            department: Department::General,
            appointment_date: when.to_string(),
            reason: VisitReason::Consultation,
            notes: None,
        }
    }

    #[tokio::test]
    async fn booking_window_boundaries() {
        let h = Harness::new("2024-06-01T08:00:00");
        let svc = &h.service;
        svc.create(&h.staff, booking(&h, "2024-06-10T10:00:00")).await.unwrap();

        let err = svc
            .create(&h.staff, booking(&h, "2024-06-10T10:25:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::Conflict { .. }));

        svc.create(&h.staff, booking(&h, "2024-06-10T10:30:00")).await.unwrap();
        svc.create(&h.staff, booking(&h, "2024-06-10T09:29:59")).await.unwrap();
    }

    #[tokio::test]
    async fn exact_boundary_before_is_accepted() {
        let h = Harness::new("2024-06-01T08:00:00");
        h.service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap();
        h.service
            .create(&h.staff, booking(&h, "2024-06-10T09:30:00"))
            .await
            .unwrap();
        let err = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T09:30:01"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::Conflict { conflicting, .. } if conflicting.len() == 2));
    }

    #[tokio::test]
    async fn cancelled_appointments_free_the_slot() {
        let h = Harness::new("2024-06-01T08:00:00");
        let first = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap();
        h.service
            .update_status(&h.staff, first.appointment.appointment_id, "cancelled")
            .await
            .unwrap();
        h.service
            .create(&h.staff, booking(&h, "2024-06-10T10:10:00"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn booking_copies_fee_and_defaults() {
        let h = Harness::new("2024-06-01T08:00:00");
        let view = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap();
        let a = &view.appointment;
        assert_eq!(a.amount_cents, h.fee_cents);
        assert_eq!(a.status, AppointmentStatus::Upcoming);
        assert_eq!(a.payment_status, PaymentStatus::Pending);
        assert_eq!(a.created_by, Some(h.staff.user_id));
        assert_eq!(view.doctor.as_ref().map(|d| d.display.as_str()), Some("Gregory House"));
    }

    #[tokio::test]
    async fn booking_requires_known_doctor_and_patient() {
        let h = Harness::new("2024-06-01T08:00:00");
        let mut req = booking(&h, "2024-06-10T10:00:00");
        req.doctor_id = Uuid::new_v4();
        let err = h.service.create(&h.staff, req).await.unwrap_err();
        assert!(matches!(err, AppointmentError::NotFound { entity: Entity::Doctor, .. }));

        let mut req = booking(&h, "2024-06-10T10:00:00");
        req.patient_id = Uuid::new_v4();
        let err = h.service.create(&h.staff, req).await.unwrap_err();
        assert!(matches!(err, AppointmentError::NotFound { entity: Entity::Patient, .. }));
    }

    #[tokio::test]
    async fn availability_reports_the_just_created_appointment() {
        let h = Harness::new("2024-06-01T08:00:00");
        let created = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap();

        let availability = h
            .service
            .check_availability(h.doctor_id, at("2024-06-10T10:00:00"), None)
            .await
            .unwrap();
        assert!(!availability.available);
        assert_eq!(
            availability.conflicts[0].appointment_id,
            created.appointment.appointment_id
        );

        let excluded = h
            .service
            .check_availability(
                h.doctor_id,
                at("2024-06-10T10:00:00"),
                Some(created.appointment.appointment_id),
            )
            .await
            .unwrap();
        assert!(excluded.available);
    }

    #[tokio::test]
    async fn skipping_to_completed_needs_admin() {
        let h = Harness::new("2024-06-01T08:00:00");
        let id = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;

        let err = h.service.update_status(&h.staff, id, "completed").await.unwrap_err();
        match err {
            AppointmentError::InvalidTransition { allowed, .. } => assert_eq!(
                allowed,
                vec![
                    AppointmentStatus::CheckIn,
                    AppointmentStatus::Cancelled,
                    AppointmentStatus::Rescheduled,
                    AppointmentStatus::NoShow,
                ]
            ),
            other => panic!("unexpected {other:?}"),
        }

        let change = h.service.update_status(&h.admin, id, "completed").await.unwrap();
        assert_eq!(change.previous_status, AppointmentStatus::Upcoming);
        assert_eq!(change.status, AppointmentStatus::Completed);
        assert_eq!(change.appointment.appointment.completed_at, Some(h.now));
    }

    #[tokio::test]
    async fn full_visit_walks_the_table_and_completed_is_terminal() {
        let h = Harness::new("2024-06-01T08:00:00");
        let id = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;

        for next in ["check-in", "check-out", "completed"] {
            h.service.update_status(&h.staff, id, next).await.unwrap();
        }
        let stored = h.service.get(id).await.unwrap().appointment;
        assert_eq!(stored.status, AppointmentStatus::Completed);
        assert!(stored.completed_at.is_some());

        let same = h.service.update_status(&h.staff, id, "completed").await.unwrap();
        assert_eq!(same.previous_status, same.status);

        let err = h.service.update_status(&h.staff, id, "upcoming").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot change status from 'completed' to 'upcoming'. Allowed transitions: none"
        );
    }

    #[tokio::test]
    async fn unknown_status_and_missing_appointment() {
        let h = Harness::new("2024-06-01T08:00:00");
        let err = h
            .service
            .update_status(&h.staff, Uuid::new_v4(), "archived")
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::InvalidStatus(s) if s == "archived"));

        let err = h
            .service
            .update_status(&h.staff, Uuid::new_v4(), "cancelled")
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::NotFound { entity: Entity::Appointment, .. }));
    }

    #[tokio::test]
    async fn paying_notifies_finance_once() {
        let h = Harness::new("2024-06-01T08:00:00");
        let id = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;

        let err = h
            .service
            .update_payment(
                &h.staff,
                id,
                PaymentUpdate {
                    payment_status: "paid".into(),
                    payment_method: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::Validation(_)));

        let view = h
            .service
            .update_payment(
                &h.staff,
                id,
                PaymentUpdate {
                    payment_status: "paid".into(),
                    payment_method: Some("card".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(view.appointment.payment_status, PaymentStatus::Paid);
        assert_eq!(view.appointment.payment_date, Some(h.now));
        assert_eq!(view.appointment.payment_method, Some(PaymentMethod::Card));

        h.service
            .update_payment(
                &h.staff,
                id,
                PaymentUpdate {
                    payment_status: "paid".into(),
                    payment_method: None,
                },
            )
            .await
            .unwrap();

        let events = h.finance.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount_cents, h.fee_cents);
        assert_eq!(events[0].payment_method, PaymentMethod::Card);
    }

    #[tokio::test]
    async fn non_paid_outcomes_never_reach_finance() {
        let h = Harness::new("2024-06-01T08:00:00");
        let id = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;

        let view = h
            .service
            .update_payment(
                &h.staff,
                id,
                PaymentUpdate {
                    payment_status: "failed".into(),
                    payment_method: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(view.appointment.payment_status, PaymentStatus::Failed);
        assert!(view.appointment.payment_date.is_none());

        let err = h
            .service
            .update_payment(
                &h.staff,
                id,
                PaymentUpdate {
                    payment_status: "refunded".into(),
                    payment_method: Some("cash".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::Validation(_)));

        let err = h
            .service
            .update_payment(
                &h.staff,
                id,
                PaymentUpdate {
                    payment_status: "bounced".into(),
                    payment_method: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::InvalidStatus(_)));

        assert!(h.finance.events().await.is_empty());
    }

    #[tokio::test]
    async fn update_rechecks_only_when_doctor_and_date_both_change() {
        let h = Harness::new("2024-06-01T08:00:00");
        let other_doctor = h.add_doctor("Lisa", "Cuddy").await;

        let taken = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap();
        let mut req = booking(&h, "2024-06-10T14:00:00");
        req.doctor_id = other_doctor;
        let moving = h.service.create(&h.staff, req).await.unwrap();
        let moving_id = moving.appointment.appointment_id;

        let err = h
            .service
            .update(
                &h.staff,
                moving_id,
                AppointmentChanges {
                    doctor_id: Some(h.doctor_id),
                    appointment_date: Some("2024-06-10T10:15:00".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        match err {
            AppointmentError::Conflict { conflicting, .. } => {
                assert_eq!(conflicting, vec![taken.appointment.appointment_id])
            }
            other => panic!("unexpected {other:?}"),
        }

        let moved = h
            .service
            .update(
                &h.staff,
                moving_id,
                AppointmentChanges {
                    doctor_id: Some(h.doctor_id),
                    appointment_date: Some("2024-06-10T10:30:00".into()),
                    notes: Some(Some("  moved by phone ".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.appointment.doctor_id, h.doctor_id);
        assert_eq!(moved.appointment.notes.as_deref(), Some("moved by phone"));
        assert_eq!(moved.appointment.updated_by, Some(h.staff.user_id));

        let cleared = h
            .service
            .update(
                &h.staff,
                moving_id,
                AppointmentChanges {
                    notes: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.appointment.notes.is_none());
    }

    #[tokio::test]
    async fn update_rejects_unknown_doctor() {
        let h = Harness::new("2024-06-01T08:00:00");
        let id = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;
        let err = h
            .service
            .update(
                &h.staff,
                id,
                AppointmentChanges {
                    doctor_id: Some(Uuid::new_v4()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::NotFound { entity: Entity::Doctor, .. }));
    }

    #[test]
    fn general_update_refuses_status_fields() {
        let parsed: Result<AppointmentChanges, _> =
            serde_json::from_value(serde_json::json!({ "status": "completed" }));
        assert!(parsed.is_err());

        let parsed: AppointmentChanges =
            serde_json::from_value(serde_json::json!({ "notes": null })).unwrap();
        assert_eq!(parsed.notes, Some(None));
    }

    #[tokio::test]
    async fn delete_is_permanent() {
        let h = Harness::new("2024-06-01T08:00:00");
        let id = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;
        h.service.delete(id).await.unwrap();
        assert!(matches!(
            h.service.get(id).await,
            Err(AppointmentError::NotFound { .. })
        ));
        assert!(matches!(
            h.service.delete(id).await,
            Err(AppointmentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn today_upcoming_and_past_windows() {
        let h = Harness::new("2024-06-10T12:00:00");
        let yesterday = h
            .service
            .create(&h.staff, booking(&h, "2024-06-09T15:00:00"))
            .await
            .unwrap();
        let this_morning = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T08:00:00"))
            .await
            .unwrap();
        let tonight = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T20:00:00"))
            .await
            .unwrap();
        let tomorrow = h
            .service
            .create(&h.staff, booking(&h, "2024-06-11T09:00:00"))
            .await
            .unwrap();
        h.service
            .update_status(&h.staff, tomorrow.appointment.appointment_id, "cancelled")
            .await
            .unwrap();
        // starts exactly now: neither upcoming nor past
        h.service
            .create(&h.staff, booking(&h, "2024-06-10T12:00:00"))
            .await
            .unwrap();

        let ids = |views: Vec<AppointmentView>| -> Vec<Uuid> {
            views.into_iter().map(|v| v.appointment.appointment_id).collect()
        };

        let today = h.service.today().await.unwrap();
        assert_eq!(today.len(), 3);
        assert!(today.iter().all(|v| v.appointment.appointment_date.date_naive() == h.now.date_naive()));

        let upcoming = ids(h.service.upcoming().await.unwrap());
        assert_eq!(upcoming, vec![tonight.appointment.appointment_id]);

        let past = ids(h.service.past().await.unwrap());
        assert_eq!(
            past,
            vec![
                this_morning.appointment.appointment_id,
                yesterday.appointment.appointment_id
            ]
        );
    }

    #[tokio::test]
    async fn list_pages_filters_and_searches_by_name() {
        let h = Harness::new("2024-06-01T08:00:00");
        let wilson = h.add_doctor("James", "Wilson").await;
        for hour in 8..15 {
            h.service
                .create(&h.staff, booking(&h, &format!("2024-06-10T{hour:02}:00:00")))
                .await
                .unwrap();
        }
        let mut req = booking(&h, "2024-06-11T09:00:00");
        req.doctor_id = wilson;
        req.department = Department::Cardiology;
        h.service.create(&h.staff, req).await.unwrap();

        let page = h
            .service
            .list(ListFilter::default(), PageRequest::new(Some(2), Some(3)))
            .await
            .unwrap();
        assert_eq!(page.total, 8);
        assert_eq!(page.pages, 3);
        assert_eq!(page.appointments.len(), 3);
        assert_eq!(
            page.appointments[0].appointment.appointment_date,
            at("2024-06-10T11:00:00")
        );

        let by_day = h
            .service
            .list(
                ListFilter {
                    date: Some(h.service.parse_day("2024-06-11").unwrap()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_day.total, 1);

        let by_name = h
            .service
            .list(
                ListFilter {
                    search: Some("wILSon".into()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_name.total, 1);
        assert_eq!(by_name.appointments[0].appointment.doctor_id, wilson);

        let by_department = h
            .service
            .list(
                ListFilter {
                    department: Some(Department::Cardiology),
                    doctor_id: Some(h.doctor_id),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_department.total, 0);
        assert_eq!(by_department.pages, 0);
    }

    #[tokio::test]
    async fn scoped_lists_are_most_recent_first() {
        let h = Harness::new("2024-06-01T08:00:00");
        for day in 10..13 {
            h.service
                .create(&h.staff, booking(&h, &format!("2024-06-{day}T10:00:00")))
                .await
                .unwrap();
        }
        let doctor_page = h
            .service
            .for_doctor(h.doctor_id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(
            doctor_page.appointments[0].appointment.appointment_date,
            at("2024-06-12T10:00:00")
        );
        let patient_page = h
            .service
            .for_patient(h.patient_id, PageRequest::new(Some(1), Some(2)))
            .await
            .unwrap();
        assert_eq!(patient_page.total, 3);
        assert_eq!(patient_page.pages, 2);
        assert_eq!(patient_page.appointments.len(), 2);
        assert_eq!(
            patient_page.appointments[1].appointment.appointment_date,
            at("2024-06-11T10:00:00")
        );
        let empty = h
            .service
            .for_patient(Uuid::new_v4(), PageRequest::default())
            .await
            .unwrap();
        assert!(empty.appointments.is_empty());
    }

    #[tokio::test]
    async fn concurrent_status_and_payment_edits_both_land() {
        let h = Harness::interleaved("2024-06-01T08:00:00");
        let id = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;

        let (paid, checked_in) = tokio::join!(
            h.service.update_payment(
                &h.staff,
                id,
                PaymentUpdate {
                    payment_status: "paid".into(),
                    payment_method: Some("cash".into()),
                },
            ),
            h.service.update_status(&h.staff, id, "check-in"),
        );
        paid.unwrap();
        assert_eq!(checked_in.unwrap().previous_status, AppointmentStatus::Upcoming);

        let stored = h.service.get(id).await.unwrap().appointment;
        assert_eq!(stored.status, AppointmentStatus::CheckIn);
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(stored.payment_method, Some(PaymentMethod::Cash));
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn concurrent_paid_updates_notify_finance_once() {
        let h = Harness::interleaved("2024-06-01T08:00:00");
        let id = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;
        let paid = || PaymentUpdate {
            payment_status: "paid".into(),
            payment_method: Some("card".into()),
        };

        let (first, second) = tokio::join!(
            h.service.update_payment(&h.staff, id, paid()),
            h.service.update_payment(&h.admin, id, paid()),
        );
        first.unwrap();
        second.unwrap();

        let events = h.finance.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].appointment_id, id);
        assert_eq!(events[0].appointment_version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_bookings_of_one_slot_admit_exactly_one() {
        let h = Harness::new("2024-06-01T08:00:00");

        let mut handles = Vec::new();
        for when in ["2024-06-10T10:00:00", "2024-06-10T10:00:00", "2024-06-10T10:15:00"] {
            let service = h.service.clone();
            let caller = h.staff;
            let req = booking(&h, when);
            handles.push(tokio::spawn(async move { service.create(&caller, req).await }));
        }

        let mut booked = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => booked += 1,
                Err(AppointmentError::Conflict { conflicting, .. }) => {
                    assert_eq!(conflicting.len(), 1);
                    rejected += 1;
                }
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!((booked, rejected), (1, 2));
    }

    #[tokio::test]
    async fn reactivating_a_cancelled_appointment_rechecks_its_slot() {
        let h = Harness::new("2024-06-01T08:00:00");
        let first = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:00:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;
        h.service.update_status(&h.staff, first, "cancelled").await.unwrap();
        let replacement = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T10:10:00"))
            .await
            .unwrap()
            .appointment
            .appointment_id;

        for target in ["upcoming", "rescheduled"] {
            let err = h.service.update_status(&h.staff, first, target).await.unwrap_err();
            match err {
                AppointmentError::Conflict { conflicting, .. } => assert_eq!(conflicting, vec![replacement]),
                other => panic!("unexpected {other:?}"),
            }
        }
        // admin override does not skip the slot either
        assert!(matches!(
            h.service.update_status(&h.admin, first, "check-in").await,
            Err(AppointmentError::Conflict { .. })
        ));
        assert_eq!(
            h.service.get(first).await.unwrap().appointment.status,
            AppointmentStatus::Cancelled
        );

        h.service.update_status(&h.staff, replacement, "cancelled").await.unwrap();
        let change = h.service.update_status(&h.staff, first, "upcoming").await.unwrap();
        assert_eq!(change.status, AppointmentStatus::Upcoming);
    }

    #[tokio::test]
    async fn out_of_range_dates_are_validation_errors() {
        let h = Harness::new("2024-06-01T08:00:00");
        let err = h
            .service
            .create(&h.staff, booking(&h, "+262142-12-31T23:59"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::Validation(_)));

        let err = h
            .service
            .check_availability(h.doctor_id, DateTime::<Utc>::MAX_UTC, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppointmentError::Validation(_)));
    }

    #[tokio::test]
    async fn date_filter_keeps_the_last_instant_of_the_day_and_drops_midnight() {
        let h = Harness::new("2024-06-01T08:00:00");
        let night_doctor = h.add_doctor("Allison", "Cameron").await;
        let late = h
            .service
            .create(&h.staff, booking(&h, "2024-06-10T23:59:59.9995"))
            .await
            .unwrap()
            .appointment
            .appointment_id;
        let mut req = booking(&h, "2024-06-11T00:00:00");
        req.doctor_id = night_doctor;
        h.service.create(&h.staff, req).await.unwrap();

        let page = h
            .service
            .list(
                ListFilter {
                    date: Some(h.service.parse_day("2024-06-10").unwrap()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.appointments[0].appointment.appointment_id, late);
    }

    #[test]
    fn role_used_by_harness_is_not_elevated() {
        let h = Harness::new("2024-06-01T08:00:00");
        assert_eq!(h.staff.role, Role::Receptionist);
        assert!(!h.staff.can_override_transitions());
    }
}
