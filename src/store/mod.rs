// src/store/mod.rs

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::Appointment;
use crate::scheduling::conflict::SlotWindow;
use crate::scheduling::query::AppointmentQuery;

pub mod memory;
pub mod postgres;

pub use memory::MemoryAppointmentStore;
pub use postgres::PgAppointmentStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The slot check done together with the write found these appointments.
    #[error("slot taken by {} appointment(s)", .0.len())]
    SlotTaken(Vec<Uuid>),

    #[error("corrupt appointment row: {0}")]
    Corrupt(String),

    /// The stored row no longer carries the version the write was based on.
    #[error("appointment {0} was modified concurrently")]
    Stale(Uuid),
}

/// Persistence for appointments.
///
/// The `*_checked` style writes (`insert_checked`, and `replace` with a window)
/// run the conflict query and the write as one atomic step, so two concurrent
/// bookings of the same doctor cannot both succeed.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Insert `appointment` unless another live appointment of the same doctor
    /// starts inside `window`.
    async fn insert_checked(&self, appointment: &Appointment, window: SlotWindow) -> Result<(), StoreError>;

    /// Overwrite an existing record if it is still at `expected_version`; the
    /// stored version becomes `appointment.version`. Fails with
    /// `StoreError::Stale` when someone else wrote in between. With
    /// `Some(window)` the slot is re-checked atomically, excluding the
    /// appointment itself. Returns `false` when the id is unknown.
    async fn replace(
        &self,
        appointment: &Appointment,
        expected_version: i64,
        window: Option<SlotWindow>,
    ) -> Result<bool, StoreError>;

    async fn fetch(&self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError>;

    /// Returns `false` when the id is unknown.
    async fn remove(&self, appointment_id: Uuid) -> Result<bool, StoreError>;

    /// Live (non-cancelled) appointments of `doctor_id` starting strictly inside
    /// `window`, ascending by start.
    async fn conflicts(
        &self,
        doctor_id: Uuid,
        window: SlotWindow,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// Matching page plus the total match count ignoring offset/limit.
    async fn query(&self, query: &AppointmentQuery) -> Result<(Vec<Appointment>, u64), StoreError>;
}
