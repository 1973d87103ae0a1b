// src/scheduling/conflict.rs

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppointmentError;
use crate::models::{Appointment, AppointmentStatus};

/// Every appointment occupies a fixed 30 minute slot; two bookings for the same
/// doctor collide when their starts are less than this far apart.
pub const SLOT_RADIUS_MINUTES: i64 = 30;

pub fn slot_radius() -> Duration {
    Duration::minutes(SLOT_RADIUS_MINUTES)
}

/// Open interval `(start, end)` around a proposed start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SlotWindow {
    /// Fails only at the edges of the representable calendar.
    pub fn around(proposed_start: DateTime<Utc>) -> Result<Self, AppointmentError> {
        let out_of_range =
            || AppointmentError::Validation(format!("appointment time {proposed_start} is out of range"));
        Ok(Self {
            start: proposed_start
                .checked_sub_signed(slot_radius())
                .ok_or_else(out_of_range)?,
            end: proposed_start
                .checked_add_signed(slot_radius())
                .ok_or_else(out_of_range)?,
        })
    }

    /// Strict on both ends: an appointment exactly one radius away does not collide.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start < at && at < self.end
    }
}

/// Whether `existing` blocks a booking for `doctor_id` inside `window`.
pub fn blocks(
    existing: &Appointment,
    doctor_id: Uuid,
    window: &SlotWindow,
    exclude: Option<Uuid>,
) -> bool {
    existing.doctor_id == doctor_id
        && existing.status != AppointmentStatus::Cancelled
        && Some(existing.appointment_id) != exclude
        && window.contains(existing.appointment_date)
}

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub available: bool,
    pub conflicts: Vec<Appointment>,
}

impl Availability {
    pub fn from_conflicts(conflicts: Vec<Appointment>) -> Self {
        Self {
            available: conflicts.is_empty(),
            conflicts,
        }
    }
}
