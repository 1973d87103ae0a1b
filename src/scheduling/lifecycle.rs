// src/scheduling/lifecycle.rs

use crate::error::AppointmentError;
use crate::models::{AppointmentStatus, Caller};

use AppointmentStatus::*;

/// Hand-authored business policy. Changing a row here is a product decision.
pub fn allowed_transitions(from: AppointmentStatus) -> &'static [AppointmentStatus] {
    match from {
        Upcoming => &[CheckIn, Cancelled, Rescheduled, NoShow],
        CheckIn => &[CheckOut, Cancelled, NoShow],
        CheckOut => &[Completed, Cancelled],
        Completed => &[],
        Cancelled => &[Upcoming, Rescheduled],
        Rescheduled => &[Upcoming, Cancelled],
        NoShow => &[Upcoming, Rescheduled],
    }
}

pub fn is_allowed(from: AppointmentStatus, to: AppointmentStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Requested status equals the current one; nothing to write.
    Unchanged,
    Allowed,
    /// Not in the table, accepted because the caller is elevated.
    Overridden,
}

pub fn authorize_transition(
    from: AppointmentStatus,
    to: AppointmentStatus,
    caller: &Caller,
) -> Result<TransitionOutcome, AppointmentError> {
    if from == to {
        return Ok(TransitionOutcome::Unchanged);
    }
    if is_allowed(from, to) {
        return Ok(TransitionOutcome::Allowed);
    }
    if caller.can_override_transitions() {
        return Ok(TransitionOutcome::Overridden);
    }
    Err(AppointmentError::InvalidTransition {
        from,
        to,
        allowed: allowed_transitions(from).to_vec(),
    })
}
