use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::middleware::auth_context::SessionResolver;
use crate::scheduling::service::AppointmentService;

#[derive(Clone)]
pub struct AppState {
    pub appointments: Arc<AppointmentService>,
    pub sessions: Arc<dyn SessionResolver>,
}

/* -------------------------
   API envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PersonBrief {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub display: String,
}

impl PersonBrief {
    pub fn new(id: Uuid, first_name: &str, last_name: &str) -> Self {
        Self {
            id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            display: format!("{first_name} {last_name}"),
        }
    }
}

/* -------------------------
   Enumerations
--------------------------*/

/// Error returned when a string does not name a variant of one of the
/// appointment enumerations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

// Each enum is stored as its display string, so one macro keeps the
// serde names, the DB text and FromStr in agreement.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(Department, "department", {
    Cardiology => "Cardiology",
    Neurology => "Neurology",
    Orthopedics => "Orthopedics",
    Pediatrics => "Pediatrics",
    Emergency => "Emergency",
    General => "General",
});

text_enum!(VisitReason, "reason", {
    Consultation => "Consultation",
    FollowUp => "Follow-up",
    Procedure => "Procedure",
    Emergency => "Emergency",
    RoutineCheckUp => "Routine Check-up",
});

text_enum!(AppointmentStatus, "status", {
    Upcoming => "upcoming",
    CheckIn => "check-in",
    CheckOut => "check-out",
    Completed => "completed",
    Cancelled => "cancelled",
    Rescheduled => "rescheduled",
    NoShow => "no-show",
});

text_enum!(PaymentStatus, "payment status", {
    Pending => "pending",
    Paid => "paid",
    Refunded => "refunded",
    Failed => "failed",
});

text_enum!(PaymentMethod, "payment method", {
    Cash => "cash",
    Card => "card",
    Insurance => "insurance",
    Online => "online",
});

/* -------------------------
   Appointment
--------------------------*/

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Appointment {
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    pub department: Department,
    pub appointment_date: DateTime<Utc>,
    pub reason: VisitReason,
    pub notes: Option<String>,
    pub status: AppointmentStatus,
    pub payment_status: PaymentStatus,
    pub amount_cents: i64,
    pub payment_method: Option<PaymentMethod>,
    pub payment_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; a write only lands on the version it was computed from.
    #[serde(skip)]
    pub version: i64,
}

/// An appointment with its patient and doctor resolved for display.
/// A brief is `None` when the directory no longer knows the id.
#[derive(Debug, Clone, Serialize)]
pub struct AppointmentView {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub patient: Option<PersonBrief>,
    pub doctor: Option<PersonBrief>,
}

/* -------------------------
   Caller
--------------------------*/

/// Role mapping as stored in app_user.roles:
/// 0 Patient, 1 Admin, 2 Manager, 3 Doctor, 4 Receptionist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Admin,
    Manager,
    Doctor,
    Receptionist,
    Unknown,
}

impl Role {
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => Role::Patient,
            1 => Role::Admin,
            2 => Role::Manager,
            3 => Role::Doctor,
            4 => Role::Receptionist,
            _ => Role::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    /// Elevated callers may move an appointment to any status.
    pub fn can_override_transitions(&self) -> bool {
        self.role == Role::Admin
    }
}
