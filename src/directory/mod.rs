// src/directory/mod.rs

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::models::PersonBrief;
use crate::store::StoreError;

pub mod postgres;

pub use postgres::PgDirectory;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DoctorProfile {
    pub doctor_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub department: Option<String>,
    pub consultation_fee_cents: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PatientProfile {
    pub patient_id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

impl DoctorProfile {
    pub fn brief(&self) -> PersonBrief {
        PersonBrief::new(self.doctor_id, &self.first_name, &self.last_name)
    }
}

impl PatientProfile {
    pub fn brief(&self) -> PersonBrief {
        PersonBrief::new(self.patient_id, &self.first_name, &self.last_name)
    }
}

/// Ids whose first or last name contains a search needle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub patient_ids: Vec<Uuid>,
    pub doctor_ids: Vec<Uuid>,
}

/// Doctor and patient profiles live outside the appointment engine; this is
/// the read-only view the engine needs of them.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn doctor(&self, doctor_id: Uuid) -> Result<Option<DoctorProfile>, StoreError>;
    async fn patient(&self, patient_id: Uuid) -> Result<Option<PatientProfile>, StoreError>;
    async fn doctors(&self, ids: &[Uuid]) -> Result<Vec<DoctorProfile>, StoreError>;
    async fn patients(&self, ids: &[Uuid]) -> Result<Vec<PatientProfile>, StoreError>;
    /// Case-insensitive substring match on first or last name.
    async fn search(&self, needle: &str) -> Result<SearchHits, StoreError>;
}
