// src/directory/postgres.rs

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::directory::{Directory, DoctorProfile, PatientProfile, SearchHits};
use crate::scheduling::query::escape_like;
use crate::store::StoreError;

pub struct PgDirectory {
    db: PgPool,
}

impl PgDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn doctor(&self, doctor_id: Uuid) -> Result<Option<DoctorProfile>, StoreError> {
        let row = sqlx::query_as::<_, DoctorProfile>(
            r#"
            SELECT doctor_id, first_name, last_name, department, consultation_fee_cents
            FROM doctor
            WHERE doctor_id = $1
            "#,
        )
        .bind(doctor_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn patient(&self, patient_id: Uuid) -> Result<Option<PatientProfile>, StoreError> {
        let row = sqlx::query_as::<_, PatientProfile>(
            r#"
            SELECT patient_id, first_name, last_name
            FROM patient
            WHERE patient_id = $1
            "#,
        )
        .bind(patient_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn doctors(&self, ids: &[Uuid]) -> Result<Vec<DoctorProfile>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query_as::<_, DoctorProfile>(
            r#"
            SELECT doctor_id, first_name, last_name, department, consultation_fee_cents
            FROM doctor
            WHERE doctor_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn patients(&self, ids: &[Uuid]) -> Result<Vec<PatientProfile>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query_as::<_, PatientProfile>(
            r#"
            SELECT patient_id, first_name, last_name
            FROM patient
            WHERE patient_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn search(&self, needle: &str) -> Result<SearchHits, StoreError> {
        let like = format!("%{}%", escape_like(needle.trim()));

        let patient_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT patient_id
            FROM patient
            WHERE first_name ILIKE $1 OR last_name ILIKE $1
            "#,
        )
        .bind(&like)
        .fetch_all(&self.db)
        .await?;

        let doctor_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT doctor_id
            FROM doctor
            WHERE first_name ILIKE $1 OR last_name ILIKE $1
            "#,
        )
        .bind(&like)
        .fetch_all(&self.db)
        .await?;

        Ok(SearchHits {
            patient_ids,
            doctor_ids,
        })
    }
}
