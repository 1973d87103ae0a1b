// src/finance/mod.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Department, PaymentMethod};
use crate::store::StoreError;

/// Emitted once when an appointment's payment status becomes `paid`.
/// `(appointment_id, appointment_version)` identifies the payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReceived {
    pub appointment_id: Uuid,
    pub appointment_version: i64,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub department: Department,
    pub amount_cents: i64,
    pub payment_method: PaymentMethod,
    pub paid_at: DateTime<Utc>,
    pub recorded_by: Uuid,
}

/// Receiver of payment events; owns revenue bookkeeping.
#[async_trait]
pub trait FinanceSink: Send + Sync {
    async fn payment_received(&self, event: &PaymentReceived) -> Result<(), StoreError>;
}

/// Writes one `revenue` row per payment; a replayed event is ignored.
pub struct PgRevenueSink {
    db: PgPool,
}

impl PgRevenueSink {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FinanceSink for PgRevenueSink {
    async fn payment_received(&self, event: &PaymentReceived) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO revenue (
              appointment_id,
              patient_id,
              doctor_id,
              department,
              amount_cents,
              payment_method,
              paid_at,
              recorded_by_user_id,
              appointment_version
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (appointment_id, appointment_version) DO NOTHING
            "#,
        )
        .bind(event.appointment_id)
        .bind(event.patient_id)
        .bind(event.doctor_id)
        .bind(event.department.as_str())
        .bind(event.amount_cents)
        .bind(event.payment_method.as_str())
        .bind(event.paid_at)
        .bind(event.recorded_by)
        .bind(event.appointment_version)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
