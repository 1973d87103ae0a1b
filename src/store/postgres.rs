// src/store/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::models::Appointment;
use crate::scheduling::conflict::SlotWindow;
use crate::scheduling::query::{escape_like, AppointmentQuery, SortOrder};
use crate::store::{AppointmentStore, StoreError};

const APPOINTMENT_COLUMNS: &str = r#"
  a.appointment_id,
  a.patient_id,
  a.doctor_id,
  a.created_by_user_id,
  a.updated_by_user_id,
  a.department,
  a.appointment_date,
  a.reason,
  a.notes,
  a.status,
  a.payment_status,
  a.amount_cents,
  a.payment_method,
  a.payment_date,
  a.completed_at,
  a.created_at,
  a.updated_at,
  a.version
"#;

#[derive(Debug, sqlx::FromRow)]
struct AppointmentRow {
    appointment_id: Uuid,
    patient_id: Uuid,
    doctor_id: Uuid,
    created_by_user_id: Option<Uuid>,
    updated_by_user_id: Option<Uuid>,
    department: String,
    appointment_date: DateTime<Utc>,
    reason: String,
    notes: Option<String>,
    status: String,
    payment_status: String,
    amount_cents: i64,
    payment_method: Option<String>,
    payment_date: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<AppointmentRow> for Appointment {
    type Error = StoreError;

    fn try_from(r: AppointmentRow) -> Result<Self, Self::Error> {
        let corrupt = |e: crate::models::UnknownVariant| {
            StoreError::Corrupt(format!("appointment {}: {e}", r.appointment_id))
        };
        Ok(Appointment {
            appointment_id: r.appointment_id,
            patient_id: r.patient_id,
            doctor_id: r.doctor_id,
            created_by: r.created_by_user_id,
            updated_by: r.updated_by_user_id,
            department: r.department.parse().map_err(corrupt)?,
            appointment_date: r.appointment_date,
            reason: r.reason.parse().map_err(corrupt)?,
            notes: r.notes.clone(),
            status: r.status.parse().map_err(corrupt)?,
            payment_status: r.payment_status.parse().map_err(corrupt)?,
            amount_cents: r.amount_cents,
            payment_method: r
                .payment_method
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(corrupt)?,
            payment_date: r.payment_date,
            completed_at: r.completed_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
            version: r.version,
        })
    }
}

fn decode_all(rows: Vec<AppointmentRow>) -> Result<Vec<Appointment>, StoreError> {
    rows.into_iter().map(Appointment::try_from).collect()
}

pub struct PgAppointmentStore {
    db: PgPool,
}

impl PgAppointmentStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// Serialize writers per doctor for the rest of the transaction.
async fn lock_doctor(tx: &mut Transaction<'_, Postgres>, doctor_id: Uuid) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(doctor_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn conflicting_ids(
    tx: &mut Transaction<'_, Postgres>,
    doctor_id: Uuid,
    window: SlotWindow,
    exclude: Option<Uuid>,
) -> Result<Vec<Uuid>, StoreError> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT appointment_id
        FROM appointment
        WHERE doctor_id = $1
          AND status <> 'cancelled'
          AND appointment_date > $2
          AND appointment_date < $3
          AND ($4::uuid IS NULL OR appointment_id <> $4)
        ORDER BY appointment_date ASC
        "#,
    )
    .bind(doctor_id)
    .bind(window.start)
    .bind(window.end)
    .bind(exclude)
    .fetch_all(&mut **tx)
    .await?;
    Ok(ids)
}

fn push_filters<'a>(qb: &mut QueryBuilder<'a, Postgres>, q: &'a AppointmentQuery) {
    qb.push(" WHERE 1=1 ");

    if let Some(status) = q.status {
        qb.push(" AND a.status = ");
        qb.push_bind(status.as_str());
    }
    if let Some(status) = q.exclude_status {
        qb.push(" AND a.status <> ");
        qb.push_bind(status.as_str());
    }
    if let Some(department) = q.department {
        qb.push(" AND a.department = ");
        qb.push_bind(department.as_str());
    }
    if let Some(doctor_id) = q.doctor_id {
        qb.push(" AND a.doctor_id = ");
        qb.push_bind(doctor_id);
    }
    if let Some(patient_id) = q.patient_id {
        qb.push(" AND a.patient_id = ");
        qb.push_bind(patient_id);
    }
    if let Some(from) = q.from {
        qb.push(" AND a.appointment_date >= ");
        qb.push_bind(from);
    }
    if let Some(after) = q.after {
        qb.push(" AND a.appointment_date > ");
        qb.push_bind(after);
    }
    if let Some(before) = q.before {
        qb.push(" AND a.appointment_date < ");
        qb.push_bind(before);
    }
    if let Some(text) = &q.text {
        let like = format!("%{}%", escape_like(&text.needle));

        qb.push(" AND (a.patient_id = ANY(");
        qb.push_bind(&text.patient_ids[..]);
        qb.push(") OR a.doctor_id = ANY(");
        qb.push_bind(&text.doctor_ids[..]);
        qb.push(") OR a.reason ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR a.notes ILIKE ");
        qb.push_bind(like);
        qb.push(") ");
    }
}

async fn insert_row(tx: &mut Transaction<'_, Postgres>, a: &Appointment) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO appointment (
          appointment_id,
          patient_id,
          doctor_id,
          created_by_user_id,
          updated_by_user_id,
          department,
          appointment_date,
          reason,
          notes,
          status,
          payment_status,
          amount_cents,
          payment_method,
          payment_date,
          completed_at,
          created_at,
          updated_at,
          version
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
        "#,
    )
    .bind(a.appointment_id)
    .bind(a.patient_id)
    .bind(a.doctor_id)
    .bind(a.created_by)
    .bind(a.updated_by)
    .bind(a.department.as_str())
    .bind(a.appointment_date)
    .bind(a.reason.as_str())
    .bind(a.notes.as_deref())
    .bind(a.status.as_str())
    .bind(a.payment_status.as_str())
    .bind(a.amount_cents)
    .bind(a.payment_method.map(|m| m.as_str()))
    .bind(a.payment_date)
    .bind(a.completed_at)
    .bind(a.created_at)
    .bind(a.updated_at)
    .bind(a.version)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Compare-and-swap on `version`; `false` when no row is at `expected_version`.
async fn update_row(
    tx: &mut Transaction<'_, Postgres>,
    a: &Appointment,
    expected_version: i64,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE appointment
        SET
          patient_id = $2,
          doctor_id = $3,
          updated_by_user_id = $4,
          department = $5,
          appointment_date = $6,
          reason = $7,
          notes = $8,
          status = $9,
          payment_status = $10,
          amount_cents = $11,
          payment_method = $12,
          payment_date = $13,
          completed_at = $14,
          updated_at = $15,
          version = $16
        WHERE appointment_id = $1
          AND version = $17
        "#,
    )
    .bind(a.appointment_id)
    .bind(a.patient_id)
    .bind(a.doctor_id)
    .bind(a.updated_by)
    .bind(a.department.as_str())
    .bind(a.appointment_date)
    .bind(a.reason.as_str())
    .bind(a.notes.as_deref())
    .bind(a.status.as_str())
    .bind(a.payment_status.as_str())
    .bind(a.amount_cents)
    .bind(a.payment_method.map(|m| m.as_str()))
    .bind(a.payment_date)
    .bind(a.completed_at)
    .bind(a.updated_at)
    .bind(a.version)
    .bind(expected_version)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl AppointmentStore for PgAppointmentStore {
    async fn insert_checked(&self, appointment: &Appointment, window: SlotWindow) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await?;

        lock_doctor(&mut tx, appointment.doctor_id).await?;
        let taken = conflicting_ids(&mut tx, appointment.doctor_id, window, None).await?;
        if !taken.is_empty() {
            // dropping tx rolls back and releases the advisory lock
            return Err(StoreError::SlotTaken(taken));
        }
        insert_row(&mut tx, appointment).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn replace(
        &self,
        appointment: &Appointment,
        expected_version: i64,
        window: Option<SlotWindow>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.db.begin().await?;

        if let Some(window) = window {
            lock_doctor(&mut tx, appointment.doctor_id).await?;
            let taken = conflicting_ids(
                &mut tx,
                appointment.doctor_id,
                window,
                Some(appointment.appointment_id),
            )
            .await?;
            if !taken.is_empty() {
                return Err(StoreError::SlotTaken(taken));
            }
        }
        if !update_row(&mut tx, appointment, expected_version).await? {
            let exists: bool = sqlx::query_scalar(
                r#"SELECT EXISTS (SELECT 1 FROM appointment WHERE appointment_id = $1)"#,
            )
            .bind(appointment.appointment_id)
            .fetch_one(&mut *tx)
            .await?;
            if exists {
                return Err(StoreError::Stale(appointment.appointment_id));
            }
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn fetch(&self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointment a WHERE a.appointment_id = $1");
        let row: Option<AppointmentRow> = sqlx::query_as::<_, AppointmentRow>(&sql)
            .bind(appointment_id)
            .fetch_optional(&self.db)
            .await?;
        row.map(Appointment::try_from).transpose()
    }

    async fn remove(&self, appointment_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(r#"DELETE FROM appointment WHERE appointment_id = $1"#)
            .bind(appointment_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn conflicts(
        &self,
        doctor_id: Uuid,
        window: SlotWindow,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let sql = format!(
            r#"
            SELECT {APPOINTMENT_COLUMNS}
            FROM appointment a
            WHERE a.doctor_id = $1
              AND a.status <> 'cancelled'
              AND a.appointment_date > $2
              AND a.appointment_date < $3
              AND ($4::uuid IS NULL OR a.appointment_id <> $4)
            ORDER BY a.appointment_date ASC
            "#
        );
        let rows: Vec<AppointmentRow> = sqlx::query_as::<_, AppointmentRow>(&sql)
            .bind(doctor_id)
            .bind(window.start)
            .bind(window.end)
            .bind(exclude)
            .fetch_all(&self.db)
            .await?;
        decode_all(rows)
    }

    async fn query(&self, query: &AppointmentQuery) -> Result<(Vec<Appointment>, u64), StoreError> {
        let mut count: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM appointment a");
        push_filters(&mut count, query);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.db).await?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {APPOINTMENT_COLUMNS} FROM appointment a"));
        push_filters(&mut qb, query);

        match query.order {
            SortOrder::Ascending => qb.push(" ORDER BY a.appointment_date ASC, a.created_at ASC "),
            SortOrder::Descending => qb.push(" ORDER BY a.appointment_date DESC, a.created_at DESC "),
        };
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        qb.push(" OFFSET ");
        qb.push_bind(i64::try_from(query.offset).unwrap_or(i64::MAX));

        let rows: Vec<AppointmentRow> = qb.build_query_as::<AppointmentRow>().fetch_all(&self.db).await?;

        Ok((decode_all(rows)?, u64::try_from(total).unwrap_or(0)))
    }
}
