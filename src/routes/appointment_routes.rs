// src/routes/appointment_routes.rs

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{ApiError, AppointmentError},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, AppointmentStatus, AppointmentView, Department, OkData},
    scheduling::{
        conflict::Availability,
        query::{ListFilter, Page, PageRequest},
        service::{AppointmentChanges, NewAppointment, PaymentUpdate, StatusChange, StatusUpdate},
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", get(list_appointments).post(create_appointment))
        .route("/appointments/today", get(get_appointments_today))
        .route("/appointments/upcoming", get(get_appointments_upcoming))
        .route("/appointments/past", get(get_appointments_past))
        .route("/appointments/check-availability", get(check_availability))
        .route("/appointments/patient/{patient_id}", get(get_patient_appointments))
        .route("/appointments/doctor/{doctor_id}", get(get_doctor_appointments))
        .route(
            "/appointments/{appointment_id}",
            get(get_appointment).put(update_appointment).delete(delete_appointment),
        )
        .route("/appointments/{appointment_id}/status", patch(update_status))
        .route("/appointments/{appointment_id}/payment", patch(update_payment))
}

/* ============================================================
   Extraction helpers
   ============================================================ */

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|e| ApiError::validation(e.body_text()))
}

fn query_params<T>(q: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    q.map(|Query(v)| v)
        .map_err(|e| ApiError::validation(e.body_text()))
}

fn path_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ApiError> {
    path.map(|Path(id)| id)
        .map_err(|e| ApiError::validation(e.body_text()))
}

/// Browsers send `?status=` for an unset select; treat blank as absent.
fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::validation(format!("{field} must be a UUID")))
}

/* ============================================================
   Query params
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub department: Option<String>,
    pub doctor: Option<String>,
    pub patient: Option<String>,
    pub date: Option<String>,
    pub search: Option<String>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    #[serde(rename = "doctorId")]
    pub doctor_id: Option<String>,
    pub date: Option<String>,
    #[serde(rename = "appointmentId")]
    pub appointment_id: Option<String>,
}

/* ============================================================
   GET /appointments
   ============================================================ */

pub async fn list_appointments(
    State(state): State<AppState>,
    _auth: AuthContext,
    q: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ApiOk<Page<AppointmentView>>>, ApiError> {
    let q = query_params(q)?;
    let svc = &state.appointments;

    let status = non_empty(q.status)
        .map(|s| {
            s.parse::<AppointmentStatus>()
                .map_err(|_| AppointmentError::InvalidStatus(s))
        })
        .transpose()?;
    let department = non_empty(q.department)
        .map(|d| d.parse::<Department>())
        .transpose()
        .map_err(|e| ApiError::validation(e.to_string()))?;
    let doctor_id = non_empty(q.doctor)
        .map(|d| parse_uuid(&d, "doctor"))
        .transpose()?;
    let patient_id = non_empty(q.patient)
        .map(|p| parse_uuid(&p, "patient"))
        .transpose()?;
    let date = non_empty(q.date)
        .map(|d| svc.parse_day(&d))
        .transpose()?;

    let filter = ListFilter {
        status,
        department,
        doctor_id,
        patient_id,
        date,
        search: non_empty(q.search),
    };

    let page = svc.list(filter, PageRequest::new(q.page, q.limit)).await?;
    Ok(Json(ApiOk { data: page }))
}

/* ============================================================
   GET /appointments/today | upcoming | past
   ============================================================ */

pub async fn get_appointments_today(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<AppointmentView>>>, ApiError> {
    Ok(Json(ApiOk {
        data: state.appointments.today().await?,
    }))
}

pub async fn get_appointments_upcoming(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<AppointmentView>>>, ApiError> {
    Ok(Json(ApiOk {
        data: state.appointments.upcoming().await?,
    }))
}

pub async fn get_appointments_past(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<AppointmentView>>>, ApiError> {
    Ok(Json(ApiOk {
        data: state.appointments.past().await?,
    }))
}

/* ============================================================
   GET /appointments/patient/{id} | doctor/{id}
   ============================================================ */

pub async fn get_patient_appointments(
    State(state): State<AppState>,
    _auth: AuthContext,
    path: Result<Path<Uuid>, PathRejection>,
    q: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<ApiOk<Page<AppointmentView>>>, ApiError> {
    let patient_id = path_id(path)?;
    let q = query_params(q)?;
    let page = state
        .appointments
        .for_patient(patient_id, PageRequest::new(q.page, q.limit))
        .await?;
    Ok(Json(ApiOk { data: page }))
}

pub async fn get_doctor_appointments(
    State(state): State<AppState>,
    _auth: AuthContext,
    path: Result<Path<Uuid>, PathRejection>,
    q: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<ApiOk<Page<AppointmentView>>>, ApiError> {
    let doctor_id = path_id(path)?;
    let q = query_params(q)?;
    let page = state
        .appointments
        .for_doctor(doctor_id, PageRequest::new(q.page, q.limit))
        .await?;
    Ok(Json(ApiOk { data: page }))
}

/* ============================================================
   GET /appointments/check-availability
   ============================================================ */

pub async fn check_availability(
    State(state): State<AppState>,
    _auth: AuthContext,
    q: Result<Query<AvailabilityQuery>, QueryRejection>,
) -> Result<Json<ApiOk<Availability>>, ApiError> {
    let q = query_params(q)?;
    let svc = &state.appointments;

    let (Some(doctor), Some(date)) = (non_empty(q.doctor_id), non_empty(q.date)) else {
        return Err(ApiError::validation("doctorId and date are required"));
    };
    let doctor_id = parse_uuid(&doctor, "doctorId")?;
    let at = svc.parse_instant(&date)?;
    let exclude = non_empty(q.appointment_id)
        .map(|a| parse_uuid(&a, "appointmentId"))
        .transpose()?;

    let availability = svc.check_availability(doctor_id, at, exclude).await?;
    Ok(Json(ApiOk { data: availability }))
}

/* ============================================================
   POST /appointments
   ============================================================ */

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    body: Result<Json<NewAppointment>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiOk<AppointmentView>>), ApiError> {
    let req = json_body(body)?;
    let view = state.appointments.create(&auth.caller, req).await?;
    Ok((StatusCode::CREATED, Json(ApiOk { data: view })))
}

/* ============================================================
   GET | PUT | DELETE /appointments/{id}
   ============================================================ */

pub async fn get_appointment(
    State(state): State<AppState>,
    _auth: AuthContext,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ApiOk<AppointmentView>>, ApiError> {
    let appointment_id = path_id(path)?;
    Ok(Json(ApiOk {
        data: state.appointments.get(appointment_id).await?,
    }))
}

pub async fn update_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    path: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<AppointmentChanges>, JsonRejection>,
) -> Result<Json<ApiOk<AppointmentView>>, ApiError> {
    let appointment_id = path_id(path)?;
    let changes = json_body(body)?;
    let view = state
        .appointments
        .update(&auth.caller, appointment_id, changes)
        .await?;
    Ok(Json(ApiOk { data: view }))
}

pub async fn delete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    let appointment_id = path_id(path)?;
    state.appointments.delete(appointment_id).await?;
    tracing::info!(%appointment_id, user_id = %auth.caller.user_id, "appointment removed via API");
    Ok(Json(ApiOk {
        data: OkData { ok: true },
    }))
}

/* ============================================================
   PATCH /appointments/{id}/status | payment
   ============================================================ */

pub async fn update_status(
    State(state): State<AppState>,
    auth: AuthContext,
    path: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<StatusUpdate>, JsonRejection>,
) -> Result<Json<ApiOk<StatusChange>>, ApiError> {
    let appointment_id = path_id(path)?;
    let req = json_body(body)?;
    let change = state
        .appointments
        .update_status(&auth.caller, appointment_id, &req.status)
        .await?;
    Ok(Json(ApiOk { data: change }))
}

pub async fn update_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    path: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<PaymentUpdate>, JsonRejection>,
) -> Result<Json<ApiOk<AppointmentView>>, ApiError> {
    let appointment_id = path_id(path)?;
    let req = json_body(body)?;
    let view = state
        .appointments
        .update_payment(&auth.caller, appointment_id, req)
        .await?;
    Ok(Json(ApiOk { data: view }))
}
