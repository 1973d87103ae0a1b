// Test doubles for the collaborators the engine consumes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::directory::{Directory, DoctorProfile, PatientProfile, SearchHits};
use crate::finance::{FinanceSink, PaymentReceived};
use crate::middleware::auth_context::SessionResolver;
use crate::models::{
    Appointment, AppointmentStatus, Caller, Department, PaymentStatus, Role, VisitReason,
};
use crate::scheduling::conflict::SlotWindow;
use crate::scheduling::query::AppointmentQuery;
use crate::scheduling::service::AppointmentService;
use crate::store::{AppointmentStore, MemoryAppointmentStore, StoreError};

/// `YYYY-MM-DDTHH:MM:SS` read as UTC.
pub fn at(raw: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .unwrap()
        .and_utc()
}

pub fn appointment_at(doctor_id: Uuid, when: DateTime<Utc>) -> Appointment {
    Appointment {
        appointment_id: Uuid::new_v4(),
        patient_id: Uuid::new_v4(),
        doctor_id,
        created_by: None,
        updated_by: None,
        department: Department::General,
        appointment_date: when,
        reason: VisitReason::Consultation,
        notes: None,
        status: AppointmentStatus::Upcoming,
        payment_status: PaymentStatus::Pending,
        amount_cents: 0,
        payment_method: None,
        payment_date: None,
        completed_at: None,
        created_at: when,
        updated_at: when,
        version: 0,
    }
}

#[derive(Default)]
pub struct StaticDirectory {
    doctors: Mutex<HashMap<Uuid, DoctorProfile>>,
    patients: Mutex<HashMap<Uuid, PatientProfile>>,
}

impl StaticDirectory {
    pub fn with(doctors: Vec<DoctorProfile>, patients: Vec<PatientProfile>) -> Self {
        Self {
            doctors: Mutex::new(doctors.into_iter().map(|d| (d.doctor_id, d)).collect()),
            patients: Mutex::new(patients.into_iter().map(|p| (p.patient_id, p)).collect()),
        }
    }

    pub async fn add_doctor(&self, doctor: DoctorProfile) {
        self.doctors.lock().await.insert(doctor.doctor_id, doctor);
    }
}

fn name_hit(needle: &str, first: &str, last: &str) -> bool {
    let needle = needle.to_lowercase();
    first.to_lowercase().contains(&needle) || last.to_lowercase().contains(&needle)
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn doctor(&self, doctor_id: Uuid) -> Result<Option<DoctorProfile>, StoreError> {
        Ok(self.doctors.lock().await.get(&doctor_id).cloned())
    }

    async fn patient(&self, patient_id: Uuid) -> Result<Option<PatientProfile>, StoreError> {
        Ok(self.patients.lock().await.get(&patient_id).cloned())
    }

    async fn doctors(&self, ids: &[Uuid]) -> Result<Vec<DoctorProfile>, StoreError> {
        let doctors = self.doctors.lock().await;
        Ok(ids.iter().filter_map(|id| doctors.get(id).cloned()).collect())
    }

    async fn patients(&self, ids: &[Uuid]) -> Result<Vec<PatientProfile>, StoreError> {
        let patients = self.patients.lock().await;
        Ok(ids.iter().filter_map(|id| patients.get(id).cloned()).collect())
    }

    async fn search(&self, needle: &str) -> Result<SearchHits, StoreError> {
        Ok(SearchHits {
            patient_ids: self
                .patients
                .lock()
                .await
                .values()
                .filter(|p| name_hit(needle, &p.first_name, &p.last_name))
                .map(|p| p.patient_id)
                .collect(),
            doctor_ids: self
                .doctors
                .lock()
                .await
                .values()
                .filter(|d| name_hit(needle, &d.first_name, &d.last_name))
                .map(|d| d.doctor_id)
                .collect(),
        })
    }
}

#[derive(Default)]
pub struct RecordingFinance {
    events: Mutex<Vec<PaymentReceived>>,
}

impl RecordingFinance {
    pub async fn events(&self) -> Vec<PaymentReceived> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl FinanceSink for RecordingFinance {
    async fn payment_received(&self, event: &PaymentReceived) -> Result<(), StoreError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Bearer tokens mapped to callers.
#[derive(Default)]
pub struct StaticSessions {
    by_hash: HashMap<String, Caller>,
}

impl StaticSessions {
    pub fn issue(&mut self, token: &str, caller: Caller) {
        self.by_hash.insert(hash_access_token(token), caller);
    }
}

#[async_trait]
impl SessionResolver for StaticSessions {
    async fn resolve(&self, token_hash: &str) -> Result<Option<Caller>, StoreError> {
        Ok(self.by_hash.get(token_hash).copied())
    }
}

/// Memory store that yields to the scheduler after every read, so concurrent
/// operations on one appointment interleave between load and write.
#[derive(Default)]
pub struct YieldingStore {
    inner: MemoryAppointmentStore,
}

#[async_trait]
impl AppointmentStore for YieldingStore {
    async fn insert_checked(&self, appointment: &Appointment, window: SlotWindow) -> Result<(), StoreError> {
        self.inner.insert_checked(appointment, window).await
    }

    async fn replace(
        &self,
        appointment: &Appointment,
        expected_version: i64,
        window: Option<SlotWindow>,
    ) -> Result<bool, StoreError> {
        self.inner.replace(appointment, expected_version, window).await
    }

    async fn fetch(&self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let row = self.inner.fetch(appointment_id).await?;
        tokio::task::yield_now().await;
        Ok(row)
    }

    async fn remove(&self, appointment_id: Uuid) -> Result<bool, StoreError> {
        self.inner.remove(appointment_id).await
    }

    async fn conflicts(
        &self,
        doctor_id: Uuid,
        window: SlotWindow,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let rows = self.inner.conflicts(doctor_id, window, exclude).await?;
        tokio::task::yield_now().await;
        Ok(rows)
    }

    async fn query(&self, query: &AppointmentQuery) -> Result<(Vec<Appointment>, u64), StoreError> {
        self.inner.query(query).await
    }
}

/// A service over the memory store with one doctor, one patient and a
/// frozen clock.
pub struct Harness {
    pub service: Arc<AppointmentService>,
    pub directory: Arc<StaticDirectory>,
    pub finance: Arc<RecordingFinance>,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub fee_cents: i64,
    pub staff: Caller,
    pub admin: Caller,
    pub now: DateTime<Utc>,
}

impl Harness {
    pub fn new(now: &str) -> Self {
        Self::with_store(now, Arc::new(MemoryAppointmentStore::new()))
    }

    /// Same fixture over a store whose reads yield.
    pub fn interleaved(now: &str) -> Self {
        Self::with_store(now, Arc::new(YieldingStore::default()))
    }

    fn with_store(now: &str, store: Arc<dyn AppointmentStore>) -> Self {
        let now = at(now);
        let doctor_id = Uuid::new_v4();
        let patient_id = Uuid::new_v4();
        let fee_cents = 15_000;

        let directory = Arc::new(StaticDirectory::with(
            vec![DoctorProfile {
                doctor_id,
                first_name: "Gregory".into(),
                last_name: "House".into(),
                department: Some("General".into()),
                consultation_fee_cents: fee_cents,
            }],
            vec![PatientProfile {
                patient_id,
                first_name: "Rebecca".into(),
                last_name: "Adler".into(),
            }],
        ));
        let finance = Arc::new(RecordingFinance::default());
        let service = AppointmentService::new(
            store,
            directory.clone(),
            finance.clone(),
            FixedOffset::east_opt(0).unwrap(),
        )
        .with_clock(Arc::new(move || now));

        Self {
            service: Arc::new(service),
            directory,
            finance,
            doctor_id,
            patient_id,
            fee_cents,
            staff: Caller {
                user_id: Uuid::new_v4(),
                role: Role::Receptionist,
            },
            admin: Caller {
                user_id: Uuid::new_v4(),
                role: Role::Admin,
            },
            now,
        }
    }

    pub async fn add_doctor(&self, first_name: &str, last_name: &str) -> Uuid {
        let doctor_id = Uuid::new_v4();
        self.directory
            .add_doctor(DoctorProfile {
                doctor_id,
                first_name: first_name.into(),
                last_name: last_name.into(),
                department: None,
                consultation_fee_cents: 20_000,
            })
            .await;
        doctor_id
    }
}
