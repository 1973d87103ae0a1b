// src/scheduling/query.rs

use chrono::{Datelike, DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppointmentError;
use crate::models::{AppointmentStatus, Department};

pub const DEFAULT_PAGE_LIMIT: u64 = 10;
pub const MAX_PAGE_LIMIT: u64 = 100;
/// Cap for the upcoming/past dashboards.
pub const DASHBOARD_LIMIT: u64 = 50;
/// Calendar years accepted from callers.
pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Text filter after directory resolution: matches the reason or notes, or any
/// appointment whose patient/doctor id the directory matched by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextMatch {
    pub needle: String,
    pub patient_ids: Vec<Uuid>,
    pub doctor_ids: Vec<Uuid>,
}

impl TextMatch {
    pub fn matches_text(&self, haystack: &str) -> bool {
        haystack.to_lowercase().contains(&self.needle.to_lowercase())
    }
}

/// Store-level query. Time bounds compare `appointment_date`:
/// `from` is inclusive, `after` and `before` are strict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppointmentQuery {
    pub status: Option<AppointmentStatus>,
    pub exclude_status: Option<AppointmentStatus>,
    pub department: Option<Department>,
    pub doctor_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub text: Option<TextMatch>,
    pub order: SortOrder,
    pub offset: u64,
    pub limit: Option<u64>,
}

/// Caller-facing filters for the general listing.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<AppointmentStatus>,
    pub department: Option<Department>,
    pub doctor_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub date: Option<NaiveDate>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub limit: u64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageRequest {
    /// Missing values fall back to page 1 / limit 10; out-of-range values are clamped.
    pub fn new(page: Option<u64>, limit: Option<u64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub appointments: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub pages: u64,
}

pub fn page_count(total: u64, limit: u64) -> u64 {
    total.div_ceil(limit.max(1))
}

/* ============================================================
   Clinic-local time
   ============================================================ */

/// `[00:00, next 00:00)` of `day` in clinic time, as UTC instants. The end is
/// exclusive, so the whole last millisecond of the day belongs to it.
pub fn day_bounds(day: NaiveDate, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = local_to_utc(day.and_time(NaiveTime::MIN), offset);
    (start, start + Duration::days(1))
}

pub fn local_day(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}

fn local_to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local - Duration::seconds(i64::from(offset.local_minus_utc()))))
}

fn year_out_of_range(raw: &str) -> AppointmentError {
    AppointmentError::Validation(format!(
        "invalid date '{raw}': year must be within {MIN_YEAR}..={MAX_YEAR}"
    ))
}

fn supported_year(year: i32) -> bool {
    (MIN_YEAR..=MAX_YEAR).contains(&year)
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM[:SS[.fff]]` read as clinic time.
pub fn parse_instant(raw: &str, offset: FixedOffset) -> Result<DateTime<Utc>, AppointmentError> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        if !supported_year(at.year()) {
            return Err(year_out_of_range(raw));
        }
        return Ok(at.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    let local = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| {
            AppointmentError::Validation(format!(
                "invalid date '{raw}': expected RFC 3339 or YYYY-MM-DDTHH:MM[:SS]"
            ))
        })?;
    if !supported_year(local.year()) {
        return Err(year_out_of_range(raw));
    }
    Ok(local_to_utc(local, offset))
}

/// A calendar day; a full timestamp is accepted and reduced to its clinic-local date.
pub fn parse_day(raw: &str, offset: FixedOffset) -> Result<NaiveDate, AppointmentError> {
    let raw = raw.trim();
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if !supported_year(day.year()) {
            return Err(year_out_of_range(raw));
        }
        return Ok(day);
    }
    parse_instant(raw, offset)
        .map(|at| local_day(at, offset))
        .map_err(|_| AppointmentError::Validation(format!("invalid date '{raw}': expected YYYY-MM-DD")))
}

/// Escape LIKE wildcards so user input is matched literally.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
