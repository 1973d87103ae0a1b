use std::env;

use anyhow::{anyhow, bail};
use chrono::FixedOffset;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub store_backend: StoreBackend,
    pub clinic_offset: FixedOffset,
    pub run_migrations: bool,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = get("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL is required"))?;
        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let store_backend = match get("APPOINTMENT_STORE").as_deref().map(str::trim) {
            None | Some("") | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => bail!("APPOINTMENT_STORE must be 'postgres' or 'memory', got '{other}'"),
        };

        let offset_minutes = match get("CLINIC_UTC_OFFSET_MINUTES") {
            Some(raw) => raw
                .trim()
                .parse::<i32>()
                .map_err(|e| anyhow!("CLINIC_UTC_OFFSET_MINUTES: {e}"))?,
            None => 0,
        };
        // FixedOffset rejects anything at or beyond a full day; clinics stay within +-14h
        if offset_minutes.abs() > 14 * 60 {
            bail!("CLINIC_UTC_OFFSET_MINUTES must be within -840..=840, got {offset_minutes}");
        }
        let clinic_offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or_else(|| anyhow!("invalid clinic offset {offset_minutes}"))?;

        let run_migrations = get("RUN_MIGRATIONS")
            .map(|s| !matches!(s.trim(), "0" | "false" | "no"))
            .unwrap_or(true);

        let db_max_connections = get("DB_MAX_CONNECTIONS")
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(10);

        Ok(Self {
            database_url,
            bind_addr,
            store_backend,
            clinic_offset,
            run_migrations,
            db_max_connections,
        })
    }
}
