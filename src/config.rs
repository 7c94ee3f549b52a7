use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::FixedOffset;
use tracing::warn;

use crate::clock::SystemClock;
use crate::engine::EngineSettings;

/// Largest accepted schedule offset, in minutes either side of UTC.
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

/// Server settings, read once at startup from `SLOTWISE_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Password for requester logins.
    pub password: String,
    /// Logins that act as the approving authority.
    pub authority_users: Vec<String>,
    /// Password for authority logins. Unset disables them.
    pub authority_password: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub max_active_bookings: usize,
    pub default_window_days: u32,
    pub utc_offset_minutes: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotwise".into(),
            authority_users: vec!["admin".into()],
            authority_password: None,
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            max_active_bookings: 2,
            default_window_days: 14,
            utc_offset_minutes: 0,
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("{key}={raw:?} is invalid ({e}), using {default}");
            default
        }),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Bad values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();

        let password = non_empty(&lookup, "SLOTWISE_PASSWORD").unwrap_or(d.password);
        let authority_password = non_empty(&lookup, "SLOTWISE_AUTHORITY_PASSWORD")
            .filter(|p| {
                let distinct = *p != password;
                if !distinct {
                    warn!("SLOTWISE_AUTHORITY_PASSWORD equals SLOTWISE_PASSWORD; ignoring it");
                }
                distinct
            });
        let authority_users = match lookup("SLOTWISE_AUTHORITY_USERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect(),
            None => d.authority_users,
        };

        let mut max_active_bookings =
            parsed(&lookup, "SLOTWISE_MAX_ACTIVE_BOOKINGS", d.max_active_bookings);
        if max_active_bookings == 0 {
            warn!("SLOTWISE_MAX_ACTIVE_BOOKINGS must be positive, using {}", d.max_active_bookings);
            max_active_bookings = d.max_active_bookings;
        }
        let mut default_window_days =
            parsed(&lookup, "SLOTWISE_DEFAULT_WINDOW_DAYS", d.default_window_days);
        if default_window_days == 0 {
            warn!("SLOTWISE_DEFAULT_WINDOW_DAYS must be positive, using {}", d.default_window_days);
            default_window_days = d.default_window_days;
        }
        let mut utc_offset_minutes =
            parsed(&lookup, "SLOTWISE_UTC_OFFSET_MINUTES", d.utc_offset_minutes);
        if utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            warn!("SLOTWISE_UTC_OFFSET_MINUTES={utc_offset_minutes} out of range, using UTC");
            utc_offset_minutes = 0;
        }

        let metrics_port = lookup("SLOTWISE_METRICS_PORT").and_then(|raw| match raw.trim().parse() {
            Ok(port) => Some(port),
            Err(e) => {
                warn!("SLOTWISE_METRICS_PORT={raw:?} is invalid ({e}), metrics disabled");
                None
            }
        });

        let config = Self {
            port: parsed(&lookup, "SLOTWISE_PORT", d.port),
            bind: non_empty(&lookup, "SLOTWISE_BIND").unwrap_or(d.bind),
            data_dir: non_empty(&lookup, "SLOTWISE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            password,
            authority_users,
            authority_password,
            max_connections: parsed(&lookup, "SLOTWISE_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: parsed(&lookup, "SLOTWISE_COMPACT_THRESHOLD", d.compact_threshold),
            tls_cert: non_empty(&lookup, "SLOTWISE_TLS_CERT"),
            tls_key: non_empty(&lookup, "SLOTWISE_TLS_KEY"),
            metrics_port,
            max_active_bookings,
            default_window_days,
            utc_offset_minutes,
        };

        if config.authority_users.is_empty() {
            warn!("SLOTWISE_AUTHORITY_USERS is empty; no login can approve bookings");
        } else if config.authority_password.is_none() {
            warn!("SLOTWISE_AUTHORITY_PASSWORD is not set; authority logins are disabled");
        }
        config
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| EngineSettings::default().offset)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            clock: Arc::new(SystemClock),
            offset: self.offset(),
            max_active_bookings: self.max_active_bookings,
            default_window_days: self.default_window_days,
        }
    }
}
