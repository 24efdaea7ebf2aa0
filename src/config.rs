use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;

use crate::engine::{DEFAULT_STORE_TIMEOUT, default_opening_hours};
use crate::model::TimeRange;

/// Server settings, read once from `WASHSLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub roles: Roles,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub store_timeout: Duration,
    pub opening_hours: TimeRange,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

/// What each login name may do. Nothing here comes from the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roles {
    /// Login names allowed to manage machines and cancel any booking.
    pub admins: Vec<String>,
    /// Login name to access group. Residents not listed belong to no group.
    pub groups: BTreeMap<String, String>,
}

impl Roles {
    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.iter().any(|a| a == user)
    }

    pub fn group_of(&self, user: &str) -> Option<&str> {
        self.groups.get(user).map(String::as_str)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    OpeningHours(TimeRange),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid {var}: {value:?}"),
            ConfigError::OpeningHours(range) => {
                write!(f, "opening hours must close after they open, got {range}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = default_opening_hours();
        let open = parsed_with(&lookup, "WASHSLOT_OPEN", parse_time)?.unwrap_or(defaults.start);
        let close = parsed_with(&lookup, "WASHSLOT_CLOSE", parse_time)?.unwrap_or(defaults.end);
        let opening_hours = TimeRange::checked(open, close).ok_or(ConfigError::OpeningHours(TimeRange {
            start: open,
            end: close,
        }))?;

        let admins = lookup("WASHSLOT_ADMINS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|| vec!["admin".to_string()]);
        let groups = parsed_with(&lookup, "WASHSLOT_GROUPS", parse_groups)?.unwrap_or_default();

        Ok(Self {
            port: parsed(&lookup, "WASHSLOT_PORT")?.unwrap_or(5433),
            bind: lookup("WASHSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("WASHSLOT_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: lookup("WASHSLOT_PASSWORD").unwrap_or_else(|| "washslot".into()),
            roles: Roles { admins, groups },
            max_connections: parsed(&lookup, "WASHSLOT_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "WASHSLOT_COMPACT_THRESHOLD")?.unwrap_or(1000),
            store_timeout: parsed(&lookup, "WASHSLOT_STORE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STORE_TIMEOUT),
            opening_hours,
            tls_cert: lookup("WASHSLOT_TLS_CERT"),
            tls_key: lookup("WASHSLOT_TLS_KEY"),
            metrics_port: parsed(&lookup, "WASHSLOT_METRICS_PORT")?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("washslot.wal")
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    parsed_with(lookup, var, |s| s.parse().ok())
}

fn parsed_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    parse(value.trim())
        .map(Some)
        .ok_or(ConfigError::Invalid { var, value })
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// `user:group,user:group`. Empty entries are skipped.
fn parse_groups(s: &str) -> Option<BTreeMap<String, String>> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (user, group) = entry.split_once(':')?;
            let (user, group) = (user.trim(), group.trim());
            (!user.is_empty() && !group.is_empty()).then(|| (user.to_string(), group.to_string()))
        })
        .collect()
}
