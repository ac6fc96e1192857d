use std::path::PathBuf;
use std::str::FromStr;

use crate::inspection::DAY_MS;
use crate::model::Ms;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Server settings from `FUHRPARK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub inspection_warn_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "fuhrpark".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            inspection_warn_days: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var: &str| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Self {
            bind: lookup("FUHRPARK_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "FUHRPARK_PORT", "port number")?.unwrap_or(defaults.port),
            data_dir: lookup("FUHRPARK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("FUHRPARK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "FUHRPARK_MAX_CONNECTIONS", "connection count")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "FUHRPARK_COMPACT_THRESHOLD", "event count")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse_var(&lookup, "FUHRPARK_METRICS_PORT", "port number")?,
            inspection_warn_days: parse_warn_days(&lookup)?.unwrap_or(defaults.inspection_warn_days),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("fuhrpark.wal")
    }

    pub fn inspection_warn_window(&self) -> Ms {
        self.inspection_warn_days.saturating_mul(DAY_MS)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid {
            var,
            value,
            expected,
        })
}

/// Non-negative and small enough to express in milliseconds.
fn parse_warn_days(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<i64>, ConfigError> {
    const VAR: &str = "FUHRPARK_INSPECTION_WARN_DAYS";
    const EXPECTED: &str = "non-negative day count";
    let days: Option<i64> = parse_var(lookup, VAR, EXPECTED)?;
    match days {
        Some(d) if d < 0 || d.checked_mul(DAY_MS).is_none() => Err(ConfigError::Invalid {
            var: VAR,
            value: d.to_string(),
            expected: EXPECTED,
        }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(Config::from_lookup(lookup(&[])).unwrap(), Config::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("FUHRPARK_PORT", "6543"),
            ("FUHRPARK_DATA_DIR", "/var/lib/fuhrpark"),
            ("FUHRPARK_METRICS_PORT", "9090"),
            ("FUHRPARK_INSPECTION_WARN_DAYS", "14"),
        ]))
        .unwrap();
        assert_eq!(config.addr(), "0.0.0.0:6543");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/fuhrpark/fuhrpark.wal"));
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(config.inspection_warn_window(), 14 * DAY_MS);
    }

    #[test]
    fn garbage_number_is_an_error() {
        let err = Config::from_lookup(lookup(&[("FUHRPARK_MAX_CONNECTIONS", "lots")])).unwrap_err();
        assert!(err.to_string().contains("FUHRPARK_MAX_CONNECTIONS"), "{err}");
    }

    #[test]
    fn warn_days_must_fit_in_milliseconds() {
        for bad in ["-1", "9223372036854775807"] {
            let err = Config::from_lookup(lookup(&[("FUHRPARK_INSPECTION_WARN_DAYS", bad)]))
                .unwrap_err();
            assert!(err.to_string().contains("FUHRPARK_INSPECTION_WARN_DAYS"), "{err}");
        }
        let config =
            Config::from_lookup(lookup(&[("FUHRPARK_INSPECTION_WARN_DAYS", "0")])).unwrap();
        assert_eq!(config.inspection_warn_window(), 0);
    }
}
