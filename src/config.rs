use std::path::PathBuf;

use thiserror::Error;

use crate::engine::{OverbookingPolicy, StudioOptions};
use crate::limits::MAX_CALENDAR_CONCURRENCY;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Runtime settings, read from `KILN_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub wal_file: String,
    pub calendar_concurrency: usize,
    pub overbooking: OverbookingPolicy,
    /// Appends after which the compactor rewrites the WAL.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_file: "studio.wal".into(),
            calendar_concurrency: 8,
            overbooking: OverbookingPolicy::Strict,
            compact_threshold: 1000,
        }
    }
}

fn invalid(var: &'static str, expected: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        expected,
        value: value.to_string(),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Unset variables take the default; set but unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(dir) = lookup("KILN_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("KILN_WAL_FILE") {
            if file.is_empty() {
                return Err(invalid("KILN_WAL_FILE", "a file name", &file));
            }
            config.wal_file = file;
        }
        if let Some(raw) = lookup("KILN_CALENDAR_CONCURRENCY") {
            let n: usize = raw
                .trim()
                .parse()
                .map_err(|_| invalid("KILN_CALENDAR_CONCURRENCY", "a positive integer", &raw))?;
            config.calendar_concurrency = n.clamp(1, MAX_CALENDAR_CONCURRENCY);
        }
        if let Some(raw) = lookup("KILN_OVERBOOKING") {
            config.overbooking = match raw.trim().to_ascii_lowercase().as_str() {
                "strict" => OverbookingPolicy::Strict,
                "lenient" => OverbookingPolicy::Lenient,
                _ => return Err(invalid("KILN_OVERBOOKING", "strict or lenient", &raw)),
            };
        }
        if let Some(raw) = lookup("KILN_COMPACT_THRESHOLD") {
            config.compact_threshold = raw
                .trim()
                .parse()
                .map_err(|_| invalid("KILN_COMPACT_THRESHOLD", "an integer", &raw))?;
        }
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(&self.wal_file)
    }

    pub fn studio_options(&self) -> StudioOptions {
        StudioOptions {
            overbooking: self.overbooking,
            calendar_concurrency: self.calendar_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/studio.wal"));
        assert_eq!(config.studio_options(), StudioOptions::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = from_pairs(&[
            ("KILN_DATA_DIR", "/var/lib/kiln"),
            ("KILN_WAL_FILE", "north.wal"),
            ("KILN_CALENDAR_CONCURRENCY", "4"),
            ("KILN_OVERBOOKING", "Lenient"),
            ("KILN_COMPACT_THRESHOLD", "50"),
        ])
        .unwrap();
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/kiln/north.wal"));
        assert_eq!(config.calendar_concurrency, 4);
        assert_eq!(config.overbooking, OverbookingPolicy::Lenient);
        assert_eq!(config.compact_threshold, 50);
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(from_pairs(&[("KILN_CALENDAR_CONCURRENCY", "0")]).unwrap().calendar_concurrency, 1);
        assert_eq!(
            from_pairs(&[("KILN_CALENDAR_CONCURRENCY", "100000")]).unwrap().calendar_concurrency,
            MAX_CALENDAR_CONCURRENCY
        );
    }

    #[test]
    fn bad_values_are_errors() {
        let err = from_pairs(&[("KILN_OVERBOOKING", "sometimes")]).unwrap_err();
        assert_eq!(err.to_string(), "KILN_OVERBOOKING: expected strict or lenient, got \"sometimes\"");
        assert!(from_pairs(&[("KILN_CALENDAR_CONCURRENCY", "-1")]).is_err());
        assert!(from_pairs(&[("KILN_COMPACT_THRESHOLD", "soon")]).is_err());
        assert!(from_pairs(&[("KILN_WAL_FILE", "")]).is_err());
    }
}
