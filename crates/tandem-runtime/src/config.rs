#![forbid(unsafe_code)]

//! Session configuration.
//!
//! [`SessionConfig`] can be built in code, parsed from JSON, or (with the
//! `policy-config` feature) from TOML. File loading picks the format from the
//! extension. Environment overrides are applied separately so that callers
//! decide whether the process environment participates:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `TANDEM_TEMP_ID_PREFIX` | `temp_id_prefix` |
//! | `TANDEM_FORCE_COMPLETE_AFTER_MS` | `force_complete_after_ms` (`0` or empty clears it) |
//! | `TANDEM_COALESCE` | `coalesce` (`1`/`true`/`0`/`false`) |

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_model::{DEFAULT_TEMP_ID_PREFIX, IdPolicy};
use tracing::debug;

use crate::error::ConfigError;

pub const ENV_TEMP_ID_PREFIX: &str = "TANDEM_TEMP_ID_PREFIX";
pub const ENV_FORCE_COMPLETE_AFTER_MS: &str = "TANDEM_FORCE_COMPLETE_AFTER_MS";
pub const ENV_COALESCE: &str = "TANDEM_COALESCE";

/// Tunables for one [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Prefix of client-minted temporary ids.
    pub temp_id_prefix: String,
    /// Batches older than this are force-completed by
    /// [`Session::force_complete_stale`](crate::Session::force_complete_stale).
    /// `None` disables the degraded path.
    pub force_complete_after_ms: Option<u64>,
    /// Coalesce concurrent identical type, list and query requests.
    pub coalesce: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            temp_id_prefix: DEFAULT_TEMP_ID_PREFIX.to_string(),
            force_complete_after_ms: None,
            coalesce: true,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    #[cfg(feature = "policy-config")]
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` (or, with `policy-config`, `.toml`) file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let read = || {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        };
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&read()?)?,
            #[cfg(feature = "policy-config")]
            Some("toml") => Self::from_toml_str(&read()?)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        debug!(path = %path.display(), "loaded session config");
        Ok(config)
    }

    /// Apply `TANDEM_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(prefix) = lookup(ENV_TEMP_ID_PREFIX) {
            self.temp_id_prefix = prefix;
        }
        if let Some(raw) = lookup(ENV_FORCE_COMPLETE_AFTER_MS) {
            let raw = raw.trim();
            self.force_complete_after_ms = match raw {
                "" | "0" => None,
                _ => Some(raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: ENV_FORCE_COMPLETE_AFTER_MS,
                    value: raw.to_string(),
                })?),
            };
        }
        if let Some(raw) = lookup(ENV_COALESCE) {
            self.coalesce = parse_flag(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: ENV_COALESCE,
                value: raw.clone(),
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values that would make id classification ambiguous.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.temp_id_prefix;
        if prefix.is_empty() || prefix.chars().any(|c| c.is_ascii_digit() || c.is_whitespace()) {
            return Err(ConfigError::InvalidValue {
                key: "temp_id_prefix",
                value: prefix.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn id_policy(&self) -> IdPolicy {
        IdPolicy::with_prefix(self.temp_id_prefix.clone())
    }

    #[must_use]
    pub fn force_complete_after(&self) -> Option<Duration> {
        self.force_complete_after_ms.map(Duration::from_millis)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if raw == "1" || raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw == "0" || raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.temp_id_prefix, "+c");
        assert!(config.coalesce);
        assert_eq!(config.force_complete_after(), None);
        assert!(config.id_policy().is_new("+c12"));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = SessionConfig::from_json_str(r#"{ "force_complete_after_ms": 250 }"#).unwrap();
        assert_eq!(config.force_complete_after(), Some(Duration::from_millis(250)));
        assert_eq!(config.temp_id_prefix, "+c");
    }

    #[test]
    fn json_rejects_unknown_fields() {
        let err = SessionConfig::from_json_str(r#"{ "coalesec": false }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn invalid_prefix_is_rejected() {
        let err = SessionConfig::from_json_str(r#"{ "temp_id_prefix": "t1" }"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "temp_id_prefix",
                ..
            }
        ));
    }

    #[test]
    fn overrides_apply() {
        let config = SessionConfig::default()
            .apply_overrides(env(&[
                (ENV_TEMP_ID_PREFIX, "~tmp"),
                (ENV_FORCE_COMPLETE_AFTER_MS, "1500"),
                (ENV_COALESCE, "false"),
            ]))
            .unwrap();
        assert_eq!(config.temp_id_prefix, "~tmp");
        assert_eq!(config.force_complete_after_ms, Some(1500));
        assert!(!config.coalesce);
    }

    #[test]
    fn zero_timeout_override_clears() {
        let config = SessionConfig {
            force_complete_after_ms: Some(10),
            ..SessionConfig::default()
        }
        .apply_overrides(env(&[(ENV_FORCE_COMPLETE_AFTER_MS, "0")]))
        .unwrap();
        assert_eq!(config.force_complete_after_ms, None);
    }

    #[test]
    fn malformed_override_is_reported() {
        let err = SessionConfig::default()
            .apply_overrides(env(&[(ENV_COALESCE, "maybe")]))
            .unwrap_err();
        assert_eq!(err.to_string(), r#"invalid value "maybe" for TANDEM_COALESCE"#);
    }

    #[test]
    fn load_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("session.json");
        std::fs::write(&json, r#"{ "coalesce": false }"#).unwrap();
        assert!(!SessionConfig::load(&json).unwrap().coalesce);

        let yaml = dir.path().join("session.yaml");
        std::fs::write(&yaml, "coalesce: false").unwrap();
        assert!(matches!(
            SessionConfig::load(&yaml),
            Err(ConfigError::UnsupportedFormat(_))
        ));

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            SessionConfig::load(&missing),
            Err(ConfigError::Io { .. })
        ));
    }

    #[cfg(feature = "policy-config")]
    #[test]
    fn toml_config_parses() {
        let config = SessionConfig::from_toml_str(
            "temp_id_prefix = \"~n\"\nforce_complete_after_ms = 30000\n",
        )
        .unwrap();
        assert_eq!(config.temp_id_prefix, "~n");
        assert_eq!(config.force_complete_after_ms, Some(30_000));
        assert!(config.coalesce);
    }
}
