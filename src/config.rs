//! Service configuration
//!
//! Loaded from an optional TOML file layered under `PDS_`-prefixed
//! environment overrides (e.g. `PDS_AUTH_SERVER__BASE_URL`). Constructors on
//! the clients also accept plain values so tests never touch the environment.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Environment, File};
use serde::{Deserialize, Deserializer, Serialize};

mod serde_duration {
    use super::{Deserialize, Deserializer, Duration};
    use serde::de::Error;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }
        if let Some(num) = s.strip_suffix("ms") {
            let num: u64 = num
                .parse()
                .map_err(|_| format!("invalid duration: {s}"))?;
            return Ok(Duration::from_millis(num));
        }
        let (num, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num.parse().map_err(|_| format!("invalid duration: {s}"))?;
        match suffix {
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            _ => Err(format!("invalid duration suffix: {suffix}. Use s, m, h, or ms")),
        }
    }
}

/// Base URL and request timeout for one outbound platform service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceEndpoint {
    pub base_url: String,
    #[serde(deserialize_with = "serde_duration::deserialize")]
    pub timeout: Duration,
}

/// Audit emission bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Upper bound on one best-effort sink append.
    #[serde(deserialize_with = "serde_duration::deserialize")]
    pub emit_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub auth_server: ServiceEndpoint,
    pub response_datastore: ServiceEndpoint,
    pub audit: AuditConfig,
}

impl Config {
    /// Load configuration: defaults, then the optional file, then `PDS_`
    /// environment overrides (double underscore as section separator).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("auth_server.timeout", "3s")?
            .set_default("response_datastore.timeout", "3s")?
            .set_default("audit.emit_timeout", "500ms")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("PDS").separator("__"));

        builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_durations() {
        assert_eq!(
            serde_duration::parse_duration("3s").unwrap(),
            Duration::from_secs(3)
        );
        assert_eq!(
            serde_duration::parse_duration("500ms").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            serde_duration::parse_duration("2m").unwrap(),
            Duration::from_secs(120)
        );
        assert_eq!(
            serde_duration::parse_duration("7").unwrap(),
            Duration::from_secs(7)
        );
        assert!(serde_duration::parse_duration("5x").is_err());
        assert!(serde_duration::parse_duration("").is_err());
    }

    #[test]
    fn config_deserializes_from_toml() {
        let raw = r#"
            [auth_server]
            base_url = "http://auth-server"
            timeout = "2s"

            [response_datastore]
            base_url = "http://response-datastore"
            timeout = "4s"

            [audit]
            emit_timeout = "250ms"
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.auth_server.base_url, "http://auth-server");
        assert_eq!(config.response_datastore.timeout, Duration::from_secs(4));
        assert_eq!(config.audit.emit_timeout, Duration::from_millis(250));
    }
}
