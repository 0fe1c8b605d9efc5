//! Typed configuration, loaded from JSON.
//!
//! Locating the file and layering it with command-line flags is the
//! binary's business; this module only parses and validates.

use crate::error::ConfigError;
use crate::inverter::fields::{self, DEFAULT_POLL_CODES};
use crate::inverter::MAX_QUEUED_QUERIES;
use crate::simulator::FaultInjectionConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_QUERY_INTERVAL_S: f64 = 5.0;
/// Shortest accepted poll interval. A zero interval would reschedule the
/// next cycle for the same instant forever.
pub const MIN_QUERY_INTERVAL_MS: u64 = 100;
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 15_000;
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;
pub const DEFAULT_CONNECT_RETRIES: u32 = 3;
pub const DEFAULT_BAUD: u32 = 19_200;
pub const DEFAULT_SIMULATED_MODEL: u32 = 20010;

const MANDATORY_KEYS: [&str; 3] = ["name", "address", "connection"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Tcp {
        host: String,
        port: u16,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Serial {
        device: String,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Simulator {
        #[serde(default = "default_model")]
        model: u32,
        #[serde(default)]
        faults: FaultInjectionConfig,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

impl ConnectionConfig {
    pub fn timeout_ms(&self) -> u64 {
        match self {
            ConnectionConfig::Tcp { timeout_ms, .. }
            | ConnectionConfig::Serial { timeout_ms, .. }
            | ConnectionConfig::Simulator { timeout_ms, .. } => *timeout_ms,
        }
    }

    pub fn transport(&self) -> &'static str {
        match self {
            ConnectionConfig::Tcp { .. } => "tcp",
            ConnectionConfig::Serial { .. } => "serial",
            ConnectionConfig::Simulator { .. } => "simulator",
        }
    }

    pub fn simulator(model: u32) -> Self {
        ConnectionConfig::Simulator {
            model,
            faults: FaultInjectionConfig::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InverterConfig {
    pub name: String,
    /// Bus address of the device.
    pub address: u8,
    pub connection: ConnectionConfig,
    #[serde(default = "default_query_interval_s")]
    pub query_interval_s: f64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Field code to scale factor, replacing the table default.
    #[serde(default)]
    pub scale_overrides: BTreeMap<String, f64>,
    /// Field codes to poll; the standard telemetry set when absent.
    #[serde(default)]
    pub poll_codes: Option<Vec<String>>,
}

impl InverterConfig {
    pub fn new(name: impl Into<String>, address: u8, connection: ConnectionConfig) -> Self {
        Self {
            name: name.into(),
            address,
            connection,
            query_interval_s: DEFAULT_QUERY_INTERVAL_S,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            scale_overrides: BTreeMap::new(),
            poll_codes: None,
        }
    }

    pub fn query_interval_ms(&self) -> u64 {
        // Validated finite and positive.
        (self.query_interval_s * 1000.0).round() as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Missing("name".to_owned()));
        }
        if !self.query_interval_s.is_finite() || self.query_interval_s <= 0.0 {
            return Err(ConfigError::invalid(
                "query_interval_s",
                format!("must be a positive number of seconds, got {}", self.query_interval_s),
            ));
        }
        if self.query_interval_ms() < MIN_QUERY_INTERVAL_MS {
            return Err(ConfigError::invalid(
                "query_interval_s",
                format!(
                    "must be at least {} s, got {}",
                    MIN_QUERY_INTERVAL_MS as f64 / 1000.0,
                    self.query_interval_s
                ),
            ));
        }
        if self.error_threshold == 0 {
            return Err(ConfigError::invalid("error_threshold", "must be at least 1"));
        }
        if self.connect_retries == 0 {
            return Err(ConfigError::invalid("connect_retries", "must be at least 1"));
        }
        for (code, factor) in &self.scale_overrides {
            let Some(field) = fields::lookup(code) else {
                return Err(ConfigError::invalid(
                    format!("scale_overrides.{code}"),
                    "unknown field code",
                ));
            };
            if field.kind != crate::capability::ValueKind::Float {
                return Err(ConfigError::invalid(
                    format!("scale_overrides.{code}"),
                    "field is not numeric",
                ));
            }
            if !factor.is_finite() || *factor == 0.0 {
                return Err(ConfigError::invalid(
                    format!("scale_overrides.{code}"),
                    "factor must be finite and non-zero",
                ));
            }
        }
        self.resolved_poll_codes()?;
        Ok(())
    }

    /// Poll codes mapped onto the static field table.
    pub fn resolved_poll_codes(&self) -> Result<Vec<&'static str>, ConfigError> {
        let Some(codes) = &self.poll_codes else {
            return Ok(DEFAULT_POLL_CODES.to_vec());
        };
        if codes.is_empty() {
            return Err(ConfigError::invalid("poll_codes", "must not be empty"));
        }
        if codes.len() > MAX_QUEUED_QUERIES {
            return Err(ConfigError::invalid(
                "poll_codes",
                format!("at most {MAX_QUEUED_QUERIES} codes"),
            ));
        }
        codes
            .iter()
            .map(|code| {
                fields::known_code(code).ok_or_else(|| {
                    ConfigError::invalid("poll_codes", format!("unknown field code '{code}'"))
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SystemConfig {
    pub inverters: Vec<InverterConfig>,
}

impl SystemConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        let inverters = raw
            .get("inverters")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| ConfigError::Missing("inverters".to_owned()))?;

        // Report absent mandatory keys by name rather than as a serde message.
        for (index, inverter) in inverters.iter().enumerate() {
            for key in MANDATORY_KEYS {
                if inverter.get(key).is_none() {
                    return Err(ConfigError::Missing(format!("inverters[{index}].{key}")));
                }
            }
        }

        let config: SystemConfig = serde_json::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for inverter in &self.inverters {
            inverter.validate()?;
            if !names.insert(inverter.name.as_str()) {
                return Err(ConfigError::DuplicateName(inverter.name.clone()));
            }
        }
        Ok(())
    }

    /// Swap every transport for a simulated device.
    pub fn into_simulated(mut self) -> Self {
        for inverter in &mut self.inverters {
            let timeout_ms = inverter.connection.timeout_ms();
            inverter.connection = ConnectionConfig::Simulator {
                model: DEFAULT_SIMULATED_MODEL,
                faults: FaultInjectionConfig::default(),
                timeout_ms,
            };
        }
        self
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn default_model() -> u32 {
    DEFAULT_SIMULATED_MODEL
}

fn default_query_interval_s() -> f64 {
    DEFAULT_QUERY_INTERVAL_S
}

fn default_reconnect_backoff_ms() -> u64 {
    DEFAULT_RECONNECT_BACKOFF_MS
}

fn default_error_threshold() -> u32 {
    DEFAULT_ERROR_THRESHOLD
}

fn default_connect_retries() -> u32 {
    DEFAULT_CONNECT_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "inverters": [
            { "name": "roof", "address": 1,
              "connection": { "transport": "tcp", "host": "10.0.0.5", "port": 12345 } }
        ]
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = SystemConfig::from_json_str(MINIMAL).unwrap();
        let inverter = &config.inverters[0];

        assert_eq!(inverter.query_interval_s, 5.0);
        assert_eq!(inverter.query_interval_ms(), 5_000);
        assert_eq!(inverter.reconnect_backoff_ms, 15_000);
        assert_eq!(inverter.error_threshold, 3);
        assert_eq!(inverter.connection.timeout_ms(), 15_000);
        assert_eq!(inverter.resolved_poll_codes().unwrap(), DEFAULT_POLL_CODES.to_vec());
    }

    #[test]
    fn test_missing_mandatory_key_named() {
        let json = r#"{ "inverters": [ { "name": "roof", "connection": { "transport": "simulator" } } ] }"#;
        match SystemConfig::from_json_str(json) {
            Err(ConfigError::Missing(key)) => assert_eq!(key, "inverters[0].address"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_mistyped_value_rejected() {
        let json = r#"{ "inverters": [ { "name": "roof", "address": "one",
            "connection": { "transport": "simulator" } } ] }"#;
        assert!(matches!(
            SystemConfig::from_json_str(json),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let mut inverter = InverterConfig::new("a", 1, ConnectionConfig::simulator(2001));
        inverter.query_interval_s = 0.0;
        assert!(matches!(inverter.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_interval_below_scheduling_resolution_rejected() {
        let mut inverter = InverterConfig::new("a", 1, ConnectionConfig::simulator(2001));
        inverter.query_interval_s = 0.0004;
        assert_eq!(inverter.query_interval_ms(), 0);
        assert!(matches!(
            inverter.validate(),
            Err(ConfigError::Invalid { ref key, .. }) if key == "query_interval_s"
        ));

        inverter.query_interval_s = 0.05;
        assert!(inverter.validate().is_err());

        inverter.query_interval_s = 0.1;
        assert!(inverter.validate().is_ok());
    }

    #[test]
    fn test_unknown_codes_rejected() {
        let mut inverter = InverterConfig::new("a", 1, ConnectionConfig::simulator(2001));
        inverter.poll_codes = Some(vec!["PAC".into(), "XYZ".into()]);
        assert!(inverter.validate().is_err());

        inverter.poll_codes = None;
        inverter.scale_overrides.insert("SYS".into(), 2.0);
        assert!(inverter.validate().is_err());

        inverter.scale_overrides.clear();
        inverter.scale_overrides.insert("PAC".into(), 1.0);
        assert!(inverter.validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let inverter = InverterConfig::new("a", 1, ConnectionConfig::simulator(2001));
        let config = SystemConfig {
            inverters: vec![inverter.clone(), inverter],
        };
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateName(_))));
    }

    #[test]
    fn test_simulator_override() {
        let config = SystemConfig::from_json_str(MINIMAL).unwrap().into_simulated();
        assert_eq!(config.inverters[0].connection.transport(), "simulator");
    }
}
