//! Configuration for the wlsim emulation core.
//!
//! A TOML file with environment overrides, validated and translated into
//! `wlsim_core::WirelessConfig`. Durations in the file are plain seconds.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wlsim_core::{
    AdmissionLimits, ApIdentity, AssociationTimers, CapwapTimers, DhcpTimers, DtlsTimers, WirelessConfig,
};

/// Prefix of environment overrides, e.g. `WLSIM_CAPWAP__MAX_RETRANSMIT=5`.
pub const ENV_PREFIX: &str = "WLSIM_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Controller address; discovery is broadcast when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wlc_ip: Option<Ipv4Addr>,

    #[serde(default = "default_rx_queue_len")]
    pub rx_queue_len: usize,

    #[serde(default)]
    pub capwap: Capwap,

    #[serde(default)]
    pub dtls: Dtls,

    #[serde(default)]
    pub client: ClientBackoff,

    #[serde(default)]
    pub dhcp: Dhcp,

    #[serde(default)]
    pub concurrency: Concurrency,

    #[serde(default)]
    pub ap: Identity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wlc_ip: None,
            rx_queue_len: default_rx_queue_len(),
            capwap: Capwap::default(),
            dtls: Dtls::default(),
            client: ClientBackoff::default(),
            dhcp: Dhcp::default(),
            concurrency: Concurrency::default(),
            ap: Identity::default(),
        }
    }
}

fn default_rx_queue_len() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Capwap {
    /// Seconds before the first retransmission.
    pub retransmit_interval: f64,
    pub max_retransmit: u32,
    pub echo_interval: f64,
    pub ssid_timeout: f64,
}

impl Default for Capwap {
    fn default() -> Self {
        Self {
            retransmit_interval: 1.0,
            max_retransmit: 3,
            echo_interval: 60.0,
            ssid_timeout: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Dtls {
    pub timeout: f64,
    pub shutdown_max_retransmit: u32,
}

impl Default for Dtls {
    fn default() -> Self {
        Self {
            timeout: 10.0,
            shutdown_max_retransmit: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientBackoff {
    pub slot_time: f64,
    pub max_retries: u32,
}

impl Default for ClientBackoff {
    fn default() -> Self {
        Self {
            slot_time: 2.0,
            max_retries: 5,
        }
    }
}

/// DHCP backoff for clients without a static address.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Dhcp {
    pub slot_time: f64,
    pub max_retries: u32,
    /// Seconds to pause after a DHCPNAK.
    pub nak_wait: f64,
}

impl Default for Dhcp {
    fn default() -> Self {
        Self {
            slot_time: 2.0,
            max_retries: 3,
            nak_wait: 1.0,
        }
    }
}

/// Admission ceilings. `client_association` is unbounded unless set.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Concurrency {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ap_join: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_association: Option<usize>,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            ap_join: Some(50),
            client_association: None,
        }
    }
}

/// What the APs say about themselves in Discovery and Join.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Identity {
    pub serial_number: String,
    pub model: String,
    pub location: String,
    pub country: String,
    /// Dotted four-part version, e.g. "8.3.102.0".
    pub software_version: String,
}

impl Default for Identity {
    fn default() -> Self {
        let core = ApIdentity::default();
        Self {
            serial_number: core.serial_number,
            model: core.model,
            location: core.location,
            country: core.country,
            software_version: core.software_version.map(|part| part.to_string()).join("."),
        }
    }
}

// ── Validation and translation ──────────────────────────────────────

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(field, format!("expected a positive number of seconds, got {value}")));
    }
    Duration::try_from_secs_f64(value).map_err(|e| invalid(field, e.to_string()))
}

fn ceiling(field: &str, value: Option<usize>) -> Result<Option<usize>, ConfigError> {
    match value {
        Some(0) => Err(invalid(field, "a ceiling of zero would admit nothing")),
        other => Ok(other),
    }
}

fn software_version(value: &str) -> Result<[u8; 4], ConfigError> {
    let parts: Vec<u8> = value
        .split('.')
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|e| invalid("ap.software_version", format!("'{value}': {e}")))?;
    <[u8; 4]>::try_from(parts)
        .map_err(|_| invalid("ap.software_version", format!("'{value}' must have four parts")))
}

impl Config {
    /// Reject values the state machines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_wireless_config().map(|_| ())
    }

    /// Validate and build the runtime configuration for the core.
    pub fn to_wireless_config(&self) -> Result<WirelessConfig, ConfigError> {
        if self.capwap.max_retransmit == 0 {
            return Err(invalid("capwap.max_retransmit", "must be at least 1"));
        }
        if self.client.slot_time < 1.0 || !self.client.slot_time.is_finite() {
            return Err(invalid(
                "client.slot_time",
                format!("must be at least 1, got {}", self.client.slot_time),
            ));
        }
        if self.dhcp.slot_time < 1.0 || !self.dhcp.slot_time.is_finite() {
            return Err(invalid(
                "dhcp.slot_time",
                format!("must be at least 1, got {}", self.dhcp.slot_time),
            ));
        }
        if self.dhcp.max_retries == 0 {
            return Err(invalid("dhcp.max_retries", "must be at least 1"));
        }
        if self.rx_queue_len == 0 {
            return Err(invalid("rx_queue_len", "must be at least 1"));
        }
        if self.ap.country.len() != 3 {
            return Err(invalid(
                "ap.country",
                format!("expected a 3-character country string, got '{}'", self.ap.country),
            ));
        }

        Ok(WirelessConfig {
            capwap: CapwapTimers {
                retransmit_interval: seconds("capwap.retransmit_interval", self.capwap.retransmit_interval)?,
                max_retransmit: self.capwap.max_retransmit,
                echo_interval: seconds("capwap.echo_interval", self.capwap.echo_interval)?,
                ssid_timeout: seconds("capwap.ssid_timeout", self.capwap.ssid_timeout)?,
            },
            dtls: DtlsTimers {
                timeout: seconds("dtls.timeout", self.dtls.timeout)?,
                shutdown_max_retransmit: self.dtls.shutdown_max_retransmit,
            },
            client: AssociationTimers {
                slot_time: self.client.slot_time,
                max_retries: self.client.max_retries,
            },
            dhcp: DhcpTimers {
                slot_time: self.dhcp.slot_time,
                max_retries: self.dhcp.max_retries,
                nak_wait: seconds("dhcp.nak_wait", self.dhcp.nak_wait)?,
            },
            concurrency: AdmissionLimits {
                ap_join: ceiling("concurrency.ap_join", self.concurrency.ap_join)?,
                client_association: ceiling(
                    "concurrency.client_association",
                    self.concurrency.client_association,
                )?,
            },
            identity: ApIdentity {
                serial_number: self.ap.serial_number.clone(),
                model: self.ap.model.clone(),
                location: self.ap.location.clone(),
                country: self.ap.country.clone(),
                software_version: software_version(&self.ap.software_version)?,
            },
            wlc_ip: self.wlc_ip,
            rx_queue_len: self.rx_queue_len,
        })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "wlsim", "wlsim").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("wlsim");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load from the canonical path plus environment, then validate.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` plus environment, then validate. A missing file
/// yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_core_defaults() {
        let config = Config::default().to_wireless_config();
        assert!(matches!(config, Ok(ref c) if *c == WirelessConfig::default()));
    }

    #[test]
    fn software_version_needs_four_parts() {
        assert_eq!(software_version("8.3.102.0").ok(), Some([8, 3, 102, 0]));
        assert!(software_version("8.3.102").is_err());
        assert!(software_version("8.3.x.0").is_err());
    }
}
