#![allow(clippy::unwrap_used)]

use std::net::Ipv4Addr;
use std::time::Duration;

use pretty_assertions::assert_eq;
use wlsim_config::{Config, ConfigError, load_config_from, save_config_to};

fn write(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        &dir,
        r#"
wlc_ip = "10.10.0.1"

[capwap]
retransmit_interval = 0.5
max_retransmit = 5
echo_interval = 30.0
ssid_timeout = 5.0

[concurrency]
ap_join = 8
client_association = 200
"#,
    );
    let config = load_config_from(&path).unwrap();
    let wireless = config.to_wireless_config().unwrap();

    assert_eq!(wireless.wlc_ip, Some(Ipv4Addr::new(10, 10, 0, 1)));
    assert_eq!(wireless.capwap.retransmit_interval, Duration::from_millis(500));
    assert_eq!(wireless.capwap.max_retransmit, 5);
    assert_eq!(wireless.capwap.echo_interval, Duration::from_secs(30));
    assert_eq!(wireless.concurrency.ap_join, Some(8));
    assert_eq!(wireless.concurrency.client_association, Some(200));
    // Untouched sections keep their defaults.
    assert_eq!(wireless.dtls.timeout, Duration::from_secs(10));
    assert_eq!(wireless.client.max_retries, 5);
}

#[test]
fn zero_retransmit_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(&dir, "[capwap]\nretransmit_interval = 1.0\nmax_retransmit = 0\necho_interval = 60.0\nssid_timeout = 5.0\n");
    let err = load_config_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "capwap.max_retransmit"));
}

#[test]
fn non_positive_interval_is_rejected() {
    let mut config = Config::default();
    config.capwap.echo_interval = 0.0;
    let err = config.validate().unwrap_err();
    assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "capwap.echo_interval"));
}

#[test]
fn zero_ceiling_is_rejected() {
    let mut config = Config::default();
    config.concurrency.ap_join = Some(0);
    assert!(config.validate().is_err());
}

#[test]
fn slot_time_below_one_is_rejected() {
    let mut config = Config::default();
    config.client.slot_time = 0.5;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("client.slot_time"));
}

#[test]
fn dhcp_section_reaches_the_core() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(&dir, "[dhcp]\nslot_time = 1.5\nmax_retries = 4\nnak_wait = 0.25\n");
    let wireless = load_config_from(&path).unwrap().to_wireless_config().unwrap();

    assert_eq!(wireless.dhcp.slot_time, 1.5);
    assert_eq!(wireless.dhcp.max_retries, 4);
    assert_eq!(wireless.dhcp.nak_wait, Duration::from_millis(250));
}

#[test]
fn dhcp_without_retries_is_rejected() {
    let mut config = Config::default();
    config.dhcp.max_retries = 0;
    let err = config.validate().unwrap_err();
    assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "dhcp.max_retries"));
}

#[test]
fn saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    let mut config = Config::default();
    config.wlc_ip = Some(Ipv4Addr::new(192, 168, 1, 2));
    config.ap.location = "lab rack 4".into();

    save_config_to(&config, &path).unwrap();
    let loaded = load_config_from(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn malformed_toml_surfaces_as_figment_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(&dir, "[capwap\nmax_retransmit = ");
    assert!(matches!(load_config_from(&path), Err(ConfigError::Figment(_))));
}
