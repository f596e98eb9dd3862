//! Settings file loading end-to-end: write JSON to a temp file, load
//! it through `Settings::from_file`, and check validation rejects the
//! cases §7/§8 call out.

use std::io::Write;

use octopusmq::config::Settings;
use octopusmq::error::ConfigError;

fn write_settings(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp settings file");
    file.write_all(json.as_bytes()).expect("write settings json");
    file.flush().expect("flush settings json");
    file
}

#[test]
fn loads_broadcast_bridge_settings() {
    let file = write_settings(
        r#"{
            "adapters": [
                {
                    "protocol": "bridge",
                    "interface": "*",
                    "port": 9000,
                    "discovery": { "mode": "broadcast" },
                    "send_port": 9000
                }
            ]
        }"#,
    );

    let settings = Settings::from_file(file.path()).expect("settings should load");
    assert_eq!(settings.adapters.len(), 1);
    assert_eq!(settings.adapters[0].port, 9000);
    assert_eq!(settings.adapters[0].protocol_name(), "bridge");
}

#[test]
fn rejects_recursive_loopback_bridge() {
    let file = write_settings(
        r#"{
            "adapters": [
                {
                    "protocol": "bridge",
                    "interface": "lo",
                    "port": 9000,
                    "discovery": { "mode": "unicast" }
                }
            ]
        }"#,
    );

    let err = Settings::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::RecursiveLoopback(_)));
}

#[test]
fn rejects_missing_settings_file() {
    let err = Settings::from_file("/nonexistent/path/settings.json").unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn rejects_malformed_json() {
    let file = write_settings("{ not json");
    let err = Settings::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}
