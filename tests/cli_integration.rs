//! CLI integration tests.
//!
//! These tests verify the CLI argument parsing and configuration loading.

use std::ffi::OsString;
use std::io::Write;
use tempfile::NamedTempFile;

use runspace_coordinator::cli::{parse_args_from, Args};
use runspace_coordinator::config::Config;
use runspace_coordinator::EngineVersion;

fn args(args: &[&str]) -> Vec<OsString> {
    std::iter::once("runspace-coordinator")
        .chain(args.iter().copied())
        .map(OsString::from)
        .collect()
}

// ============================================================================
// CLI Argument Tests
// ============================================================================

#[test]
fn test_cli_defaults() {
    let result = parse_args_from(args(&[])).unwrap();

    assert!(result.config.is_none());
    assert!(result.log_level.is_none());
    assert!(result.min_engine_version.is_none());
    assert!(!result.no_probe);
    assert!(!result.help);
    assert!(!result.version);
}

#[test]
fn test_cli_full_options() {
    let result = parse_args_from(args(&[
        "--config",
        "coordinator.json",
        "--log-level",
        "debug",
        "--min-engine-version",
        "7.4",
        "--no-probe",
    ]))
    .unwrap();

    assert_eq!(
        result.config.unwrap().to_str().unwrap(),
        "coordinator.json"
    );
    assert_eq!(result.log_level, Some("debug".to_string()));
    assert_eq!(result.min_engine_version, Some("7.4".to_string()));
    assert!(result.no_probe);
}

#[test]
fn test_cli_missing_value() {
    let result = parse_args_from(args(&["--config"]));
    assert!(result.is_err());
}

#[test]
fn test_cli_unknown_option() {
    let result = parse_args_from(args(&["--port", "3000"]));
    assert!(result.is_err());
}

// ============================================================================
// Configuration Loading Tests
// ============================================================================

#[test]
fn test_config_from_json_file() {
    let json = r#"{
        "execution": {
            "minimum_engine_version": "7.0",
            "probe_after_execution": false
        },
        "debugger": {
            "restart_read_loop_after_resume": false
        },
        "events": {
            "capacity": 64
        },
        "logging": {
            "level": "debug"
        }
    }"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.execution.minimum_engine_version, "7.0");
    assert!(!config.execution.probe_after_execution);
    assert!(!config.debugger.restart_read_loop_after_resume);
    assert_eq!(config.events.capacity, 64);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_config_priority_cli_over_file() {
    let json = r#"{
        "execution": {
            "minimum_engine_version": "6.0",
            "probe_after_execution": true
        },
        "logging": { "level": "warn" }
    }"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let args = Args {
        config: Some(file.path().to_path_buf()),
        log_level: Some("trace".to_string()),
        min_engine_version: Some("7.2".to_string()),
        no_probe: true,
        ..Args::default()
    };

    let config = Config::load(&args).unwrap();

    // CLI values should win
    assert_eq!(config.logging.level, "trace");
    assert_eq!(config.execution.minimum_engine_version, "7.2");
    assert!(!config.execution.probe_after_execution);
}

#[test]
fn test_config_missing_file() {
    let args = Args {
        config: Some("/nonexistent/coordinator.json".into()),
        ..Args::default()
    };

    assert!(Config::load(&args).is_err());
}

#[test]
fn test_config_to_coordinator_config() {
    let args = Args {
        min_engine_version: Some("7.1".to_string()),
        no_probe: true,
        ..Args::default()
    };

    let config = Config::load(&args).unwrap();
    let runtime = config.coordinator_config().unwrap();

    assert_eq!(runtime.minimum_engine_version, EngineVersion::new(7, 1));
    assert!(!runtime.probe_after_execution);
    assert!(runtime.restart_read_loop_after_resume);
    assert_eq!(runtime.event_capacity, 256);
}

// ============================================================================
// Configuration Serialization Tests
// ============================================================================

#[test]
fn test_config_roundtrip() {
    let original = Config::default();
    let json = serde_json::to_string(&original).unwrap();
    let loaded: Config = serde_json::from_str(&json).unwrap();

    assert_eq!(
        original.execution.minimum_engine_version,
        loaded.execution.minimum_engine_version
    );
    assert_eq!(original.events.capacity, loaded.events.capacity);
}

#[test]
fn test_config_partial_deserialization() {
    // Only specify some fields, others should use defaults
    let json = r#"{"events": {"capacity": 8}}"#;
    let config: Config = serde_json::from_str(json).unwrap();

    assert_eq!(config.events.capacity, 8);
    assert_eq!(config.execution.minimum_engine_version, "5.1"); // Default
    assert!(config.execution.probe_after_execution); // Default
}
