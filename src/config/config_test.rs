use serial_test::serial;
use temp_env::with_vars;

use super::*;
use crate::Error;

fn cleanup_all_autoprop_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("AUTOPROP__") || key == "CONFIG_PATH" {
            std::env::remove_var(&key);
        }
    }
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = BrokerConfig::default();

    assert_eq!(config.server.name, "PropertyServer");
    assert_eq!(config.server.event_channel_capacity, 1024);
    assert_eq!(config.server.max_outstanding_requests, 65536);
    assert!(!config.server.strict_protocol);
    assert_eq!(config.tracker.cleanup_threshold, 256);
    assert_eq!(config.tracker.cleanup_interval_ms, 30_000);
}

#[test]
#[serial]
fn new_should_merge_environment_overrides() {
    cleanup_all_autoprop_env_vars();
    with_vars(
        vec![
            ("AUTOPROP__SERVER__NAME", Some("settings")),
            ("AUTOPROP__SERVER__STRICT_PROTOCOL", Some("true")),
            ("AUTOPROP__TRACKER__CLEANUP_THRESHOLD", Some("16")),
        ],
        || {
            let config = BrokerConfig::new().unwrap();

            assert_eq!(config.server.name, "settings");
            assert!(config.server.strict_protocol);
            assert_eq!(config.tracker.cleanup_threshold, 16);
            assert_eq!(config.tracker.cleanup_interval_ms, 30_000);
        },
    );
}

#[test]
#[serial]
fn new_should_load_config_path_file() {
    cleanup_all_autoprop_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("broker.toml");
    std::fs::write(
        &config_path,
        r#"
        [server]
        name = "from-file"
        event_channel_capacity = 8
        "#,
    )
    .unwrap();

    with_vars(
        vec![
            ("CONFIG_PATH", Some(config_path.to_str().unwrap())),
            ("AUTOPROP__SERVER__EVENT_CHANNEL_CAPACITY", Some("16")),
        ],
        || {
            let config = BrokerConfig::new().unwrap();

            assert_eq!(config.server.name, "from-file");
            // Environment beats the file.
            assert_eq!(config.server.event_channel_capacity, 16);
        },
    );
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_autoprop_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("override.toml");
    std::fs::write(
        &config_path,
        r#"
        [tracker]
        cleanup_interval_ms = 500 # Override default value
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let base_config = BrokerConfig::named("base");
        let config = base_config
            .with_override_config(config_path.to_str().unwrap())
            .unwrap()
            .validate()
            .unwrap();

        assert_eq!(config.server.name, "base");
        assert_eq!(config.tracker.cleanup_interval_ms, 500);
        assert_eq!(config.tracker.cleanup_threshold, 256);
    });
}

#[test]
fn validation_should_reject_zero_values() {
    let mut config = BrokerConfig::default();
    config.server.event_channel_capacity = 0;
    assert!(matches!(config.validate(), Err(Error::Config(_))));

    let mut config = BrokerConfig::default();
    config.server.max_outstanding_requests = 0;
    assert!(matches!(config.validate(), Err(Error::Config(_))));

    let mut config = BrokerConfig::default();
    config.tracker.cleanup_interval_ms = 0;
    assert!(matches!(config.validate(), Err(Error::Config(_))));

    let mut config = BrokerConfig::default();
    config.server.name = "  ".to_string();
    assert!(matches!(config.validate(), Err(Error::Config(_))));
}

#[test]
fn validation_should_reject_limit_above_hard_ceiling() {
    let mut config = BrokerConfig::default();
    config.server.max_outstanding_requests = 65537;
    assert!(config.validate().is_err());
}

#[test]
fn validation_should_accept_defaults() {
    assert!(BrokerConfig::default().validate().is_ok());
}
