use std::io::Write;

use gallerysync_client::{
    DuplicatePolicy,
    config::{
        ClientConfig, ConfigLoadError, DEFAULT_SERVER_URL, MAX_CONFIG_BYTES, load_config_from_path,
        parse_config_json,
    },
};
use gallerysync_core::MAX_SUBMISSION_FILE_BYTES;

#[test]
fn load_config_rejects_oversized_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("gallerysync.json");

    let mut file = std::fs::File::create(&path).expect("create gallerysync.json");
    file.write_all(&vec![b' '; (MAX_CONFIG_BYTES as usize) + 1024])
        .expect("write oversized gallerysync.json");
    drop(file);

    let err = load_config_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
}

#[test]
fn missing_fields_fall_back_to_defaults() {
    let config = parse_config_json(r#"{ "duplicate_policy": "replace_in_place" }"#)
        .expect("partial config parses");
    assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    assert_eq!(config.duplicate_policy, DuplicatePolicy::ReplaceInPlace);
    assert_eq!(config.pending_timeout_secs, 30);
    assert_eq!(config.max_file_bytes, MAX_SUBMISSION_FILE_BYTES as u64);
    assert!(config.validate().is_ok());
}

#[test]
fn load_config_reads_a_valid_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("gallerysync.json");
    std::fs::write(
        &path,
        r#"{ "server_url": "wss://gallery.example/ws", "connect_timeout_ms": 2500 }"#,
    )
    .expect("write gallerysync.json");

    let config = load_config_from_path(&path).expect("valid config loads");
    assert_eq!(config.server_url, "wss://gallery.example/ws");
    assert_eq!(
        config.channel_config().connect_timeout,
        std::time::Duration::from_millis(2500)
    );
}

#[test]
fn load_config_rejects_non_websocket_scheme() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("gallerysync.json");
    std::fs::write(&path, r#"{ "server_url": "http://127.0.0.1:8000/ws" }"#)
        .expect("write gallerysync.json");

    let err = load_config_from_path(&path).expect_err("http scheme should be refused");
    assert!(matches!(err, ConfigLoadError::Invalid(ref reason) if reason.contains("ws or wss")));
}

#[test]
fn load_config_reports_parse_errors() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("gallerysync.json");
    std::fs::write(&path, "{ not json").expect("write gallerysync.json");

    let err = load_config_from_path(&path).expect_err("garbage should not parse");
    assert!(matches!(err, ConfigLoadError::Parse(_)));
}

#[test]
fn validate_bounds_file_size_limit() {
    let config = ClientConfig {
        max_file_bytes: 0,
        ..ClientConfig::default()
    };
    assert!(config.validate().is_err());

    let config = ClientConfig {
        max_file_bytes: MAX_SUBMISSION_FILE_BYTES as u64 + 1,
        ..ClientConfig::default()
    };
    assert!(config.validate().is_err());

    let config = ClientConfig {
        pending_timeout_secs: 0,
        ..ClientConfig::default()
    };
    assert!(config.validate().is_err());
}
