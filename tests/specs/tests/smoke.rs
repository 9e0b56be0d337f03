// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `outpost` binary: startup
//! validation, graceful shutdown, and the on-disk state formats.

use std::process::Command;
use std::time::Duration;

use outpost_specs::{outpost_binary, OutpostProcess};

const VALID_CONFIG: &str = "\
deviceId: dev-smoke
token: tok-smoke
forgeURL: http://127.0.0.1:9
";

// -- Process lifecycle --------------------------------------------------------

#[test]
fn help_exits_zero() {
    let output = Command::new(outpost_binary())
        .arg("--help")
        .output()
        .expect("run --help");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("--config"), "help text: {text}");
}

#[test]
fn missing_config_file_is_fatal() {
    let output = Command::new(outpost_binary())
        .args(["--config", "/nonexistent/device.yml"])
        .output()
        .expect("run with missing config");
    assert!(!output.status.success());
}

#[tokio::test]
async fn invalid_config_is_fatal() {
    // No credentials at all: startup must fail fast with a non-zero code.
    let mut agent = OutpostProcess::start("forgeURL: http://127.0.0.1:9\n").expect("spawn");
    let status = agent.wait_exit(Duration::from_secs(10)).await.expect("exit");
    assert!(!status.success());
}

#[tokio::test]
async fn valid_config_survives_unreachable_platform() {
    let mut agent = OutpostProcess::start(VALID_CONFIG).expect("spawn");
    // The platform is unreachable; check-ins fail but the agent stays up.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(agent.is_alive(), "agent exited while platform was merely unreachable");
}

#[tokio::test]
async fn sigterm_shuts_down_cleanly() {
    let mut agent = OutpostProcess::start(VALID_CONFIG).expect("spawn");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(agent.is_alive());

    agent.terminate().expect("terminate");
    let status = agent.wait_exit(Duration::from_secs(10)).await.expect("exit");
    assert_eq!(status.code(), Some(0));
}

#[tokio::test]
async fn provisioning_config_keeps_polling() {
    let config = "\
provisioningName: bench
provisioningTeam: team-9
provisioningToken: ptok
forgeURL: http://127.0.0.1:9
";
    let mut agent = OutpostProcess::start(config).expect("spawn");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(agent.is_alive(), "provisioning agent gave up");
}

// -- Library-level round trips ------------------------------------------------

#[test]
fn desired_state_round_trips_through_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = outpost::store::StateStore::new(dir.path());

    let state: outpost::store::PersistedState = serde_json::from_value(serde_json::json!({
        "project": "p1",
        "snapshot": {"id": "s1", "flows": [{"id": "n1", "type": "tab"}]},
        "settings": {"hash": "h1"},
        "mode": "autonomous",
    }))
    .expect("state");

    store.save(&state).expect("save");
    assert_eq!(store.load(), state);
}

#[test]
fn legacy_store_format_migrates_and_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = outpost::store::StateStore::new(dir.path());
    std::fs::write(
        store.path(),
        serde_json::json!({
            "id": "legacy",
            "flows": [],
            "device": {"hash": "legacy-hash"},
        })
        .to_string(),
    )
    .expect("write legacy");

    let migrated = store.load();
    assert_eq!(migrated.snapshot_id(), Some("legacy"));
    assert_eq!(migrated.settings_hash(), Some("legacy-hash"));

    store.save(&migrated).expect("save");
    assert_eq!(store.load(), migrated);
}

#[test]
fn provisioned_config_round_trips_through_yaml() {
    let original: serde_yaml::Mapping = serde_yaml::from_str(
        "provisioningTeam: team-9\nprovisioningToken: ptok\nforgeURL: https://forge\nhttpStatic: /data\n",
    )
    .expect("yaml");
    let credentials: outpost::provision::ProvisionedCredentials =
        serde_json::from_value(serde_json::json!({"deviceId": "d", "token": "t"}))
            .expect("credentials");

    let mapping = outpost::provision::build_device_config(&original, &credentials, "https://forge");
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("device.yml");
    outpost::config::save_raw(&path, &mapping).expect("save");

    let (config, raw) = outpost::config::load(&path).expect("load");
    assert!(config.validate().is_ok());
    assert_eq!(
        raw.get(&serde_yaml::Value::from("httpStatic")).and_then(|v| v.as_str()),
        Some("/data")
    );
}
