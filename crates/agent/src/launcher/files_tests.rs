// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::{json, Value};

use crate::config::{DeviceConfig, HttpNodeAuth};
use crate::snapshot::{Settings, Snapshot};

use super::*;

fn config() -> DeviceConfig {
    DeviceConfig {
        device_id: Some("dev-1".to_owned()),
        token: Some("tok-1".to_owned()),
        credential_secret: Some("sec-1".to_owned()),
        forge_url: "https://forge.example.com".to_owned(),
        port: 1881,
        broker_url: Some("nats://broker:4222".to_owned()),
        broker_username: Some("device:team-9:dev-1".to_owned()),
        broker_password: Some("bpass".to_owned()),
        ..DeviceConfig::default()
    }
}

fn snapshot() -> Snapshot {
    serde_json::from_value(json!({
        "id": "s1",
        "description": "test flows",
        "flows": [{"id": "n1", "type": "tab"}],
        "credentials": {"$": "enc"},
        "modules": {"node-red": "3.1.0"},
        "env": {"SNAP_VAR": "a", "SHARED": "snap"}
    }))
    .expect("snapshot")
}

fn settings(extra: Value) -> Settings {
    let mut base = json!({"hash": "h1", "env": {"SET_VAR": "b", "SHARED": "set"}});
    if let (Some(base_map), Value::Object(extra_map)) = (base.as_object_mut(), extra) {
        base_map.extend(extra_map);
    }
    serde_json::from_value(base).expect("settings")
}

fn read_json(dir: &std::path::Path, name: &str) -> Value {
    let contents = std::fs::read_to_string(dir.join(name))
        .unwrap_or_else(|e| panic!("read {name}: {e}"));
    serde_json::from_str(&contents).unwrap_or_else(|e| panic!("parse {name}: {e}"))
}

#[test]
fn writes_the_full_file_set() {
    let dir = tempfile::tempdir().expect("tempdir");
    let outcome = write_all(
        dir.path(),
        &snapshot(),
        &settings(json!({})),
        &config(),
        "https://forge.example.com/logging/device/dev-1/audit",
    )
    .expect("write_all");

    assert!(outcome.modules_changed);
    for name in [PACKAGE_FILE, FLOWS_FILE, CREDENTIALS_FILE, SETTINGS_JSON_FILE, SETTINGS_JS_FILE]
    {
        assert!(dir.path().join(name).exists(), "missing {name}");
    }

    let package = read_json(dir.path(), PACKAGE_FILE);
    assert_eq!(package["dependencies"]["node-red"], "3.1.0");

    let flows = read_json(dir.path(), FLOWS_FILE);
    assert_eq!(flows[0]["id"], "n1");

    let written = read_json(dir.path(), SETTINGS_JSON_FILE);
    assert_eq!(written["port"], 1881);
    assert_eq!(written["credentialSecret"], "sec-1");
    assert_eq!(written["flowforge"]["deviceId"], "dev-1");
    assert_eq!(
        written["flowforge"]["auditLogger"]["url"],
        "https://forge.example.com/logging/device/dev-1/audit"
    );
    assert_eq!(written["flowforge"]["projectLink"]["broker"]["url"], "nats://broker:4222");
}

#[test]
fn editor_version_overrides_package_dependency() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = settings(json!({"editor": {"nodeRedVersion": "4.0.0"}}));
    write_all(dir.path(), &snapshot(), &settings, &config(), "http://audit").expect("write_all");
    let package = read_json(dir.path(), PACKAGE_FILE);
    assert_eq!(package["dependencies"]["node-red"], "4.0.0");
}

#[test]
fn unchanged_modules_are_detected_on_rewrite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let snap = snapshot();
    let set = settings(json!({}));
    let first = write_all(dir.path(), &snap, &set, &config(), "http://audit").expect("first");
    assert!(first.modules_changed);

    let second = write_all(dir.path(), &snap, &set, &config(), "http://audit").expect("second");
    assert!(!second.modules_changed);

    let mut changed = snap.clone();
    changed.modules.insert("node-red-dashboard".to_owned(), "1.0.0".to_owned());
    let third = write_all(dir.path(), &changed, &set, &config(), "http://audit").expect("third");
    assert!(third.modules_changed);
}

#[test]
fn project_comms_false_empties_broker_credentials() {
    let dir = tempfile::tempdir().expect("tempdir");
    let set = settings(json!({"features": {"projectComms": false}}));
    write_all(dir.path(), &snapshot(), &set, &config(), "http://audit").expect("write_all");

    let written = read_json(dir.path(), SETTINGS_JSON_FILE);
    let broker = &written["flowforge"]["projectLink"]["broker"];
    // Emptied, not removed.
    assert_eq!(broker["url"], "");
    assert_eq!(broker["username"], "");
    assert_eq!(broker["password"], "");
}

#[test]
fn no_broker_config_omits_project_link() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = config();
    cfg.broker_url = None;
    cfg.broker_username = None;
    cfg.broker_password = None;
    write_all(dir.path(), &snapshot(), &settings(json!({})), &cfg, "http://audit")
        .expect("write_all");
    let written = read_json(dir.path(), SETTINGS_JSON_FILE);
    assert!(written["flowforge"].get("projectLink").is_none());
}

#[test]
fn env_merges_settings_over_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let outcome = write_all(dir.path(), &snapshot(), &settings(json!({})), &config(), "http://a")
        .expect("write_all");
    let env: std::collections::HashMap<_, _> = outcome.env.into_iter().collect();
    assert_eq!(env.get("SNAP_VAR").map(String::as_str), Some("a"));
    assert_eq!(env.get("SET_VAR").map(String::as_str), Some("b"));
    assert_eq!(env.get("SHARED").map(String::as_str), Some("set"));
}

#[test]
fn npmrc_written_and_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let with_npmrc = settings(json!({"palette": {"npmrc": "registry=https://npm.internal\n"}}));
    write_all(dir.path(), &snapshot(), &with_npmrc, &config(), "http://a").expect("write");
    assert!(dir.path().join(NPMRC_FILE).exists());

    write_all(dir.path(), &snapshot(), &settings(json!({})), &config(), "http://a")
        .expect("rewrite");
    assert!(!dir.path().join(NPMRC_FILE).exists());
}

#[test]
fn catalogues_land_in_editor_theme() {
    let dir = tempfile::tempdir().expect("tempdir");
    let set = settings(json!({"palette": {"catalogues": ["https://catalog.example.com/c.json"]}}));
    write_all(dir.path(), &snapshot(), &set, &config(), "http://a").expect("write");
    let written = read_json(dir.path(), SETTINGS_JSON_FILE);
    assert_eq!(
        written["editorTheme"]["palette"]["catalogues"][0],
        "https://catalog.example.com/c.json"
    );
}

#[test]
fn http_node_auth_is_passed_through() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = config();
    cfg.http_node_auth =
        Some(HttpNodeAuth { user: "admin".to_owned(), pass: "secret".to_owned() });
    write_all(dir.path(), &snapshot(), &settings(json!({})), &cfg, "http://a").expect("write");
    let written = read_json(dir.path(), SETTINGS_JSON_FILE);
    assert_eq!(written["httpNodeAuth"]["user"], "admin");
}

#[test]
fn remove_generated_clears_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_all(dir.path(), &snapshot(), &settings(json!({})), &config(), "http://a")
        .expect("write");
    remove_generated(dir.path());
    assert!(!dir.path().join(PACKAGE_FILE).exists());
    assert!(!dir.path().join(SETTINGS_JSON_FILE).exists());
    assert!(!dir.path().join(FLOWS_FILE).exists());
}
