// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn provisioning_file() -> Mapping {
    let yaml = r#"
provisioningName: factory-line-3
provisioningTeam: team-9
provisioningToken: ptok
forgeURL: https://forge.example.com
httpStatic: /data
customSection:
  nested: true
  count: 3
cliSetup: true
"#;
    serde_yaml::from_str(yaml).expect("yaml")
}

fn credentials() -> ProvisionedCredentials {
    serde_json::from_value(serde_json::json!({
        "deviceId": "dev-77",
        "token": "tok-77",
        "credentialSecret": "sec-77",
        "brokerURL": "nats://broker:4222",
        "brokerUsername": "device:team-9:dev-77",
        "brokerPassword": "bpass",
    }))
    .expect("credentials")
}

fn get<'a>(mapping: &'a Mapping, key: &str) -> Option<&'a Value> {
    mapping.get(&Value::from(key))
}

#[test]
fn issued_credentials_are_written() {
    let mapping = build_device_config(&provisioning_file(), &credentials(), "https://forge.example.com");
    assert_eq!(get(&mapping, "deviceId").and_then(Value::as_str), Some("dev-77"));
    assert_eq!(get(&mapping, "token").and_then(Value::as_str), Some("tok-77"));
    assert_eq!(get(&mapping, "credentialSecret").and_then(Value::as_str), Some("sec-77"));
    assert_eq!(get(&mapping, "brokerURL").and_then(Value::as_str), Some("nats://broker:4222"));
    assert_eq!(
        get(&mapping, "brokerUsername").and_then(Value::as_str),
        Some("device:team-9:dev-77")
    );
    assert_eq!(get(&mapping, "forgeURL").and_then(Value::as_str), Some("https://forge.example.com"));
    assert_eq!(get(&mapping, "autoProvisioned").and_then(Value::as_bool), Some(true));
}

#[test]
fn provisioning_keys_are_dropped() {
    let mapping = build_device_config(&provisioning_file(), &credentials(), "https://forge");
    for key in ["provisioningName", "provisioningTeam", "provisioningToken", "cliSetup"] {
        assert!(get(&mapping, key).is_none(), "{key} must not survive provisioning");
    }
}

#[test]
fn user_extras_survive_verbatim() {
    let mapping = build_device_config(&provisioning_file(), &credentials(), "https://forge");
    assert_eq!(get(&mapping, "httpStatic").and_then(Value::as_str), Some("/data"));

    let custom = get(&mapping, "customSection").and_then(Value::as_mapping).expect("custom");
    assert_eq!(custom.get(&Value::from("nested")).and_then(Value::as_bool), Some(true));
    assert_eq!(custom.get(&Value::from("count")).and_then(Value::as_u64), Some(3));
}

#[test]
fn stale_identity_in_the_provisioning_file_cannot_leak() {
    let mut original = provisioning_file();
    original.insert(Value::from("deviceId"), Value::from("stale-device"));
    original.insert(Value::from("token"), Value::from("stale-token"));

    let mapping = build_device_config(&original, &credentials(), "https://forge");
    assert_eq!(get(&mapping, "deviceId").and_then(Value::as_str), Some("dev-77"));
    assert_eq!(get(&mapping, "token").and_then(Value::as_str), Some("tok-77"));
}

#[test]
fn platform_issued_forge_url_wins() {
    let mut credentials = credentials();
    credentials.forge_url = Some("https://forge2.example.com".to_owned());
    let mapping = build_device_config(&provisioning_file(), &credentials, "https://forge.example.com");
    assert_eq!(
        get(&mapping, "forgeURL").and_then(Value::as_str),
        Some("https://forge2.example.com")
    );
}

#[test]
fn result_parses_as_a_valid_device_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("device.yml");
    let mapping = build_device_config(&provisioning_file(), &credentials(), "https://forge.example.com");
    config::save_raw(&path, &mapping).expect("save");

    let (device, _) = config::load(&path).expect("load");
    assert!(device.validate().is_ok());
    assert!(!device.is_provisioning());
    assert_eq!(device.team_id(), Some("team-9"));
    assert!(device.auto_provisioned);
}
