// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::config::DeviceConfig;
use crate::ring::LogRing;
use crate::transport::ControlClient;

use super::*;

#[test]
fn topics_follow_the_device_namespace() {
    let topics = Topics::new("team-9", "dev-1");
    assert_eq!(topics.status, "ff/v1/team-9/d/dev-1/status");
    assert_eq!(topics.logs, "ff/v1/team-9/d/dev-1/logs");
    assert_eq!(topics.command, "ff/v1/team-9/d/dev-1/command");
    assert_eq!(topics.response, "ff/v1/team-9/d/dev-1/response");
}

#[test]
fn command_envelope_parses_platform_fields() {
    let payload = json!({
        "command": "action",
        "correlationData": {"id": 17},
        "responseTopic": "ff/v1/t/d/dev/response",
        "payload": {"action": "restart"},
    })
    .to_string();
    let envelope: CommandEnvelope = serde_json::from_str(&payload).expect("envelope");
    assert_eq!(envelope.command, "action");
    assert_eq!(envelope.correlation_data, Some(json!({"id": 17})));
    assert_eq!(envelope.response_topic.as_deref(), Some("ff/v1/t/d/dev/response"));
    assert_eq!(envelope.payload, Some(json!({"action": "restart"})));
}

/// Spin up a live control loop backed by a temp dir; the forge URL is
/// unroutable so nothing leaves the process.
fn live_agent(dir: &std::path::Path) -> (AgentHandle, CancellationToken) {
    let config = Arc::new(DeviceConfig {
        device_id: Some("dev-1".to_owned()),
        token: Some("tok".to_owned()),
        forge_url: "http://127.0.0.1:9".to_owned(),
        dir: Some(dir.to_path_buf()),
        ..DeviceConfig::default()
    });
    let http = Arc::new(ControlClient::new(&config.forge_url, "dev-1", "tok").expect("client"));
    let ring = Arc::new(LogRing::new(32));
    let (agent, handle, channels) = Agent::new(config, http, ring);
    let shutdown = CancellationToken::new();
    tokio::spawn(agent.run(channels, shutdown.clone()));
    (handle, shutdown)
}

fn envelope(command: &str, payload: serde_json::Value) -> CommandEnvelope {
    CommandEnvelope {
        command: command.to_owned(),
        correlation_data: Some(json!("cd-1")),
        response_topic: None,
        payload: Some(payload),
    }
}

#[tokio::test]
async fn unsupported_action_yields_error_payload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (handle, shutdown) = live_agent(dir.path());
    let mut streaming = false;

    let response =
        handle_command(&handle, &envelope("action", json!({"action": "reboot"})), &mut streaming)
            .await
            .expect("handled");
    let body = response.expect("response body");
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "unsupported_action");

    shutdown.cancel();
}

#[tokio::test]
async fn missing_action_field_is_unsupported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (handle, shutdown) = live_agent(dir.path());
    let mut streaming = false;

    let response = handle_command(&handle, &envelope("action", json!({})), &mut streaming)
        .await
        .expect("handled");
    assert_eq!(response.expect("body")["error"]["code"], "unsupported_action");

    shutdown.cancel();
}

#[tokio::test]
async fn known_actions_succeed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (handle, shutdown) = live_agent(dir.path());
    let mut streaming = false;

    for action in ["start", "restart", "suspend"] {
        let response =
            handle_command(&handle, &envelope("action", json!({"action": action})), &mut streaming)
                .await
                .expect("handled");
        assert_eq!(response.expect("body")["success"], true, "action {action}");
    }

    shutdown.cancel();
}

#[tokio::test]
async fn update_command_feeds_the_control_loop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (handle, shutdown) = live_agent(dir.path());
    let mut streaming = false;

    let response =
        handle_command(&handle, &envelope("update", serde_json::Value::Null), &mut streaming)
            .await
            .expect("handled");
    assert!(response.is_none(), "update has no response");

    // The null desired state clears the agent to `stopped`.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let report = handle.report().await.expect("report");
        if report.state == crate::state::AgentState::Stopped {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "agent never stopped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
}

#[tokio::test]
async fn start_editor_without_token_is_a_handler_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (handle, shutdown) = live_agent(dir.path());
    let mut streaming = false;

    let result = handle_command(&handle, &envelope("startEditor", json!({})), &mut streaming).await;
    assert!(result.is_err());

    shutdown.cancel();
}

#[tokio::test]
async fn start_editor_reports_connection_state_and_echoes_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (handle, shutdown) = live_agent(dir.path());
    let mut streaming = false;

    let response = handle_command(
        &handle,
        &envelope("startEditor", json!({"token": "tok-editor"})),
        &mut streaming,
    )
    .await
    .expect("handled");
    let body = response.expect("body");
    // Runtime is down, so the tunnel is not up — but the response arrives.
    assert_eq!(body["connected"], false);
    assert_eq!(body["token"], "tok-editor");

    let response = handle_command(&handle, &envelope("stopEditor", json!({})), &mut streaming)
        .await
        .expect("handled");
    assert_eq!(response.expect("body")["success"], true);

    shutdown.cancel();
}

#[tokio::test]
async fn log_commands_toggle_streaming() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (handle, shutdown) = live_agent(dir.path());
    let mut streaming = false;

    let response = handle_command(&handle, &envelope("startLog", json!({})), &mut streaming)
        .await
        .expect("handled");
    assert!(response.is_none());
    assert!(streaming);

    let response = handle_command(&handle, &envelope("stopLog", json!({})), &mut streaming)
        .await
        .expect("handled");
    assert!(response.is_none());
    assert!(!streaming);

    shutdown.cancel();
}

#[tokio::test]
async fn upload_returns_current_materialization() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (handle, shutdown) = live_agent(dir.path());
    let mut streaming = false;

    let response = handle_command(&handle, &envelope("upload", json!({})), &mut streaming)
        .await
        .expect("handled");
    let body = response.expect("body");
    assert_eq!(body["flows"], json!([]));
    assert_eq!(body["credentials"], json!({}));

    shutdown.cancel();
}

#[tokio::test]
async fn unknown_commands_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (handle, shutdown) = live_agent(dir.path());
    let mut streaming = false;

    let response = handle_command(&handle, &envelope("selfdestruct", json!({})), &mut streaming)
        .await
        .expect("handled");
    assert!(response.is_none());

    shutdown.cancel();
}
