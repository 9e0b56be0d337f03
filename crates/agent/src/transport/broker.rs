// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pub/sub broker client: status publishes, log streaming, and the
//! command/response RPC channel.
//!
//! While the broker is unreachable the agent falls back to HTTP polling;
//! commands arriving over the subscription are dispatched one at a time,
//! and a handler failure becomes an error response, never a crash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{ActionOutcome, AgentHandle};
use crate::config::DeviceConfig;
use crate::metrics::MetricsScraper;
use crate::ring::LogRing;
use crate::transport::http::{check_in_once, checkin_loop};
use crate::transport::ControlClient;

const CONNECT_BACKOFF_MIN: Duration = Duration::from_millis(500);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(10);
/// Window after the initial checkin in which an `update` command is
/// expected; an extra checkin fires otherwise to avoid silent drift.
const INITIAL_UPDATE_WINDOW: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Broker subjects for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub status: String,
    pub logs: String,
    pub command: String,
    pub response: String,
}

impl Topics {
    pub fn new(team: &str, device: &str) -> Self {
        let base = format!("ff/v1/{team}/d/{device}");
        Self {
            status: format!("{base}/status"),
            logs: format!("{base}/logs"),
            command: format!("{base}/command"),
            response: format!("{base}/response"),
        }
    }
}

/// Platform command envelope; the response echoes `command` and
/// `correlationData`.
#[derive(Debug, Default, Deserialize)]
struct CommandEnvelope {
    #[serde(default)]
    command: String,
    #[serde(default, rename = "correlationData")]
    correlation_data: Option<Value>,
    #[serde(default, rename = "responseTopic")]
    response_topic: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Run the broker transport until shutdown.
///
/// Connect failures and disconnects degrade to HTTP polling; the broker is
/// retried with backoff the whole time.
pub async fn run(
    config: Arc<DeviceConfig>,
    http: Arc<ControlClient>,
    handle: AgentHandle,
    ring: Arc<LogRing>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let (Some(url), Some(team)) = (config.broker_url.clone(), config.team_id()) else {
        warn!("broker config incomplete, staying on HTTP polling");
        checkin_loop(http, handle, poll_interval, shutdown).await;
        return;
    };
    let topics = Topics::new(team, http.device_id());

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        // HTTP fallback while the broker is down.
        let fallback = shutdown.child_token();
        let fallback_task = tokio::spawn(checkin_loop(
            Arc::clone(&http),
            handle.clone(),
            poll_interval,
            fallback.clone(),
        ));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let Some(client) = connect(&config, &url, event_tx, &shutdown).await else {
            fallback.cancel();
            return;
        };
        fallback.cancel();
        let _ = fallback_task.await;
        info!("broker connected");

        serve(&client, &topics, &config, &http, &handle, &ring, poll_interval, &shutdown, event_rx)
            .await;

        if shutdown.is_cancelled() {
            return;
        }
        warn!("broker session ended, reconnecting");
    }
}

/// Connect with backoff; `None` means shutdown was requested.
async fn connect(
    config: &DeviceConfig,
    url: &str,
    event_tx: mpsc::UnboundedSender<async_nats::Event>,
    shutdown: &CancellationToken,
) -> Option<async_nats::Client> {
    let mut backoff = CONNECT_BACKOFF_MIN;
    loop {
        let options = async_nats::ConnectOptions::with_user_and_password(
            config.broker_username.clone().unwrap_or_default(),
            config.broker_password.clone().unwrap_or_default(),
        )
        .event_callback({
            let event_tx = event_tx.clone();
            move |event| {
                let event_tx = event_tx.clone();
                async move {
                    let _ = event_tx.send(event);
                }
            }
        });

        match options.connect(url).await {
            Ok(client) => return Some(client),
            Err(e) => debug!("broker connect failed: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
    }
}

/// One broker session: command dispatch, heartbeat, log streaming, and
/// disconnect-driven fallback.
#[allow(clippy::too_many_arguments)]
async fn serve(
    client: &async_nats::Client,
    topics: &Topics,
    config: &Arc<DeviceConfig>,
    http: &Arc<ControlClient>,
    handle: &AgentHandle,
    ring: &Arc<LogRing>,
    poll_interval: Duration,
    shutdown: &CancellationToken,
    mut event_rx: mpsc::UnboundedReceiver<async_nats::Event>,
) {
    let mut commands = match client.subscribe(topics.command.clone()).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!("cannot subscribe to {}: {e}", topics.command);
            return;
        }
    };

    // Initial checkin; if the platform stays silent, check in again.
    let update_seen = Arc::new(AtomicBool::new(false));
    {
        let http = Arc::clone(http);
        let handle = handle.clone();
        let update_seen = Arc::clone(&update_seen);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if !check_in_once(&http, &handle).await {
                return;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(INITIAL_UPDATE_WINDOW) => {}
            }
            if !update_seen.load(Ordering::Relaxed) {
                debug!("no update after initial checkin, checking in again");
                let _ = check_in_once(&http, &handle).await;
            }
        });
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut scraper = MetricsScraper::new(config.port, config.https.is_some());

    let mut log_rx = ring.subscribe();
    let mut log_streaming = false;

    // Fallback poller toggled by connection events.
    let mut fallback: Option<CancellationToken> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(token) = fallback.take() {
                    token.cancel();
                }
                return;
            }

            msg = commands.next() => {
                let Some(msg) = msg else {
                    if let Some(token) = fallback.take() {
                        token.cancel();
                    }
                    return;
                };
                dispatch(
                    client,
                    topics,
                    handle,
                    &msg.payload,
                    &update_seen,
                    &mut log_streaming,
                )
                .await;
            }

            _ = heartbeat.tick() => {
                publish_status(client, topics, handle, &mut scraper).await;
            }

            record = log_rx.recv() => {
                match record {
                    Ok(record) if log_streaming => {
                        if let Ok(payload) = serde_json::to_vec(&record) {
                            if let Err(e) =
                                client.publish(topics.logs.clone(), payload.into()).await
                            {
                                debug!("log publish failed: {e}");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("log stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                }
            }

            Some(event) = event_rx.recv() => {
                match event {
                    async_nats::Event::Disconnected => {
                        warn!("broker disconnected, HTTP polling takes over");
                        if fallback.is_none() {
                            let token = shutdown.child_token();
                            tokio::spawn(checkin_loop(
                                Arc::clone(http),
                                handle.clone(),
                                poll_interval,
                                token.clone(),
                            ));
                            fallback = Some(token);
                        }
                    }
                    async_nats::Event::Connected => {
                        info!("broker reconnected");
                        if let Some(token) = fallback.take() {
                            token.cancel();
                        }
                        publish_status(client, topics, handle, &mut scraper).await;
                    }
                    other => debug!("broker event: {other}"),
                }
            }
        }
    }
}

/// Publish the agent status (check-in body plus a metrics sample).
async fn publish_status(
    client: &async_nats::Client,
    topics: &Topics,
    handle: &AgentHandle,
    scraper: &mut MetricsScraper,
) {
    let Some(report) = handle.report().await else { return };
    let mut status = match serde_json::to_value(&report) {
        Ok(Value::Object(map)) => map,
        _ => return,
    };
    if let Some(sample) = scraper.sample().await {
        if let Ok(metrics) = serde_json::to_value(&sample) {
            status.insert("metrics".to_owned(), metrics);
        }
    }
    let Ok(payload) = serde_json::to_vec(&status) else { return };
    if let Err(e) = client.publish(topics.status.clone(), payload.into()).await {
        debug!("status publish failed: {e}");
    }
}

/// Dispatch one platform command and publish its response.
///
/// Handler failures are converted into error responses at this boundary.
async fn dispatch(
    client: &async_nats::Client,
    topics: &Topics,
    handle: &AgentHandle,
    payload: &[u8],
    update_seen: &AtomicBool,
    log_streaming: &mut bool,
) {
    let envelope: CommandEnvelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("unparseable command envelope: {e}");
            return;
        }
    };

    if envelope.command == "update" {
        update_seen.store(true, Ordering::Relaxed);
    }

    let response = match handle_command(handle, &envelope, log_streaming).await {
        Ok(response) => response,
        Err(e) => {
            warn!("command {} failed: {e}", envelope.command);
            Some(json!({
                "success": false,
                "error": {"code": "error", "error": e.to_string()},
            }))
        }
    };

    if let Some(body) = response {
        let reply = json!({
            "command": envelope.command,
            "correlationData": envelope.correlation_data,
            "payload": body,
        });
        let topic =
            envelope.response_topic.clone().unwrap_or_else(|| topics.response.clone());
        let Ok(bytes) = serde_json::to_vec(&reply) else { return };
        if let Err(e) = client.publish(topic, bytes.into()).await {
            debug!("response publish failed: {e}");
        }
    }
}

/// Execute one command. `Ok(None)` means the command has no response.
async fn handle_command(
    handle: &AgentHandle,
    envelope: &CommandEnvelope,
    log_streaming: &mut bool,
) -> anyhow::Result<Option<Value>> {
    match envelope.command.as_str() {
        "update" => {
            let update = match &envelope.payload {
                None | Some(Value::Null) => None,
                Some(value) => Some(serde_json::from_value(value.clone())?),
            };
            handle.push_desired(update);
            Ok(None)
        }

        "action" => {
            let action = envelope
                .payload
                .as_ref()
                .and_then(|p| p.get("action"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            match handle.action(action).await {
                ActionOutcome::Success => Ok(Some(json!({"success": true}))),
                ActionOutcome::UnsupportedAction => Ok(Some(json!({
                    "success": false,
                    "error": {"code": "unsupported_action", "error": "unsupported action"},
                }))),
            }
        }

        "startEditor" => {
            let token = envelope
                .payload
                .as_ref()
                .and_then(|p| p.get("token"))
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("startEditor payload has no token"))?;
            let connected = handle.start_editor(token).await;
            Ok(Some(json!({"connected": connected, "token": token})))
        }

        "stopEditor" => {
            handle.stop_editor().await;
            Ok(Some(json!({"success": true})))
        }

        "startLog" => {
            *log_streaming = true;
            Ok(None)
        }

        "stopLog" => {
            *log_streaming = false;
            Ok(None)
        }

        "upload" => Ok(Some(handle.upload().await)),

        other => {
            debug!("unknown command {other:?} ignored");
            Ok(None)
        }
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
