// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authenticated HTTP client for the platform control API.
//!
//! Proxy resolution (`http_proxy` / `https_proxy` / `no_proxy`) is inherited
//! from reqwest's system-proxy support. Requests default to a 2 second
//! timeout and are never retried here; callers decide their own cadence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::AgentHandle;
use crate::snapshot::{Settings, Snapshot};
use crate::state::{DesiredUpdate, StateReport};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(30);

/// Outcome of a `POST live/state` check-in.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckIn {
    /// 200 with no desired-state body.
    Ok,
    /// 200 carrying a desired state; `None` means the device is unassigned.
    Desired(Option<DesiredUpdate>),
    /// 409 — the platform wants the snapshot re-fetched.
    Conflict,
    /// 401/402/404 — stop checking in.
    Stop,
}

/// Verified editor-token identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorTokenInfo {
    pub username: String,
    #[serde(default)]
    pub permissions: Value,
}

/// Bearer-authenticated client bound to one device identity.
pub struct ControlClient {
    client: reqwest::Client,
    forge_url: String,
    device_id: String,
    token_cache: TokenCache,
}

impl ControlClient {
    pub fn new(forge_url: &str, device_id: &str, token: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        crate::run::ensure_crypto();
        let client = reqwest::Client::builder()
            .user_agent(format!("outpost/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            forge_url: forge_url.trim_end_matches('/').to_owned(),
            device_id: device_id.to_owned(),
            token_cache: TokenCache::new(TOKEN_CACHE_TTL),
        })
    }

    pub fn forge_url(&self) -> &str {
        &self.forge_url
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn device_url(&self, tail: &str) -> String {
        format!("{}/api/v1/devices/{}/{tail}", self.forge_url, self.device_id)
    }

    /// Full URL of the device audit endpoint (also embedded into the
    /// runtime settings for its own audit logger).
    pub fn audit_url(&self) -> String {
        format!("{}/logging/device/{}/audit", self.forge_url, self.device_id)
    }

    /// Report current state; the response may carry the next desired state.
    pub async fn check_in(&self, report: &StateReport) -> anyhow::Result<CheckIn> {
        let resp =
            self.client.post(self.device_url("live/state")).json(report).send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.unwrap_or_default();
        checkin_outcome(status, &body)
    }

    pub async fn get_snapshot(&self) -> anyhow::Result<Snapshot> {
        let resp = self.client.get(self.device_url("live/snapshot")).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    pub async fn get_settings(&self) -> anyhow::Result<Settings> {
        let resp = self.client.get(self.device_url("live/settings")).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    /// Verify an editor access token against the platform.
    ///
    /// Successful verifications are cached for 30 seconds per token so the
    /// runtime's admin-auth checks don't hammer the platform.
    pub async fn verify_editor_token(&self, token: &str) -> anyhow::Result<EditorTokenInfo> {
        if let Some(info) = self.token_cache.get(token, Instant::now()) {
            return Ok(info);
        }
        let resp = self
            .client
            .get(self.device_url("editor/token"))
            .header("x-access-token", token)
            .send()
            .await?;
        let info: EditorTokenInfo = resp.error_for_status()?.json().await?;
        self.token_cache.put(token, info.clone(), Instant::now());
        Ok(info)
    }

    /// Ship an audit event to the platform. Failures are logged, not fatal.
    pub async fn post_audit(&self, event: &str, body: &Value) -> anyhow::Result<()> {
        let mut payload = match body {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        payload.insert("event".to_owned(), Value::String(event.to_owned()));
        let resp = self.client.post(self.audit_url()).json(&payload).send().await?;
        resp.error_for_status()?;
        Ok(())
    }
}

/// Map a check-in response to its outcome.
fn checkin_outcome(status: u16, body: &[u8]) -> anyhow::Result<CheckIn> {
    match status {
        200 => {
            if body.is_empty() {
                return Ok(CheckIn::Ok);
            }
            match serde_json::from_slice::<Value>(body) {
                Ok(Value::Null) => Ok(CheckIn::Desired(None)),
                Ok(value) => match serde_json::from_value::<DesiredUpdate>(value) {
                    Ok(update) => Ok(CheckIn::Desired(Some(update))),
                    Err(e) => {
                        warn!("check-in response did not parse as desired state: {e}");
                        Ok(CheckIn::Ok)
                    }
                },
                Err(_) => Ok(CheckIn::Ok),
            }
        }
        409 => Ok(CheckIn::Conflict),
        401 | 402 | 404 => Ok(CheckIn::Stop),
        s => anyhow::bail!("unexpected check-in status {s}"),
    }
}

/// 30-second per-token cache of verified editor tokens.
struct TokenCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, EditorTokenInfo)>>,
}

impl TokenCache {
    fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    fn get(&self, token: &str, now: Instant) -> Option<EditorTokenInfo> {
        let entries = self.entries.lock();
        let (at, info) = entries.get(token)?;
        if now.saturating_duration_since(*at) < self.ttl {
            Some(info.clone())
        } else {
            None
        }
    }

    fn put(&self, token: &str, info: EditorTokenInfo, now: Instant) {
        let mut entries = self.entries.lock();
        entries.retain(|_, (at, _)| now.saturating_duration_since(*at) < self.ttl);
        entries.insert(token.to_owned(), (now, info));
    }
}

/// Check in on an interval until cancelled; the fallback transport when no
/// broker is configured (and while the broker is unreachable).
///
/// The first tick fires immediately, so a fresh agent reports promptly.
pub async fn checkin_loop(
    client: Arc<ControlClient>,
    handle: AgentHandle,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        if !check_in_once(&client, &handle).await {
            break;
        }
    }
}

/// Perform one check-in and route the outcome. Returns false when checking
/// in should stop (platform refusal, or the agent is gone).
pub async fn check_in_once(client: &ControlClient, handle: &AgentHandle) -> bool {
    let Some(report) = handle.report().await else { return false };
    match client.check_in(&report).await {
        Ok(CheckIn::Ok) => true,
        Ok(CheckIn::Desired(update)) => {
            handle.push_desired(update);
            true
        }
        Ok(CheckIn::Conflict) => {
            handle.snapshot_conflict().await;
            true
        }
        Ok(CheckIn::Stop) => {
            warn!("platform refused check-in, stopping");
            handle.platform_refused().await;
            false
        }
        Err(e) => {
            debug!("check-in failed: {e}");
            true
        }
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
