// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provisioning: an unclaimed device polls the platform until it is issued
//! device credentials, writes a fresh device config preserving the
//! user-supplied extras, and relaunches the control loop against it.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{self, DeviceConfig};

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Keys owned by the agent; everything else in the provisioning file is a
/// user-supplied extra and is carried into the new config verbatim.
pub const RESERVED_KEYS: &[&str] = &[
    "provisioningMode",
    "provisioningName",
    "provisioningTeam",
    "provisioningToken",
    "token",
    "forgeURL",
    "deviceId",
    "credentialSecret",
    "deviceFile",
    "brokerURL",
    "brokerUsername",
    "brokerPassword",
    "autoProvisioned",
    "cliSetup",
];

/// Credentials issued by the platform once the device is claimed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedCredentials {
    pub device_id: String,
    pub token: String,
    #[serde(default)]
    pub credential_secret: Option<String>,
    #[serde(default, rename = "forgeURL")]
    pub forge_url: Option<String>,
    #[serde(default, rename = "brokerURL")]
    pub broker_url: Option<String>,
    #[serde(default)]
    pub broker_username: Option<String>,
    #[serde(default)]
    pub broker_password: Option<String>,
}

/// How a provisioning run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// New credentials are on disk; relaunch the agent against them.
    Provisioned,
    Shutdown,
}

/// Client holding the provisioning token.
pub struct ProvisioningClient {
    client: reqwest::Client,
    forge_url: String,
}

impl ProvisioningClient {
    pub fn new(forge_url: &str, provisioning_token: &str) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut bearer: reqwest::header::HeaderValue =
            format!("Bearer {provisioning_token}").parse()?;
        bearer.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);
        crate::run::ensure_crypto();
        let client = reqwest::Client::builder()
            .user_agent(format!("outpost/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;
        Ok(Self { client, forge_url: forge_url.trim_end_matches('/').to_owned() })
    }

    /// Ask the platform to claim this device. `None` while unclaimed.
    pub async fn poll_for_assignment(
        &self,
        name: Option<&str>,
        team: Option<&str>,
    ) -> anyhow::Result<Option<ProvisionedCredentials>> {
        let body = serde_json::json!({"name": name, "team": team});
        let resp = self
            .client
            .post(format!("{}/api/v1/devices/", self.forge_url))
            .json(&body)
            .send()
            .await?;
        if resp.status().as_u16() == 200 {
            Ok(Some(resp.json().await?))
        } else {
            Ok(None)
        }
    }
}

/// Poll until claimed, then write the new device config atomically.
pub async fn run(
    config_path: &Path,
    config: &DeviceConfig,
    raw: &Mapping,
    shutdown: &CancellationToken,
) -> anyhow::Result<ProvisionOutcome> {
    let token = config
        .provisioning_token
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("provisioning token missing"))?;
    let client = ProvisioningClient::new(&config.forge_url, token)?;

    let mut timer = tokio::time::interval(POLL_INTERVAL);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(ProvisionOutcome::Shutdown),
            _ = timer.tick() => {}
        }

        match client
            .poll_for_assignment(
                config.provisioning_name.as_deref(),
                config.provisioning_team.as_deref(),
            )
            .await
        {
            Ok(Some(credentials)) => {
                info!(device = %credentials.device_id, "device claimed by platform");
                let mapping = build_device_config(raw, &credentials, &config.forge_url);
                config::save_raw(config_path, &mapping)?;
                return Ok(ProvisionOutcome::Provisioned);
            }
            Ok(None) => debug!("not claimed yet"),
            Err(e) => debug!("provisioning poll failed: {e}"),
        }
    }
}

/// Assemble the claimed-device config: issued credentials first, then the
/// user's extra keys from the provisioning file, verbatim.
pub fn build_device_config(
    original: &Mapping,
    credentials: &ProvisionedCredentials,
    forge_url: &str,
) -> Mapping {
    let mut mapping = Mapping::new();
    let mut set = |key: &str, value: Value| {
        mapping.insert(Value::from(key), value);
    };

    set("deviceId", Value::from(credentials.device_id.as_str()));
    set("token", Value::from(credentials.token.as_str()));
    if let Some(ref secret) = credentials.credential_secret {
        set("credentialSecret", Value::from(secret.as_str()));
    }
    let forge = credentials.forge_url.as_deref().unwrap_or(forge_url);
    set("forgeURL", Value::from(forge));
    if let Some(ref url) = credentials.broker_url {
        set("brokerURL", Value::from(url.as_str()));
    }
    if let Some(ref username) = credentials.broker_username {
        set("brokerUsername", Value::from(username.as_str()));
    }
    if let Some(ref password) = credentials.broker_password {
        set("brokerPassword", Value::from(password.as_str()));
    }
    set("autoProvisioned", Value::from(true));

    for (key, value) in original {
        let reserved = key
            .as_str()
            .map(|k| RESERVED_KEYS.contains(&k))
            .unwrap_or(false);
        if !reserved && !mapping.contains_key(key) {
            mapping.insert(key.clone(), value.clone());
        }
    }

    mapping
}

#[cfg(test)]
#[path = "provision_tests.rs"]
mod tests;
