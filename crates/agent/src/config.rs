// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Edge device agent for the forge platform.
#[derive(Debug, Clone, Parser)]
#[command(name = "outpost", version, about)]
pub struct Cli {
    /// Path to the device configuration file.
    #[arg(long, short = 'c', env = "OUTPOST_CONFIG", default_value = "device.yml")]
    pub config: PathBuf,

    /// Working directory for materialized state (overrides the config file).
    #[arg(long, short = 'd', env = "OUTPOST_DIR")]
    pub dir: Option<PathBuf>,

    /// Local runtime port (overrides the config file).
    #[arg(long, short = 'p', env = "OUTPOST_PORT")]
    pub port: Option<u16>,

    /// Check-in interval in seconds when polling over HTTP.
    #[arg(long, env = "OUTPOST_INTERVAL", default_value = "30")]
    pub interval: u64,

    /// Log ring capacity in records.
    #[arg(long, env = "OUTPOST_RING_SIZE", default_value = "1000")]
    pub ring_size: usize,

    /// Verbose logging.
    #[arg(long, short = 'v', env = "OUTPOST_VERBOSE")]
    pub verbose: bool,

    /// Log format (json or text).
    #[arg(long, env = "OUTPOST_LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

/// TLS material for the local runtime's editor listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpsConfig {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_path: Option<PathBuf>,
}

/// HTTP basic credentials applied to the runtime's HTTP-in nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpNodeAuth {
    pub user: String,
    /// Literal password or a bcrypt hash; the runtime decides.
    pub pass: String,
}

/// Device configuration, loaded from the YAML file named by [`Cli::config`].
/// Immutable after load; provisioning rewrites the file and relaunches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub credential_secret: Option<String>,
    #[serde(default, rename = "forgeURL")]
    pub forge_url: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default, rename = "brokerURL")]
    pub broker_url: Option<String>,
    /// Format `device:TEAMID:deviceId`.
    #[serde(default)]
    pub broker_username: Option<String>,
    #[serde(default)]
    pub broker_password: Option<String>,
    #[serde(default)]
    pub https: Option<HttpsConfig>,
    #[serde(default)]
    pub http_static: Option<String>,
    #[serde(default)]
    pub http_node_auth: Option<HttpNodeAuth>,
    #[serde(default)]
    pub auto_provisioned: bool,

    // Provisioning variant: replaces deviceId + token until the device is
    // claimed by the platform.
    #[serde(default)]
    pub provisioning_name: Option<String>,
    #[serde(default)]
    pub provisioning_team: Option<String>,
    #[serde(default)]
    pub provisioning_token: Option<String>,
}

fn default_port() -> u16 {
    1880
}

impl DeviceConfig {
    /// True when the config only carries provisioning credentials.
    pub fn is_provisioning(&self) -> bool {
        (self.device_id.is_none() || self.token.is_none())
            && self.provisioning_token.is_some()
    }

    /// Team id parsed out of the broker username (`device:TEAM:deviceId`).
    pub fn team_id(&self) -> Option<&str> {
        let username = self.broker_username.as_deref()?;
        let mut parts = username.split(':');
        match (parts.next(), parts.next()) {
            (Some("device"), Some(team)) if !team.is_empty() => Some(team),
            _ => None,
        }
    }

    /// Working directory for materialized runtime state.
    pub fn data_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| PathBuf::from("device-data"))
    }

    /// Validate the configuration after load. Failures here are fatal.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.forge_url.is_empty() {
            anyhow::bail!("forgeURL is required");
        }
        if !self.forge_url.starts_with("http://") && !self.forge_url.starts_with("https://") {
            anyhow::bail!("forgeURL must be an http(s) URL: {}", self.forge_url);
        }

        let has_device = self.device_id.is_some() && self.token.is_some();
        let has_provisioning =
            self.provisioning_team.is_some() && self.provisioning_token.is_some();
        if !has_device && !has_provisioning {
            anyhow::bail!(
                "config must provide deviceId + token, or provisioningTeam + provisioningToken"
            );
        }

        if let Some(ref auth) = self.http_node_auth {
            if auth.user.is_empty() || auth.pass.is_empty() {
                anyhow::bail!("httpNodeAuth requires both user and pass");
            }
        }

        if self.broker_url.is_some()
            && (self.broker_username.is_none() || self.broker_password.is_none())
        {
            anyhow::bail!("brokerURL requires brokerUsername and brokerPassword");
        }

        Ok(())
    }

    /// Fold command-line overrides into the loaded config.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(ref dir) = cli.dir {
            self.dir = Some(dir.clone());
        }
    }
}

/// Load the device configuration and its raw YAML mapping.
///
/// The raw mapping keeps user-supplied keys the typed struct does not know
/// about, so provisioning can preserve them verbatim.
pub fn load(path: &Path) -> anyhow::Result<(DeviceConfig, serde_yaml::Mapping)> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read device config {}", path.display()))?;
    let raw: serde_yaml::Mapping = serde_yaml::from_str(&contents)
        .with_context(|| format!("device config {} is not a YAML mapping", path.display()))?;
    let config: DeviceConfig = serde_yaml::from_value(serde_yaml::Value::Mapping(raw.clone()))
        .with_context(|| format!("invalid device config {}", path.display()))?;
    Ok((config, raw))
}

/// Write a device configuration mapping atomically (write tmp + rename).
pub fn save_raw(path: &Path, raw: &serde_yaml::Mapping) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(raw)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, yaml)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
