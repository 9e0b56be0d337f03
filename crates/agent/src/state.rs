// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent lifecycle states, operating modes, and the check-in report shape.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the agent, as reported to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Unknown,
    Provisioning,
    Stopped,
    Loading,
    Installing,
    Starting,
    Running,
    Safe,
    Crashed,
    Stopping,
    Updating,
    Suspended,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Provisioning => "provisioning",
            Self::Stopped => "stopped",
            Self::Loading => "loading",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Safe => "safe",
            Self::Crashed => "crashed",
            Self::Stopping => "stopping",
            Self::Updating => "updating",
            Self::Suspended => "suspended",
            Self::Error => "error",
        }
    }

    /// Steady states the platform can target.
    pub fn is_target(&self) -> bool {
        matches!(self, Self::Running | Self::Suspended)
    }

    /// States passed through while converging on a target.
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            Self::Loading | Self::Installing | Self::Starting | Self::Stopping | Self::Updating
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode.
///
/// In `developer` mode the reconciliation loop does not overwrite the local
/// snapshot, settings, or project from the platform; local edits win. Mode
/// changes themselves are always honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Autonomous,
    Developer,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autonomous => "autonomous",
            Self::Developer => "developer",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired state delivered by the platform: identifiers only, bodies are
/// fetched separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredUpdate {
    #[serde(default)]
    pub project: Option<String>,
    /// Snapshot id.
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Settings hash.
    #[serde(default)]
    pub settings: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
}

/// Health counters included in the check-in report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub uptime_sec: u64,
    pub snapshot_restart_count: u32,
}

/// Body of `POST live/state` and of broker status publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    pub project: Option<String>,
    /// Current snapshot id.
    pub snapshot: Option<String>,
    /// Current settings hash.
    pub settings: Option<String>,
    pub state: AgentState,
    pub mode: Option<Mode>,
    pub agent_version: String,
    pub health: Health,
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
