// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk desired-state record: load/save to a JSON file with atomic
//! writes and transparent migration of the legacy single-snapshot format.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::snapshot::{Settings, Snapshot};
use crate::state::Mode;

/// The last successfully applied state. Never holds an in-progress update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub mode: Option<Mode>,
}

impl PersistedState {
    pub fn snapshot_id(&self) -> Option<&str> {
        self.snapshot.as_ref().map(|s| s.id.as_str())
    }

    pub fn settings_hash(&self) -> Option<&str> {
        self.settings.as_ref().map(|s| s.hash.as_str())
    }
}

/// JSON-file-backed store for the desired-state record.
pub struct StateStore {
    path: PathBuf,
}

const STATE_FILE: &str = "project.json";

impl StateStore {
    pub fn new(dir: &Path) -> Self {
        Self { path: dir.join(STATE_FILE) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored record.
    ///
    /// A missing or corrupt file is logged and treated as absent; startup
    /// must never abort on it.
    pub fn load(&self) -> PersistedState {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return PersistedState::default(),
        };
        let value: Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                warn!("state file {} is corrupt, ignoring: {e}", self.path.display());
                return PersistedState::default();
            }
        };
        match migrate(value) {
            Ok(state) => state,
            Err(e) => {
                warn!("state file {} failed to parse, ignoring: {e}", self.path.display());
                PersistedState::default()
            }
        }
    }

    /// Persist the record atomically (write to a temp file, then rename).
    pub fn save(&self, state: &PersistedState) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Parse a state file value, promoting the legacy format when found.
///
/// The legacy file was the raw snapshot blob with a nested `device` object
/// holding the settings; its marker is a top-level `id`. Migration promotes
/// the blob to `snapshot`, moves `device` to `settings`, and leaves project
/// and mode unset.
fn migrate(value: Value) -> anyhow::Result<PersistedState> {
    let Value::Object(mut obj) = value else {
        anyhow::bail!("expected a JSON object");
    };

    if obj.get("id").map(|v| v.is_string()).unwrap_or(false) {
        let device = obj.remove("device");
        let snapshot: Snapshot = serde_json::from_value(Value::Object(obj))?;
        let settings = match device {
            Some(d) => serde_json::from_value(d).ok(),
            None => None,
        };
        return Ok(PersistedState {
            project: None,
            snapshot: Some(snapshot),
            settings,
            mode: None,
        });
    }

    Ok(serde_json::from_value(Value::Object(obj))?)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
