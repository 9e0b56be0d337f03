// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot and settings bundles as delivered by the platform, plus the
//! flows-file validator.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable bundle of flows, credentials, modules, and environment that
/// defines one runnable runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered node objects; see [`validate_flows`].
    #[serde(default)]
    pub flows: Vec<Value>,
    /// Opaque credentials blob, possibly encrypted with the device's
    /// credential secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
    /// Module name → version specifier.
    #[serde(default)]
    pub modules: IndexMap<String, String>,
    /// Injected into the runtime process environment.
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

/// Platform-issued per-device configuration, merged over the snapshot at
/// materialization time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub hash: String,
    /// Merged over `Snapshot::env`.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<EditorSettings>,
    #[serde(default)]
    pub features: Features,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub palette: Option<Palette>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorSettings {
    /// Overrides the runtime version pinned in the snapshot's module map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_red_version: Option<String>,
}

/// Boolean feature flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    /// Whether broker credentials may be propagated into the runtime
    /// settings. Absent means enabled (older platforms never send it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_comms: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Features {
    pub fn project_comms(&self) -> bool {
        self.project_comms.unwrap_or(true)
    }
}

/// Licensed-only module catalogue list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Palette {
    #[serde(default)]
    pub catalogues: Vec<String>,
    /// Verbatim `.npmrc` contents for private registries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npmrc: Option<String>,
}

/// Result of checking whether a JSON value is a flows file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowsCheck {
    Valid,
    NotAnArray,
    /// The element at `index` is not a node object with non-empty string
    /// `id` and `type` fields.
    InvalidNode { index: usize },
}

impl FlowsCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// A JSON array is a flows file iff every element is an object carrying a
/// non-empty string `id` and a non-empty string `type`.
pub fn validate_flows(value: &Value) -> FlowsCheck {
    let Some(items) = value.as_array() else {
        return FlowsCheck::NotAnArray;
    };
    for (index, item) in items.iter().enumerate() {
        let id = item.get("id").and_then(Value::as_str).unwrap_or_default();
        let kind = item.get("type").and_then(Value::as_str).unwrap_or_default();
        if id.is_empty() || kind.is_empty() {
            return FlowsCheck::InvalidNode { index };
        }
    }
    FlowsCheck::Valid
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
