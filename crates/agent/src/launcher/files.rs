// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materializes a snapshot + settings bundle into the runtime project
//! directory: package.json, flows, credentials, settings, and TLS material.

use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::DeviceConfig;
use crate::snapshot::{Settings, Snapshot};

pub const PACKAGE_FILE: &str = "package.json";
pub const FLOWS_FILE: &str = "flows.json";
pub const CREDENTIALS_FILE: &str = "flows_cred.json";
pub const SETTINGS_JSON_FILE: &str = "settings.json";
pub const SETTINGS_JS_FILE: &str = "settings.js";
pub const NPMRC_FILE: &str = ".npmrc";

/// Files removed on a clean stop. `node_modules` survives so an identical
/// redeploy doesn't reinstall.
pub const GENERATED_FILES: &[&str] = &[
    PACKAGE_FILE,
    "package-lock.json",
    FLOWS_FILE,
    CREDENTIALS_FILE,
    SETTINGS_JSON_FILE,
    SETTINGS_JS_FILE,
    NPMRC_FILE,
    "key.pem",
    "cert.pem",
    "ca.pem",
];

/// Result of a materialization pass.
#[derive(Debug)]
pub struct WriteOutcome {
    /// Whether the dependency set differs from the previous package.json.
    pub modules_changed: bool,
    /// Environment to inject into the runtime process.
    pub env: Vec<(String, String)>,
}

/// Write every file the runtime reads.
pub fn write_all(
    dir: &Path,
    snapshot: &Snapshot,
    settings: &Settings,
    config: &DeviceConfig,
    audit_url: &str,
) -> anyhow::Result<WriteOutcome> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create project dir {}", dir.display()))?;

    let modules = effective_modules(snapshot, settings);
    let modules_changed = modules_differ(dir, &modules);

    write_package(dir, snapshot, &modules)?;
    write_json(dir, FLOWS_FILE, &Value::Array(snapshot.flows.clone()))?;
    write_json(
        dir,
        CREDENTIALS_FILE,
        snapshot.credentials.as_ref().unwrap_or(&json!({})),
    )?;
    write_npmrc(dir, settings)?;
    write_https_pems(dir, config);
    write_json(dir, SETTINGS_JSON_FILE, &build_settings_json(config, settings, audit_url))?;
    std::fs::write(dir.join(SETTINGS_JS_FILE), SETTINGS_JS)?;

    Ok(WriteOutcome { modules_changed, env: merged_env(snapshot, settings) })
}

/// Remove the generated files (clean stop). Missing files are fine.
pub fn remove_generated(dir: &Path) {
    for name in GENERATED_FILES {
        let _ = std::fs::remove_file(dir.join(name));
    }
}

/// Module map with the editor's runtime-version override applied.
pub fn effective_modules(snapshot: &Snapshot, settings: &Settings) -> IndexMap<String, String> {
    let mut modules = snapshot.modules.clone();
    if let Some(version) =
        settings.editor.as_ref().and_then(|e| e.node_red_version.as_deref())
    {
        modules.insert("node-red".to_owned(), version.to_owned());
    }
    modules
}

/// Compare the requested module set against the previous package.json.
fn modules_differ(dir: &Path, modules: &IndexMap<String, String>) -> bool {
    let Ok(contents) = std::fs::read_to_string(dir.join(PACKAGE_FILE)) else {
        return true;
    };
    let Ok(previous) = serde_json::from_str::<Value>(&contents) else {
        return true;
    };
    let empty = Map::new();
    let deps = previous.get("dependencies").and_then(Value::as_object).unwrap_or(&empty);
    if deps.len() != modules.len() {
        return true;
    }
    modules
        .iter()
        .any(|(name, version)| deps.get(name).and_then(Value::as_str) != Some(version))
}

fn write_package(
    dir: &Path,
    snapshot: &Snapshot,
    modules: &IndexMap<String, String>,
) -> anyhow::Result<()> {
    let package = json!({
        "name": "outpost-project",
        "description": snapshot.description.clone().unwrap_or_default(),
        "version": "0.0.1",
        "private": true,
        "dependencies": modules,
    });
    write_json(dir, PACKAGE_FILE, &package)
}

fn write_npmrc(dir: &Path, settings: &Settings) -> anyhow::Result<()> {
    match settings.palette.as_ref().and_then(|p| p.npmrc.as_deref()) {
        Some(npmrc) => std::fs::write(dir.join(NPMRC_FILE), npmrc)?,
        None => {
            let _ = std::fs::remove_file(dir.join(NPMRC_FILE));
        }
    }
    Ok(())
}

/// Copy the device TLS material into the project dir for the runtime to
/// serve its editor over HTTPS. Unreadable files are logged and skipped.
fn write_https_pems(dir: &Path, config: &DeviceConfig) {
    let Some(ref https) = config.https else { return };
    let pems = [
        (&https.key_path, "key.pem"),
        (&https.cert_path, "cert.pem"),
    ];
    for (src, name) in pems {
        match std::fs::read(src) {
            Ok(pem) => {
                if let Err(e) = std::fs::write(dir.join(name), pem) {
                    warn!("cannot write {name}: {e}");
                }
            }
            Err(e) => warn!("cannot read TLS file {}: {e}", src.display()),
        }
    }
    if let Some(ref ca) = https.ca_path {
        match std::fs::read(ca) {
            Ok(pem) => {
                if let Err(e) = std::fs::write(dir.join("ca.pem"), pem) {
                    warn!("cannot write ca.pem: {e}");
                }
            }
            Err(e) => warn!("cannot read TLS file {}: {e}", ca.display()),
        }
    }
}

/// Build the settings.json the runtime (and its settings.js shim) reads.
///
/// Broker credentials are emptied — not removed — when the `projectComms`
/// feature is explicitly disabled, so the runtime sees a consistent shape.
fn build_settings_json(config: &DeviceConfig, settings: &Settings, audit_url: &str) -> Value {
    let mut root = Map::new();
    root.insert("port".to_owned(), json!(config.port));
    if let Some(ref secret) = config.credential_secret {
        root.insert("credentialSecret".to_owned(), json!(secret));
    }
    if let Some(ref http_static) = config.http_static {
        root.insert("httpStatic".to_owned(), json!(http_static));
    }
    if let Some(ref auth) = config.http_node_auth {
        root.insert(
            "httpNodeAuth".to_owned(),
            json!({"user": auth.user, "pass": auth.pass}),
        );
    }
    if config.https.is_some() {
        root.insert(
            "https".to_owned(),
            json!({"keyPath": "key.pem", "certPath": "cert.pem", "caPath": "ca.pem"}),
        );
    }

    let mut forge = Map::new();
    forge.insert("forgeURL".to_owned(), json!(config.forge_url));
    forge.insert(
        "deviceId".to_owned(),
        json!(config.device_id.clone().unwrap_or_default()),
    );
    forge.insert(
        "auditLogger".to_owned(),
        json!({
            "url": audit_url,
            "token": config.token.clone().unwrap_or_default(),
        }),
    );
    if config.broker_url.is_some() {
        let comms = settings.features.project_comms();
        let field = |value: &Option<String>| {
            if comms {
                value.clone().unwrap_or_default()
            } else {
                String::new()
            }
        };
        forge.insert(
            "projectLink".to_owned(),
            json!({
                "broker": {
                    "url": field(&config.broker_url),
                    "username": field(&config.broker_username),
                    "password": field(&config.broker_password),
                }
            }),
        );
    }
    root.insert("flowforge".to_owned(), Value::Object(forge));

    if let Some(catalogues) =
        settings.palette.as_ref().filter(|p| !p.catalogues.is_empty()).map(|p| &p.catalogues)
    {
        root.insert(
            "editorTheme".to_owned(),
            json!({"palette": {"catalogues": catalogues}}),
        );
    }

    Value::Object(root)
}

/// Environment injected into the runtime: snapshot env, settings env on
/// top, plus proxy passthrough.
fn merged_env(snapshot: &Snapshot, settings: &Settings) -> Vec<(String, String)> {
    let mut env: IndexMap<String, String> = snapshot.env.clone();
    for (k, v) in &settings.env {
        env.insert(k.clone(), v.clone());
    }
    for key in ["http_proxy", "https_proxy", "no_proxy"] {
        for name in [key.to_owned(), key.to_uppercase()] {
            if let Ok(value) = std::env::var(&name) {
                env.entry(name).or_insert(value);
            }
        }
    }
    env.into_iter().collect()
}

fn write_json(dir: &Path, name: &str, value: &Value) -> anyhow::Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    std::fs::write(dir.join(name), contents)
        .with_context(|| format!("cannot write {name}"))?;
    Ok(())
}

/// Settings shim handed to the runtime. Reads the sibling settings.json and
/// wires an admin-auth provider that validates editor tokens against the
/// platform.
const SETTINGS_JS: &str = r#"const fs = require('fs')
const path = require('path')

const settings = JSON.parse(fs.readFileSync(path.join(__dirname, 'settings.json'), 'utf8'))
const forge = settings.flowforge

function loadPem (name) {
    try {
        return fs.readFileSync(path.join(__dirname, name))
    } catch (err) {
        return undefined
    }
}

const runtimeSettings = {
    flowFile: 'flows.json',
    uiPort: settings.port,
    uiHost: '0.0.0.0',
    adminAuth: {
        type: 'credentials',
        users: async function () { return null },
        authenticate: async function () { return null },
        tokens: async function (token) {
            try {
                const response = await fetch(`${forge.forgeURL}/api/v1/devices/${forge.deviceId}/editor/token`, {
                    headers: { 'x-access-token': token }
                })
                if (!response.ok) {
                    return null
                }
                const body = await response.json()
                return { username: body.username, permissions: body.permissions || '*' }
            } catch (err) {
                return null
            }
        }
    },
    httpAdminRoot: '/device-editor',
    logging: {
        console: {
            level: 'info',
            metrics: false,
            audit: true,
            handler: () => {
                return (msg) => {
                    console.log(JSON.stringify(msg))
                }
            }
        }
    }
}

if (settings.credentialSecret) {
    runtimeSettings.credentialSecret = settings.credentialSecret
}
if (settings.httpStatic) {
    runtimeSettings.httpStatic = settings.httpStatic
}
if (settings.httpNodeAuth) {
    runtimeSettings.httpNodeAuth = settings.httpNodeAuth
}
if (settings.https) {
    runtimeSettings.https = {
        key: loadPem(settings.https.keyPath),
        cert: loadPem(settings.https.certPath),
        ca: loadPem(settings.https.caPath)
    }
}
if (settings.editorTheme) {
    runtimeSettings.editorTheme = settings.editorTheme
}
if (forge) {
    runtimeSettings.flowforge = forge
}

module.exports = runtimeSettings
"#;

#[cfg(test)]
#[path = "files_tests.rs"]
mod tests;
