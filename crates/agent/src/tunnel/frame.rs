// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tunnel wire framing: every platform→agent message is a JSON envelope,
//! either an HTTP forward or one of three WebSocket envelope shapes.

use serde::Deserialize;
use serde_json::{json, Map, Value};

/// A classified platform→agent frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    /// Perform an HTTP request against the local runtime and answer with
    /// `{id, status, headers, body}`.
    HttpRequest {
        id: String,
        method: String,
        url: String,
        headers: Map<String, Value>,
        body: Option<Value>,
    },
    /// Open a new logical editor WebSocket under `id`.
    WsConnect { id: String, url: String },
    /// Close the local WebSocket registered under `id`.
    WsClose { id: String },
    /// Forward a payload to the local WebSocket registered under `id`.
    WsData { id: String, body: String },
}

impl UpstreamFrame {
    pub fn id(&self) -> &str {
        match self {
            Self::HttpRequest { id, .. }
            | Self::WsConnect { id, .. }
            | Self::WsClose { id }
            | Self::WsData { id, .. } => id,
        }
    }

    /// Frames other than [`UpstreamFrame::WsConnect`] require an already
    /// registered session id.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::WsConnect { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not a JSON object.
    Parse,
    /// Envelope without an id.
    MissingId,
    /// Well-formed JSON that matches none of the envelope shapes.
    Unclassifiable,
}

#[derive(Debug, Default, Deserialize)]
struct RawFrame {
    id: Option<Value>,
    #[serde(default)]
    ws: bool,
    #[serde(default)]
    closed: bool,
    url: Option<String>,
    method: Option<String>,
    headers: Option<Map<String, Value>>,
    body: Option<Value>,
}

/// Classify one upstream text frame.
pub fn classify(text: &str) -> Result<UpstreamFrame, FrameError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(|_| FrameError::Parse)?;
    let id = match raw.id {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(FrameError::MissingId),
    };

    if raw.ws {
        if raw.closed {
            return Ok(UpstreamFrame::WsClose { id });
        }
        if let Some(url) = raw.url {
            return Ok(UpstreamFrame::WsConnect { id, url });
        }
        if let Some(body) = raw.body {
            return Ok(UpstreamFrame::WsData { id, body: value_to_body(body) });
        }
        return Err(FrameError::Unclassifiable);
    }

    match raw.url {
        // The platform omits `method` for plain GETs.
        Some(url) => Ok(UpstreamFrame::HttpRequest {
            id,
            method: raw.method.unwrap_or_else(|| "GET".to_owned()),
            url,
            headers: raw.headers.unwrap_or_default(),
            body: raw.body,
        }),
        None => Err(FrameError::Unclassifiable),
    }
}

/// WS payloads are strings on the wire; anything else is re-serialized.
fn value_to_body(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Build the `{id, status, headers, body}` answer to an HTTP forward.
pub fn http_response(
    id: &str,
    status: u16,
    headers: &Map<String, Value>,
    body: Option<&str>,
) -> String {
    json!({
        "id": id,
        "status": status,
        "headers": headers,
        "body": body,
    })
    .to_string()
}

/// Wrap a local WebSocket payload for the upstream.
pub fn ws_body(id: &str, body: &str) -> String {
    json!({"id": id, "ws": true, "body": body}).to_string()
}

/// Tell the upstream a local WebSocket has closed.
pub fn ws_closed(id: &str) -> String {
    json!({"id": id, "ws": true, "closed": true}).to_string()
}

/// Substitute the platform's short-lived auth handshake with the editor
/// token the local runtime expects.
///
/// Applies only to sessions whose path ends in `/comms` and to bodies that
/// open with an `auth` object.
pub fn rewrite_comms_auth(path: &str, body: &str, token: &str) -> Option<String> {
    if path.ends_with("/comms") && body.starts_with("{\"auth\":") {
        return Some(json!({"auth": token}).to_string());
    }
    None
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
