// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Editor reverse tunnel: one persistent outbound WebSocket to the platform
//! multiplexing editor HTTP requests and WebSocket sessions onto the local
//! runtime.
//!
//! The tunnel task owns the upstream socket and the session table; local
//! WebSocket events come back to it as messages, so sessions never hold a
//! reference to the tunnel.

pub mod frame;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::HeaderName;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use frame::{FrameError, UpstreamFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

const BACKOFF_MIN: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const BACKOFF_FACTOR: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_WAIT: Duration = Duration::from_secs(10);
const CONNECT_POLL: Duration = Duration::from_secs(2);
const AFFINITY_COOKIE: &str = "FFSESSION";
const UNKNOWN_ID_REASON: &str = "Non-connect packet received for unknown connection id";

/// Everything the tunnel needs to reach both ends.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub forge_url: String,
    pub device_id: String,
    /// Editor access token; authenticates the upstream socket and is
    /// injected into local requests as `x-access-token`.
    pub token: String,
    pub local_port: u16,
    pub local_https: bool,
}

impl TunnelConfig {
    fn upstream_url(&self) -> String {
        let ws_base = ws_scheme(&self.forge_url);
        format!(
            "{ws_base}/api/v1/devices/{}/editor/comms/{}",
            self.device_id, self.token
        )
    }

    fn local_http_base(&self) -> String {
        let proto = if self.local_https { "https" } else { "http" };
        format!("{proto}://127.0.0.1:{}/device-editor", self.local_port)
    }

    fn local_ws_base(&self) -> String {
        let proto = if self.local_https { "wss" } else { "ws" };
        format!("{proto}://127.0.0.1:{}/device-editor", self.local_port)
    }
}

/// Handle held by the control loop while a tunnel is open.
pub struct TunnelHandle {
    cancel: CancellationToken,
    connected: watch::Receiver<bool>,
    force_reconnect: Arc<Notify>,
}

impl TunnelHandle {
    /// Tear the tunnel down (stop-editor, or platform refusal).
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Poll for the upstream socket to open: every 2 s, for up to 10 s.
    /// On timeout the current attempt is force-closed and `false` returned;
    /// the task keeps reconnecting with backoff.
    pub async fn wait_connected(&self) -> bool {
        let mut connected = self.connected.clone();
        let deadline = tokio::time::Instant::now() + CONNECT_WAIT;
        let mut poll = tokio::time::interval(CONNECT_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if *connected.borrow_and_update() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                self.force_reconnect.notify_one();
                return false;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = poll.tick() => {}
            }
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Open the tunnel: spawns the owning task and returns its handle.
pub fn open(config: TunnelConfig) -> TunnelHandle {
    let cancel = CancellationToken::new();
    let (connected_tx, connected_rx) = watch::channel(false);
    let force_reconnect = Arc::new(Notify::new());

    tokio::spawn(task(config, cancel.clone(), connected_tx, Arc::clone(&force_reconnect)));

    TunnelHandle { cancel, connected: connected_rx, force_reconnect }
}

/// Outer connect/reconnect loop.
async fn task(
    config: TunnelConfig,
    cancel: CancellationToken,
    connected_tx: watch::Sender<bool>,
    force_reconnect: Arc<Notify>,
) {
    let mut backoff = BACKOFF_MIN;
    let mut affinity: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let request = match upstream_request(&config, affinity.as_deref()) {
            Ok(request) => request,
            Err(e) => {
                warn!("cannot build tunnel request: {e}");
                return;
            }
        };

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request)) => r,
        };

        match attempt {
            Ok(Ok((ws, response))) => {
                if let Some(cookie) = extract_affinity(response.headers()) {
                    affinity = Some(cookie);
                }
                info!("editor tunnel connected");
                connected_tx.send_replace(true);
                backoff = BACKOFF_MIN;

                let end = serve(ws, &config, &cancel, &force_reconnect).await;
                connected_tx.send_replace(false);
                match end {
                    ServeEnd::Cancelled => return,
                    ServeEnd::NoRetry => {
                        info!("editor tunnel refused by platform, not retrying");
                        return;
                    }
                    ServeEnd::Retry => {}
                }
            }
            Ok(Err(e)) => debug!("tunnel connect failed: {e}"),
            Err(_) => debug!("tunnel connect timed out"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * BACKOFF_FACTOR).min(BACKOFF_MAX);
    }
}

enum ServeEnd {
    Cancelled,
    Retry,
    NoRetry,
}

/// One logical editor session: a channel into its local WebSocket task,
/// plus the path it was opened with (needed for the comms auth rewrite).
struct EditorSession {
    tx: mpsc::UnboundedSender<SessionOp>,
    path: String,
}

enum SessionOp {
    Send(String),
    Close,
}

/// Events delivered back to the tunnel task.
enum TunnelEvent {
    /// A ready-to-send upstream frame (HTTP responses).
    Upstream(String),
    /// Payload from a local WebSocket.
    LocalMessage { id: String, body: String },
    /// A local WebSocket finished (close, error, or failed connect).
    LocalClosed { id: String },
}

/// Inner loop for one upstream connection.
async fn serve(
    ws: WsStream,
    config: &TunnelConfig,
    cancel: &CancellationToken,
    force_reconnect: &Notify,
) -> ServeEnd {
    let (mut write, mut read): (WsWrite, WsRead) = ws.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TunnelEvent>();
    let mut sessions: HashMap<String, EditorSession> = HashMap::new();
    let mut unknown_streak = 0u32;
    let local = local_http_client(config.local_https);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                close_sessions(&mut sessions);
                return ServeEnd::Cancelled;
            }

            _ = force_reconnect.notified() => {
                let _ = write.send(Message::Close(None)).await;
                close_sessions(&mut sessions);
                return ServeEnd::Retry;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match frame::classify(text.as_str()) {
                            Ok(envelope) => {
                                let ws_frame =
                                    !matches!(envelope, UpstreamFrame::HttpRequest { .. });
                                if ws_frame && !envelope.is_connect()
                                    && !sessions.contains_key(envelope.id())
                                {
                                    // Tolerated once: usually a race against a
                                    // session the local side already closed.
                                    unknown_streak += 1;
                                    debug!(
                                        id = envelope.id(),
                                        streak = unknown_streak,
                                        "frame for unknown session"
                                    );
                                    if unknown_streak >= 2 {
                                        let close = unknown_id_close();
                                        let _ = write.send(Message::Close(Some(close))).await;
                                        close_sessions(&mut sessions);
                                        return ServeEnd::Retry;
                                    }
                                    continue;
                                }
                                if ws_frame {
                                    unknown_streak = 0;
                                }
                                handle_frame(envelope, config, &local, &mut sessions, &event_tx);
                            }
                            Err(FrameError::Parse) => debug!("unparseable tunnel frame"),
                            Err(e) => debug!("ignoring tunnel frame: {e:?}"),
                        }
                    }
                    Some(Ok(Message::Close(close))) => {
                        close_sessions(&mut sessions);
                        return if no_retry_close(close.as_ref()) {
                            ServeEnd::NoRetry
                        } else {
                            ServeEnd::Retry
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("tunnel read error: {e}");
                        close_sessions(&mut sessions);
                        return ServeEnd::Retry;
                    }
                    None => {
                        close_sessions(&mut sessions);
                        return ServeEnd::Retry;
                    }
                }
            }

            Some(event) = event_rx.recv() => {
                let outbound = match event {
                    TunnelEvent::Upstream(text) => text,
                    TunnelEvent::LocalMessage { id, body } => frame::ws_body(&id, &body),
                    TunnelEvent::LocalClosed { id } => {
                        sessions.remove(&id);
                        frame::ws_closed(&id)
                    }
                };
                if write.send(Message::Text(outbound.into())).await.is_err() {
                    close_sessions(&mut sessions);
                    return ServeEnd::Retry;
                }
            }
        }
    }
}

/// Dispatch one classified frame. Unknown-id policy is enforced by the
/// caller; everything here refers to known (or new) sessions.
fn handle_frame(
    envelope: UpstreamFrame,
    config: &TunnelConfig,
    local: &reqwest::Client,
    sessions: &mut HashMap<String, EditorSession>,
    event_tx: &mpsc::UnboundedSender<TunnelEvent>,
) {
    match envelope {
        UpstreamFrame::HttpRequest { id, method, url, headers, body } => {
            let client = local.clone();
            let target = format!("{}{url}", config.local_http_base());
            let token = config.token.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let response =
                    match forward_http(&client, &target, &token, &method, &headers, body).await {
                        Some((status, headers, body)) => {
                            frame::http_response(&id, status, &headers, Some(&body))
                        }
                        // Transport error: answer 404 so the platform is
                        // never left waiting on this id.
                        None => frame::http_response(&id, 404, &Map::new(), None),
                    };
                let _ = event_tx.send(TunnelEvent::Upstream(response));
            });
        }

        UpstreamFrame::WsConnect { id, url } => {
            // A reused id replaces the old session; close it first.
            if let Some(old) = sessions.remove(&id) {
                let _ = old.tx.send(SessionOp::Close);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let target = format!("{}{url}", config.local_ws_base());
            sessions.insert(id.clone(), EditorSession { tx, path: url });
            tokio::spawn(session_task(
                id,
                target,
                config.token.clone(),
                config.local_https,
                rx,
                event_tx.clone(),
            ));
        }

        UpstreamFrame::WsClose { id } => {
            if let Some(session) = sessions.get(&id) {
                let _ = session.tx.send(SessionOp::Close);
            }
        }

        UpstreamFrame::WsData { id, body } => {
            if let Some(session) = sessions.get(&id) {
                let body = frame::rewrite_comms_auth(&session.path, &body, &config.token)
                    .unwrap_or(body);
                let _ = session.tx.send(SessionOp::Send(body));
            }
        }
    }
}

fn close_sessions(sessions: &mut HashMap<String, EditorSession>) {
    for (_, session) in sessions.drain() {
        let _ = session.tx.send(SessionOp::Close);
    }
}

/// One local editor WebSocket.
///
/// Ops submitted while the connect is still in flight queue up in the
/// channel and drain in FIFO order once the socket opens, so no payload is
/// reordered or dropped.
async fn session_task(
    id: String,
    url: String,
    token: String,
    insecure: bool,
    mut rx: mpsc::UnboundedReceiver<SessionOp>,
    event_tx: mpsc::UnboundedSender<TunnelEvent>,
) {
    let ws = match local_ws_connect(&url, &token, insecure).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%id, "local editor WS connect failed: {e}");
            let _ = event_tx.send(TunnelEvent::LocalClosed { id });
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            op = rx.recv() => {
                match op {
                    Some(SessionOp::Send(text)) => {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionOp::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(TunnelEvent::LocalMessage {
                            id: id.clone(),
                            body: text.to_string(),
                        });
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        // 1006-equivalent: the local socket died abnormally.
                        debug!(%id, "local editor WS error: {e}");
                        break;
                    }
                }
            }
        }
    }

    let _ = event_tx.send(TunnelEvent::LocalClosed { id });
}

/// Perform the forwarded HTTP request; `None` means transport failure.
async fn forward_http(
    client: &reqwest::Client,
    target: &str,
    token: &str,
    method: &str,
    headers: &Map<String, Value>,
    body: Option<Value>,
) -> Option<(u16, Map<String, Value>, String)> {
    let method = reqwest::Method::from_bytes(method.as_bytes()).ok()?;
    let mut request = client.request(method, target).header("x-access-token", token);
    for (name, value) in headers {
        // Hop-by-hop and transport-owned headers stay ours.
        if matches!(name.to_ascii_lowercase().as_str(), "host" | "connection" | "content-length")
        {
            continue;
        }
        let (Ok(name), Some(value)) = (HeaderName::from_bytes(name.as_bytes()), value.as_str())
        else {
            continue;
        };
        request = request.header(name, value);
    }
    if let Some(body) = body {
        request = match body {
            Value::String(text) => request.body(text),
            other => request.body(other.to_string()),
        };
    }

    let response = request.send().await.ok()?;
    let status = response.status().as_u16();
    let mut response_headers = Map::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            response_headers.insert(name.to_string(), Value::String(value.to_owned()));
        }
    }
    let body = response.text().await.unwrap_or_default();
    Some((status, response_headers, body))
}

/// Close frame sent after a second consecutive non-connect frame for an
/// unknown session id.
fn unknown_id_close() -> CloseFrame {
    CloseFrame { code: CloseCode::from(1006), reason: UNKNOWN_ID_REASON.into() }
}

/// Platform refusals that must not be retried: 4004 with any reason, and
/// 1008 with the literal reason "No tunnel".
fn no_retry_close(close: Option<&CloseFrame>) -> bool {
    let Some(close) = close else { return false };
    let code = u16::from(close.code);
    code == 4004 || (code == 1008 && close.reason.as_str() == "No tunnel")
}

fn ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest.trim_end_matches('/'))
    } else {
        let rest = url.strip_prefix("http://").unwrap_or(url);
        format!("ws://{}", rest.trim_end_matches('/'))
    }
}

/// Build the upstream handshake request, replaying the affinity cookie so
/// the platform can route the reconnect to the same tunnel node.
fn upstream_request(config: &TunnelConfig, affinity: Option<&str>) -> anyhow::Result<Request> {
    let mut request = config.upstream_url().into_client_request()?;
    request
        .headers_mut()
        .insert("x-access-token", config.token.parse()?);
    if let Some(value) = affinity {
        request
            .headers_mut()
            .insert("cookie", format!("{AFFINITY_COOKIE}={value}").parse()?);
    }
    Ok(request)
}

/// Pull the FFSESSION affinity cookie out of the upgrade response.
fn extract_affinity(headers: &tokio_tungstenite::tungstenite::http::HeaderMap) -> Option<String> {
    for value in headers.get_all("set-cookie") {
        let Ok(cookie) = value.to_str() else { continue };
        if let Some(rest) = cookie.strip_prefix(&format!("{AFFINITY_COOKIE}=")) {
            let value = rest.split(';').next().unwrap_or_default();
            if !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

/// Client for forwarded editor HTTP requests. Editor responses can be big
/// and slow; no request timeout, and self-signed local TLS is accepted.
fn local_http_client(insecure: bool) -> reqwest::Client {
    crate::run::ensure_crypto();
    reqwest::Client::builder()
        .danger_accept_invalid_certs(insecure)
        .build()
        .unwrap_or_default()
}

/// Connect a local editor WebSocket, accepting the runtime's self-signed
/// certificate when it serves HTTPS.
async fn local_ws_connect(
    url: &str,
    token: &str,
    insecure: bool,
) -> anyhow::Result<WsStream> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert("x-access-token", token.parse()?);

    if insecure {
        let connector = Connector::Rustls(Arc::new(insecure_tls_config()));
        let (ws, _) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            Some(connector),
        )
        .await?;
        Ok(ws)
    } else {
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(ws)
    }
}

/// TLS config that skips certificate verification; the peer is always
/// 127.0.0.1 with device-provisioned material.
fn insecure_tls_config() -> rustls::ClientConfig {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification(Arc::clone(&provider))))
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
