// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The agent control loop: a serial reconciliation state machine that
//! converges local state (project, snapshot, settings, mode) on the desired
//! state the platform delivers.
//!
//! Desired states arrive through a watch channel, which is the single-slot
//! "next" mailbox: while one reconciliation is in flight, newer values
//! replace the queued one and intermediate states are never applied.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::launcher::{Launcher, LauncherEvent};
use crate::ring::LogRing;
use crate::snapshot::{Settings, Snapshot};
use crate::state::{AgentState, DesiredUpdate, Health, Mode, StateReport};
use crate::store::{PersistedState, StateStore};
use crate::transport::ControlClient;
use crate::tunnel::{self, TunnelConfig, TunnelHandle};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result of a broker `action` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    UnsupportedAction,
}

/// Messages delivered to the control-loop task.
pub enum AgentMsg {
    Action { action: String, reply: oneshot::Sender<ActionOutcome> },
    StartEditor { token: String, reply: oneshot::Sender<bool> },
    StopEditor { reply: oneshot::Sender<()> },
    Upload { reply: oneshot::Sender<Value> },
    Report { reply: oneshot::Sender<StateReport> },
    /// Check-in answered 409: re-fetch the snapshot.
    SnapshotConflict,
    /// Check-in answered 401/402/404: park the runtime, keep disk state.
    PlatformRefused,
}

/// The single-slot desired-state mailbox value.
#[derive(Debug, Clone, Default)]
pub struct DesiredSlot {
    seq: u64,
    update: Option<Option<DesiredUpdate>>,
}

/// Cloneable handle other tasks use to talk to the control loop.
#[derive(Clone)]
pub struct AgentHandle {
    msg_tx: mpsc::Sender<AgentMsg>,
    desired_tx: Arc<watch::Sender<DesiredSlot>>,
}

impl AgentHandle {
    /// Deliver a desired state. Newer values replace any queued one.
    pub fn push_desired(&self, update: Option<DesiredUpdate>) {
        self.desired_tx.send_modify(|slot| {
            slot.seq += 1;
            slot.update = Some(update);
        });
    }

    pub async fn action(&self, action: &str) -> ActionOutcome {
        let (reply, rx) = oneshot::channel();
        let msg = AgentMsg::Action { action: action.to_owned(), reply };
        if self.msg_tx.send(msg).await.is_err() {
            return ActionOutcome::UnsupportedAction;
        }
        rx.await.unwrap_or(ActionOutcome::UnsupportedAction)
    }

    /// Returns whether the tunnel is connected (not whether the token was
    /// accepted — the response goes back before the runtime may be up).
    pub async fn start_editor(&self, token: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let msg = AgentMsg::StartEditor { token: token.to_owned(), reply };
        if self.msg_tx.send(msg).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn stop_editor(&self) {
        let (reply, rx) = oneshot::channel();
        if self.msg_tx.send(AgentMsg::StopEditor { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Current on-disk snapshot content for the `upload` command.
    pub async fn upload(&self) -> Value {
        let (reply, rx) = oneshot::channel();
        if self.msg_tx.send(AgentMsg::Upload { reply }).await.is_err() {
            return Value::Null;
        }
        rx.await.unwrap_or(Value::Null)
    }

    pub async fn report(&self) -> Option<StateReport> {
        let (reply, rx) = oneshot::channel();
        self.msg_tx.send(AgentMsg::Report { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn snapshot_conflict(&self) {
        let _ = self.msg_tx.send(AgentMsg::SnapshotConflict).await;
    }

    pub async fn platform_refused(&self) {
        let _ = self.msg_tx.send(AgentMsg::PlatformRefused).await;
    }
}

/// Receivers owned by the control-loop task.
pub struct AgentChannels {
    msg_rx: mpsc::Receiver<AgentMsg>,
    desired_rx: watch::Receiver<DesiredSlot>,
    launcher_rx: mpsc::Receiver<LauncherEvent>,
}

/// The control loop. Exclusively owns the launcher, the tunnel handle, and
/// the current `{project, snapshot, settings, mode}` tuple.
pub struct Agent {
    config: Arc<DeviceConfig>,
    http: Arc<ControlClient>,
    store: StateStore,
    current: PersistedState,
    state: AgentState,
    launcher: Launcher,
    editor_token: Option<String>,
    tunnel: Option<TunnelHandle>,
    started_at: Instant,
}

impl Agent {
    pub fn new(
        config: Arc<DeviceConfig>,
        http: Arc<ControlClient>,
        ring: Arc<LogRing>,
    ) -> (Self, AgentHandle, AgentChannels) {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (desired_tx, desired_rx) = watch::channel(DesiredSlot::default());
        let (launcher_tx, launcher_rx) = mpsc::channel(32);

        let store = StateStore::new(&config.data_dir());
        let current = store.load();
        let launcher =
            Launcher::new(Arc::clone(&config), Arc::clone(&http), ring, launcher_tx);

        let agent = Self {
            config,
            http,
            store,
            current,
            state: AgentState::Unknown,
            launcher,
            editor_token: None,
            tunnel: None,
            started_at: Instant::now(),
        };
        let handle = AgentHandle { msg_tx, desired_tx: Arc::new(desired_tx) };
        (agent, handle, AgentChannels { msg_rx, desired_rx, launcher_rx })
    }

    /// Run the control loop until shutdown.
    pub async fn run(mut self, channels: AgentChannels, shutdown: CancellationToken) {
        let AgentChannels { mut msg_rx, mut desired_rx, mut launcher_rx } = channels;

        // Resume the stored state before the platform says anything; an
        // assigned device keeps running through platform outages.
        if self.current.snapshot.is_some() {
            info!(
                snapshot = self.current.snapshot_id().unwrap_or_default(),
                "resuming stored snapshot"
            );
            self.ensure_running().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.close_tunnel();
                    if self.launcher.is_running() {
                        self.set_state(AgentState::Stopping);
                        self.launcher.stop(false).await;
                    }
                    return;
                }

                changed = desired_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let slot = desired_rx.borrow_and_update().clone();
                    if let Some(update) = slot.update {
                        debug!(seq = slot.seq, "reconciling desired state");
                        self.reconcile(update).await;
                    }
                }

                Some(msg) = msg_rx.recv() => self.handle_msg(msg).await,

                Some(event) = launcher_rx.recv() => self.handle_launcher_event(event).await,
            }
        }
    }

    // -- Reconciliation -------------------------------------------------------

    async fn reconcile(&mut self, incoming: Option<DesiredUpdate>) {
        // 1. Mode changes are always honored, before anything else.
        if let Some(mode) = incoming.as_ref().and_then(|inc| inc.mode) {
            if self.current.mode != Some(mode) {
                info!("mode changed to {mode}");
                self.current.mode = Some(mode);
                self.persist();
            }
        }
        let developer = self.current.mode == Some(Mode::Developer);

        // 2. Unassigned, or credentials revoked: clear everything.
        let Some(inc) = incoming else {
            info!("device unassigned, clearing state");
            self.stop_runtime(true).await;
            self.current = PersistedState::default();
            self.persist();
            self.set_state(AgentState::Stopped);
            return;
        };

        // Developer mode: local edits win. The one exception is a fresh
        // device bootstrapping straight into developer mode.
        if developer {
            let bootstrap = self.state == AgentState::Unknown
                && self.current.snapshot.is_none()
                && inc.snapshot.is_some();
            if !bootstrap {
                debug!("developer mode, platform update inhibited");
                if self.current.snapshot.is_some() {
                    self.ensure_running().await;
                }
                return;
            }
            info!("developer mode bootstrap: fetching initial snapshot");
        }

        // 3. Instance removed.
        if inc.project.is_none() {
            if self.current.project.is_some() || self.current.snapshot.is_some() {
                info!("project removed, stopping runtime");
                self.stop_runtime(true).await;
                self.current.project = None;
                self.current.snapshot = None;
            }
            self.refresh_settings(inc.settings.as_deref()).await;
            self.persist();
            self.set_state(AgentState::Stopped);
            return;
        }

        // 4. Snapshot removed while the project remains.
        if inc.snapshot.is_none() {
            if self.current.snapshot.is_some() {
                info!("snapshot removed, stopping runtime");
                self.stop_runtime(true).await;
            }
            self.current.project = inc.project.clone();
            self.current.snapshot = None;
            self.refresh_settings(inc.settings.as_deref()).await;
            self.persist();
            self.set_state(AgentState::Stopped);
            return;
        }

        // 5. Decide what (if anything) changed.
        let plan = plan_update(&self.current, &inc);
        if !plan.update_snapshot && !plan.update_settings {
            // Converged; just make sure the runtime is actually up.
            self.ensure_running().await;
            return;
        }

        // 6. Full update: stop, fetch, materialize, install, start.
        self.set_state(AgentState::Updating);
        self.stop_runtime(false).await;

        let snapshot = if plan.update_snapshot {
            match self.http.get_snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("snapshot fetch failed: {e}");
                    self.set_state(AgentState::Error);
                    return;
                }
            }
        } else {
            self.current.snapshot.clone().unwrap_or_default()
        };
        let settings = if plan.update_settings {
            match self.http.get_settings().await {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("settings fetch failed: {e}");
                    self.set_state(AgentState::Error);
                    return;
                }
            }
        } else {
            self.current.settings.clone().unwrap_or_default()
        };

        if self.deploy(&snapshot, &settings).await {
            self.current.project = inc.project.clone();
            self.current.snapshot = Some(snapshot);
            self.current.settings = Some(settings);
            // 7. Persist only the successfully applied state.
            self.persist();
        }
    }

    /// Materialize and start a snapshot. Returns false (with state set) on
    /// failure; the failed state is never persisted.
    async fn deploy(&mut self, snapshot: &Snapshot, settings: &Settings) -> bool {
        self.set_state(AgentState::Loading);
        if let Err(e) = self.launcher.write_configuration(snapshot, settings) {
            warn!("failed to write runtime configuration: {e}");
            self.set_state(AgentState::Error);
            return false;
        }

        self.set_state(AgentState::Installing);
        if let Err(e) = self.launcher.install_dependencies().await {
            // Deliberately no install retry loop; the next desired state
            // change triggers the next attempt.
            warn!("module install failed: {e}");
            self.set_state(AgentState::Error);
            return false;
        }

        self.set_state(AgentState::Starting);
        self.launcher.start();
        true
    }

    /// Idempotent start against the current materialization. Never restarts
    /// a healthy runtime; respects an explicit suspend.
    async fn ensure_running(&mut self) {
        if self.state == AgentState::Suspended {
            return;
        }
        if self.current.snapshot.is_none() {
            self.set_state(AgentState::Stopped);
            return;
        }
        if self.launcher.is_running() {
            return;
        }
        let snapshot = self.current.snapshot.clone().unwrap_or_default();
        let settings = self.current.settings.clone().unwrap_or_default();
        self.deploy(&snapshot, &settings).await;
    }

    /// Settings follow their own update rule even when the snapshot goes
    /// away: refresh on hash change, clear when the platform stopped
    /// sending one.
    async fn refresh_settings(&mut self, incoming_hash: Option<&str>) {
        match incoming_hash {
            None => self.current.settings = None,
            Some(hash) if self.current.settings_hash() == Some(hash) => {}
            Some(_) => match self.http.get_settings().await {
                Ok(settings) => self.current.settings = Some(settings),
                Err(e) => warn!("settings fetch failed: {e}"),
            },
        }
    }

    async fn stop_runtime(&mut self, clean: bool) {
        if self.launcher.is_running() {
            self.set_state(AgentState::Stopping);
        }
        self.launcher.stop(clean).await;
        if self.state == AgentState::Stopping {
            self.set_state(AgentState::Stopped);
        }
    }

    // -- Command handling -----------------------------------------------------

    async fn handle_msg(&mut self, msg: AgentMsg) {
        match msg {
            AgentMsg::Action { action, reply } => {
                let outcome = match action.as_str() {
                    "start" => {
                        if self.state == AgentState::Suspended {
                            self.set_state(AgentState::Stopped);
                        }
                        self.ensure_running().await;
                        ActionOutcome::Success
                    }
                    "restart" => {
                        self.stop_runtime(false).await;
                        self.ensure_running().await;
                        ActionOutcome::Success
                    }
                    "suspend" => {
                        self.stop_runtime(false).await;
                        self.close_tunnel();
                        self.set_state(AgentState::Suspended);
                        ActionOutcome::Success
                    }
                    _ => ActionOutcome::UnsupportedAction,
                };
                let _ = reply.send(outcome);
            }

            AgentMsg::StartEditor { token, reply } => {
                self.close_tunnel();
                // Verification warms the 30s token cache; the tunnel opens
                // either way, since `connected` never implies acceptance.
                match self.http.verify_editor_token(&token).await {
                    Ok(info) => debug!(user = %info.username, "editor token verified"),
                    Err(e) => debug!("editor token not verified yet: {e}"),
                }
                self.editor_token = Some(token);
                let connected = if self.launcher.is_running() {
                    self.open_tunnel().await
                } else {
                    // Token is stashed; the tunnel opens once the runtime
                    // reports healthy.
                    false
                };
                let _ = reply.send(connected);
            }

            AgentMsg::StopEditor { reply } => {
                self.close_tunnel();
                self.editor_token = None;
                let _ = reply.send(());
            }

            AgentMsg::Upload { reply } => {
                let body = json!({
                    "flows": self.launcher.read_flows(),
                    "credentials": self.launcher.read_credentials(),
                    "package": self.launcher.read_package(),
                });
                let _ = reply.send(body);
            }

            AgentMsg::Report { reply } => {
                let _ = reply.send(self.report());
            }

            AgentMsg::SnapshotConflict => {
                if self.current.mode == Some(Mode::Developer) {
                    debug!("developer mode, ignoring snapshot conflict");
                    return;
                }
                match self.http.get_snapshot().await {
                    Ok(snapshot) => {
                        if Some(snapshot.id.as_str()) == self.current.snapshot_id() {
                            return;
                        }
                        info!(snapshot = %snapshot.id, "conflict resolution: new snapshot");
                        self.set_state(AgentState::Updating);
                        self.stop_runtime(false).await;
                        let settings = self.current.settings.clone().unwrap_or_default();
                        if self.deploy(&snapshot, &settings).await {
                            self.current.snapshot = Some(snapshot);
                            self.persist();
                        }
                    }
                    Err(e) => warn!("conflict snapshot fetch failed: {e}"),
                }
            }

            AgentMsg::PlatformRefused => {
                self.close_tunnel();
                self.editor_token = None;
                self.stop_runtime(false).await;
                self.set_state(AgentState::Stopped);
            }
        }
    }

    async fn handle_launcher_event(&mut self, event: LauncherEvent) {
        match event {
            LauncherEvent::Started => {
                if self.state != AgentState::Starting {
                    self.set_state(AgentState::Starting);
                }
            }
            LauncherEvent::Healthy => {
                self.set_state(AgentState::Running);
                if self.editor_token.is_some() && self.tunnel.is_none() {
                    self.open_tunnel().await;
                }
            }
            LauncherEvent::Exited { code, expected } => {
                if !expected {
                    warn!("runtime exited unexpectedly (code {code:?})");
                    self.set_state(AgentState::Starting);
                }
            }
            LauncherEvent::Crashed => {
                self.set_state(AgentState::Crashed);
            }
        }
    }

    // -- Tunnel ---------------------------------------------------------------

    async fn open_tunnel(&mut self) -> bool {
        let Some(token) = self.editor_token.clone() else { return false };
        let handle = tunnel::open(TunnelConfig {
            forge_url: self.config.forge_url.clone(),
            device_id: self.config.device_id.clone().unwrap_or_default(),
            token,
            local_port: self.config.port,
            local_https: self.config.https.is_some(),
        });
        let connected = handle.wait_connected().await;
        self.tunnel = Some(handle);
        connected
    }

    fn close_tunnel(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close();
        }
    }

    // -- Bookkeeping ----------------------------------------------------------

    fn report(&self) -> StateReport {
        StateReport {
            project: self.current.project.clone(),
            snapshot: self.current.snapshot_id().map(str::to_owned),
            settings: self.current.settings_hash().map(str::to_owned),
            state: self.state,
            mode: self.current.mode,
            agent_version: AGENT_VERSION.to_owned(),
            health: Health {
                uptime_sec: self.started_at.elapsed().as_secs(),
                snapshot_restart_count: self.launcher.restart_count(),
            },
        }
    }

    fn set_state(&mut self, state: AgentState) {
        if self.state != state {
            info!("state {} -> {state}", self.state);
            self.state = state;
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.current) {
            warn!("failed to persist state: {e}");
        }
    }
}

/// What a desired state requires relative to the current one. Both false
/// means the agent is already converged (apply-twice is a no-op).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpdatePlan {
    pub update_snapshot: bool,
    pub update_settings: bool,
}

pub(crate) fn plan_update(current: &PersistedState, inc: &DesiredUpdate) -> UpdatePlan {
    let project_changed = current.project != inc.project;
    UpdatePlan {
        update_snapshot: current.snapshot.is_none()
            || project_changed
            || current.snapshot_id() != inc.snapshot.as_deref(),
        update_settings: current.settings.is_none()
            || project_changed
            || (inc.settings.is_some() && current.settings_hash() != inc.settings.as_deref()),
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
