// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owns the runtime child process and the files it reads.
//!
//! The runner task spawns the runtime, pipes its output into the log ring,
//! restarts it with backoff on unexpected exits, and reports lifecycle
//! events back to the control loop. A boot loop (five starts inside the
//! detection window) parks the runtime in `crashed`.

pub mod files;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit;
use crate::config::DeviceConfig;
use crate::ring::{LogEntry, LogRing, SYSTEM_LEVEL};
use crate::snapshot::{Settings, Snapshot};
use crate::transport::ControlClient;

/// Lifecycle events published to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherEvent {
    /// A runtime process was spawned.
    Started,
    /// First output seen from the spawned runtime.
    Healthy,
    /// The runtime exited. `expected` is true for agent-initiated stops.
    Exited { code: Option<i32>, expected: bool },
    /// Boot loop detected; no further restarts will be attempted.
    Crashed,
}

const RESTART_DELAY_MIN: Duration = Duration::from_millis(500);
const RESTART_DELAY_MAX: Duration = Duration::from_secs(10);
const RESTART_BACKOFF_FACTOR: u32 = 3;
/// A run longer than this resets the restart backoff.
const STABLE_RUN: Duration = Duration::from_secs(30);
/// Five starts inside this window count as a boot loop.
const BOOT_LOOP_STARTS: usize = 5;
const BOOT_LOOP_WINDOW: Duration = Duration::from_secs(30);

/// Manages one runtime project directory and at most one child process.
pub struct Launcher {
    project_dir: PathBuf,
    config: Arc<DeviceConfig>,
    http: Arc<ControlClient>,
    ring: Arc<LogRing>,
    events_tx: mpsc::Sender<LauncherEvent>,
    env: Vec<(String, String)>,
    modules_changed: bool,
    cancel: Option<CancellationToken>,
    runner: Option<JoinHandle<()>>,
    restart_count: Arc<AtomicU32>,
}

impl Launcher {
    pub fn new(
        config: Arc<DeviceConfig>,
        http: Arc<ControlClient>,
        ring: Arc<LogRing>,
        events_tx: mpsc::Sender<LauncherEvent>,
    ) -> Self {
        let project_dir = config.data_dir().join("project");
        Self {
            project_dir,
            config,
            http,
            ring,
            events_tx,
            env: Vec::new(),
            modules_changed: true,
            cancel: None,
            runner: None,
            restart_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn project_dir(&self) -> &PathBuf {
        &self.project_dir
    }

    /// Unexpected restarts since the current snapshot was deployed.
    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Materialize the snapshot + settings onto disk.
    pub fn write_configuration(
        &mut self,
        snapshot: &Snapshot,
        settings: &Settings,
    ) -> anyhow::Result<()> {
        let outcome = files::write_all(
            &self.project_dir,
            snapshot,
            settings,
            &self.config,
            &self.http.audit_url(),
        )?;
        self.env = outcome.env;
        self.modules_changed = outcome.modules_changed;
        Ok(())
    }

    /// Install the module set when it differs from what is on disk.
    ///
    /// npm output is captured into the log ring at the `system` level so it
    /// reaches the platform with the rest of the logs.
    pub async fn install_dependencies(&mut self) -> anyhow::Result<()> {
        let node_modules = self.project_dir.join("node_modules");
        if !self.modules_changed && node_modules.exists() {
            debug!("module set unchanged, skipping install");
            return Ok(());
        }

        info!("installing runtime modules in {}", self.project_dir.display());
        let output = Command::new("npm")
            .args(["install", "--omit=dev", "--no-audit", "--no-fund", "--no-update-notifier"])
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        for chunk in [&output.stdout, &output.stderr] {
            for line in String::from_utf8_lossy(chunk).lines() {
                if !line.trim().is_empty() {
                    self.ring.add(LogEntry::agent(SYSTEM_LEVEL, line));
                }
            }
        }

        if !output.status.success() {
            anyhow::bail!("npm install exited with {}", output.status);
        }
        self.modules_changed = false;
        Ok(())
    }

    /// Spawn the runtime. Idempotent: a second start while the runner is
    /// alive is a no-op, preserving the single-child invariant.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.restart_count.store(0, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        let runner = Runner {
            project_dir: self.project_dir.clone(),
            port: self.config.port,
            env: self.env.clone(),
            ring: Arc::clone(&self.ring),
            http: Arc::clone(&self.http),
            events_tx: self.events_tx.clone(),
            restart_count: Arc::clone(&self.restart_count),
            cancel: cancel.clone(),
        };
        self.cancel = Some(cancel);
        self.runner = Some(tokio::spawn(runner.run()));
    }

    /// True while the runner task (and therefore at most one child) lives.
    pub fn is_running(&self) -> bool {
        self.runner.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Interrupt the runtime and wait for it to exit. With `clean`, the
    /// generated project files are removed afterwards.
    pub async fn stop(&mut self, clean: bool) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(runner) = self.runner.take() {
            let _ = runner.await;
        }
        if clean {
            files::remove_generated(&self.project_dir);
        }
    }

    /// Current on-disk flows, for the `upload` command.
    pub fn read_flows(&self) -> Value {
        read_json_file(&self.project_dir.join(files::FLOWS_FILE)).unwrap_or_else(|| json!([]))
    }

    /// Current on-disk credentials, for the `upload` command.
    pub fn read_credentials(&self) -> Value {
        read_json_file(&self.project_dir.join(files::CREDENTIALS_FILE))
            .unwrap_or_else(|| json!({}))
    }

    /// Current on-disk package manifest, for the `upload` command.
    pub fn read_package(&self) -> Value {
        read_json_file(&self.project_dir.join(files::PACKAGE_FILE)).unwrap_or_else(|| json!({}))
    }

    /// Ship an audit event for this device, subject to the audit filter.
    pub async fn log_audit_event(&self, event: &str, body: &Value) {
        ship_audit(&self.http, event, body).await;
    }
}

/// Filtered audit shipper shared by the launcher API and the runner task.
async fn ship_audit(http: &ControlClient, event: &str, body: &Value) {
    if !audit::should_forward(event) {
        return;
    }
    if let Err(e) = http.post_audit(event, body).await {
        debug!("audit event {event} not delivered: {e}");
    }
}

fn read_json_file(path: &std::path::Path) -> Option<Value> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// The task that owns the child process, its output, and the restart timer.
struct Runner {
    project_dir: PathBuf,
    port: u16,
    env: Vec<(String, String)>,
    ring: Arc<LogRing>,
    http: Arc<ControlClient>,
    events_tx: mpsc::Sender<LauncherEvent>,
    restart_count: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl Runner {
    async fn run(self) {
        let mut backoff = RESTART_DELAY_MIN;
        let mut starts: VecDeque<Instant> = VecDeque::with_capacity(BOOT_LOOP_STARTS);

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let now = Instant::now();
            starts.push_back(now);
            if starts.len() > BOOT_LOOP_STARTS {
                starts.pop_front();
            }
            if boot_looping(&starts, now) {
                self.ring.add(LogEntry::agent(
                    SYSTEM_LEVEL,
                    "runtime restart loop detected, giving up",
                ));
                ship_audit(&self.http, "crashed", &json!({})).await;
                let _ = self.events_tx.send(LauncherEvent::Crashed).await;
                return;
            }

            let started_at = Instant::now();
            match self.run_once().await {
                RunExit::Cancelled { code } => {
                    let _ = self.events_tx.send(LauncherEvent::Exited { code, expected: true }).await;
                    return;
                }
                RunExit::Exited { code } => {
                    self.restart_count.fetch_add(1, Ordering::Relaxed);
                    let _ =
                        self.events_tx.send(LauncherEvent::Exited { code, expected: false }).await;
                    warn!("runtime exited unexpectedly (code {code:?}), restarting");
                }
                RunExit::SpawnFailed => {
                    let _ = self
                        .events_tx
                        .send(LauncherEvent::Exited { code: None, expected: false })
                        .await;
                }
            }

            if started_at.elapsed() >= STABLE_RUN {
                backoff = RESTART_DELAY_MIN;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * RESTART_BACKOFF_FACTOR).min(RESTART_DELAY_MAX);
        }
    }

    /// Spawn the runtime once and pump its output until exit or cancel.
    async fn run_once(&self) -> RunExit {
        let bin = self.project_dir.join("node_modules").join(".bin").join("node-red");
        let mut cmd = Command::new(&bin);
        cmd.arg("-u")
            .arg(&self.project_dir)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-s")
            .arg(self.project_dir.join(files::SETTINGS_JS_FILE))
            .current_dir(&self.project_dir)
            .envs(self.env.iter().cloned())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.ring.add(LogEntry::agent(
                    SYSTEM_LEVEL,
                    format!("failed to spawn runtime {}: {e}", bin.display()),
                ));
                return RunExit::SpawnFailed;
            }
        };
        let _ = self.events_tx.send(LauncherEvent::Started).await;

        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut healthy = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    interrupt(&child);
                    let status = child.wait().await.ok();
                    return RunExit::Cancelled { code: status.and_then(|s| s.code()) };
                }
                line = next_line(&mut stdout) => {
                    match line {
                        Some(text) => {
                            if !healthy {
                                healthy = true;
                                let _ = self.events_tx.send(LauncherEvent::Healthy).await;
                            }
                            self.ingest(&text);
                        }
                        None => stdout = None,
                    }
                }
                line = next_line(&mut stderr) => {
                    match line {
                        Some(text) => {
                            self.ring.add(LogEntry::runtime("error", text));
                        }
                        None => stderr = None,
                    }
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    return RunExit::Exited { code };
                }
            }
        }
    }

    /// Runtime stdout lines are JSON log records when our settings shim is
    /// in charge; anything else is buffered verbatim.
    fn ingest(&self, line: &str) {
        let parsed: Option<Value> = serde_json::from_str(line).ok();
        match parsed {
            Some(Value::Object(obj)) => {
                let level = obj
                    .get("level")
                    .and_then(Value::as_str)
                    .unwrap_or("info")
                    .to_owned();
                let msg = obj
                    .get("msg")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| line.to_owned());
                self.ring.add(LogEntry::runtime(&level, msg));
            }
            _ => {
                if !line.trim().is_empty() {
                    self.ring.add(LogEntry::runtime("info", line));
                }
            }
        }
    }
}

enum RunExit {
    Cancelled { code: Option<i32> },
    Exited { code: Option<i32> },
    SpawnFailed,
}

/// Five starts with the whole window shorter than the detection window.
fn boot_looping(starts: &VecDeque<Instant>, now: Instant) -> bool {
    starts.len() == BOOT_LOOP_STARTS
        && starts
            .front()
            .map(|first| now.saturating_duration_since(*first) < BOOT_LOOP_WINDOW)
            .unwrap_or(false)
}

/// Read the next line from an optional line reader; pends forever once the
/// stream is exhausted so `select!` moves on to the remaining branches.
async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<String> {
    match lines {
        Some(reader) => match reader.next_line().await {
            Ok(Some(line)) => Some(line),
            Ok(None) | Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Deliver SIGINT so the runtime can shut down its flows cleanly.
fn interrupt(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGINT,
        );
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
