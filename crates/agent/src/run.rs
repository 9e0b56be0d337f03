// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level agent runner: config load, task wiring, and the supervised
//! run-once-then-relaunch structure used by provisioning.

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::agent::Agent;
use crate::config::{self, Cli, DeviceConfig};
use crate::provision::{self, ProvisionOutcome};
use crate::ring::{LogEntry, LogRing, SYSTEM_LEVEL};
use crate::state::AgentState;
use crate::transport::{broker, http, ControlClient};

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Initialize tracing/logging from the command line.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(cli: &Cli) {
    use tracing_subscriber::fmt;

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = match cli.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run the agent to completion. Returns the process exit code.
///
/// Provisioning rewrites the device config file; rather than mutating a
/// live agent, the loop reloads the file and relaunches everything.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    init_tracing(&cli);
    ensure_crypto();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    loop {
        let (mut config, raw) = config::load(&cli.config)?;
        config.apply_cli(&cli);
        config.validate()?;

        if config.is_provisioning() {
            info!(
                state = %AgentState::Provisioning,
                "no device credentials, polling for assignment"
            );
            match provision::run(&cli.config, &config, &raw, &shutdown).await? {
                ProvisionOutcome::Provisioned => {
                    info!("claimed; relaunching with device credentials");
                    continue;
                }
                ProvisionOutcome::Shutdown => return Ok(0),
            }
        }

        run_agent(&cli, Arc::new(config), shutdown.clone()).await?;
        return Ok(0);
    }
}

/// Wire up and run one claimed-device agent until shutdown.
async fn run_agent(
    cli: &Cli,
    config: Arc<DeviceConfig>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(config.data_dir())?;

    let ring = Arc::new(LogRing::new(cli.ring_size));
    let device_id = config.device_id.clone().unwrap_or_default();
    let token = config.token.clone().unwrap_or_default();
    let control = Arc::new(ControlClient::new(&config.forge_url, &device_id, &token)?);

    ring.add(LogEntry::agent(
        SYSTEM_LEVEL,
        format!("agent {} starting (device {device_id})", crate::agent::AGENT_VERSION),
    ));

    let (agent, handle, channels) = Agent::new(
        Arc::clone(&config),
        Arc::clone(&control),
        Arc::clone(&ring),
    );
    let control_loop = tokio::spawn(agent.run(channels, shutdown.clone()));

    let poll_interval = Duration::from_secs(cli.interval.max(1));
    if config.broker_url.is_some() {
        tokio::spawn(broker::run(
            Arc::clone(&config),
            Arc::clone(&control),
            handle,
            Arc::clone(&ring),
            poll_interval,
            shutdown.clone(),
        ));
    } else {
        tokio::spawn(http::checkin_loop(
            Arc::clone(&control),
            handle,
            poll_interval,
            shutdown.clone(),
        ));
    }

    let _ = control_loop.await;
    info!("agent stopped");
    Ok(())
}

/// First SIGTERM/SIGINT triggers graceful shutdown, the second forces exit.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}
