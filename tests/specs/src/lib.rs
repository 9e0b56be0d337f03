// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `outpost` binary against a generated device config and
//! an unroutable platform URL, so nothing leaves the machine.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Resolve the path to the compiled `outpost` binary.
pub fn outpost_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("outpost")
}

/// A running `outpost` process that is killed on drop.
pub struct OutpostProcess {
    child: Child,
    /// Holds the config + data directory alive for the process lifetime.
    _dir: tempfile::TempDir,
}

impl OutpostProcess {
    /// Spawn the agent against the given device config YAML.
    pub fn start(config_yaml: &str) -> anyhow::Result<Self> {
        let binary = outpost_binary();
        anyhow::ensure!(binary.exists(), "outpost binary not found at {}", binary.display());

        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("device.yml");
        std::fs::write(&config_path, config_yaml)?;

        let child = Command::new(&binary)
            .arg("--config")
            .arg(&config_path)
            .arg("--dir")
            .arg(dir.path().join("data"))
            .arg("--log-format")
            .arg("text")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, _dir: dir })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// True while the process has not exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Send SIGTERM for a graceful shutdown.
    pub fn terminate(&self) -> anyhow::Result<()> {
        let status = Command::new("kill")
            .args(["-TERM", &self.pid().to_string()])
            .status()?;
        anyhow::ensure!(status.success(), "kill -TERM failed");
        Ok(())
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(
        &mut self,
        timeout: Duration,
    ) -> anyhow::Result<std::process::ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("outpost did not exit within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for OutpostProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
