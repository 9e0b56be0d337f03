// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use outpost::config::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match outpost::run::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Startup configuration failures land here; everything else is
            // handled (and logged) inside the agent loop.
            error!("fatal: {e:#}");
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
