// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use streamrelay::config::Config;
use streamrelay::run::{init_tracing, run};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        error!("failed to install rustls crypto provider");
        std::process::exit(1);
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    match run(config, shutdown).await {
        Ok(summary) => {
            info!(bytes_relayed = summary.bytes_relayed, "done");
        }
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}
