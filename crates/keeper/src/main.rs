// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use tokenkeep::config::KeeperConfig;

#[tokio::main]
async fn main() {
    let config = KeeperConfig::parse();
    if let Err(e) = config.validate() {
        eprintln!("error: {e:#}");
        std::process::exit(2);
    }

    init_tracing(&config);
    tokenkeep::install_crypto_provider();

    if let Err(e) = tokenkeep::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &KeeperConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    match config.log_format.as_str() {
        "text" => tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
    }
}
