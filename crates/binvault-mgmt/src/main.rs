#![warn(missing_docs)]

//! binvault-mgmt: blob store administration.

use anyhow::Result;
use binvault_mgmt::cli::Cli;
use binvault_store::{new_cancel_pair, CancelReason};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let (cancel, handle) = new_cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling running task");
            handle.cancel(CancelReason::Interrupted);
        }
    });

    cli.run(cancel).await
}
