mod cli;
mod config;
mod env;
mod ipc;
mod logging;
mod probe;
mod proxy;
mod state;
mod supervisor;

use anyhow::Result;
use clap::Parser;
use std::env as std_env;
use std::ffi::OsString;
use tracing::Level;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing(Level::INFO);
    let mut args = std_env::args_os().collect::<Vec<_>>();
    if should_default_to_status(&args) {
        args.insert(1, OsString::from("status"));
    }
    let cli = cli::Cli::parse_from(args);
    cli.execute().await
}

/// A bare `guestbridge` invocation shows the status table.
fn should_default_to_status(args: &[OsString]) -> bool {
    args.len() <= 1
}
