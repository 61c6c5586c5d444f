mod config;
mod db;
mod export;
mod ipc;
mod model;
mod overrides;
mod scheduling;
mod summarizer;
#[cfg(test)]
mod testutil;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "educonnectd")]
#[command(about = "EduConnect school management sidecar (JSON lines over stdio)", long_about = None)]
struct Cli {
    /// Workspace directory to open at startup; `workspace.select` can switch later.
    #[arg(long, env = "EDUCONNECT_WORKSPACE")]
    workspace: Option<PathBuf>,
    /// TOML configuration file; defaults to `educonnect.toml` in the workspace.
    #[arg(long, env = "EDUCONNECT_CONFIG")]
    config: Option<PathBuf>,
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

fn main() {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_filter)),
        )
        .init();
    info!("starting educonnectd v{}", env!("CARGO_PKG_VERSION"));

    let config = match config::Config::resolve(cli.config.as_deref(), cli.workspace.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {:#}", e);
            std::process::exit(2);
        }
    };
    let mut state = ipc::AppState::new(config, cli.config.clone());

    if let Some(path) = cli.workspace {
        match db::open_db(&path) {
            Ok(conn) => {
                info!(workspace = %path.display(), "workspace opened");
                state.workspace = Some(path);
                state.db = Some(conn);
            }
            Err(e) => warn!(workspace = %path.display(), "could not open workspace: {:#}", e),
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                warn!("unparseable request line: {}", e);
                ipc::err("", "bad_json", 400, e.to_string())
            }
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"success\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    info!("stdin closed, shutting down");
}
