use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use l4redir::config::{Cli, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    maybe_print_long_help();
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.log_json);
    let config = load_config(&cli).context("invalid configuration")?;
    info!(
        control_plane = %config.control_plane_url,
        ports = config.router.len(),
        workers_per_port = config.workers_per_port,
        "configuration loaded"
    );
    l4redir::run(config).await
}

fn init_tracing(level: Option<&str>, json: bool) {
    let filter = level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn maybe_print_long_help() {
    if std::env::args_os().any(|arg| arg == "-h") {
        let mut cmd = Cli::command();
        let _ = cmd.print_long_help();
        println!();
        std::process::exit(0);
    }
}
