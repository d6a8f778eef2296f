use std::env;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use log::{error, info};

use rill_ftp_server::{Server, ServerConfig};

fn main() {
    env_logger::init();

    let Some(config_path) = parse_args() else {
        error!("Invalid command line arguments");
        process::exit(-1);
    };

    match run(&config_path) {
        Ok(()) => info!("Exit success"),
        Err(e) => {
            error!("{:#}", e);
            process::exit(-1);
        }
    }
}

/// Accepted invocations: bare (loads `./config`) or `-config <path>`.
fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => Some(PathBuf::from("config")),
        3 if args[1] == "-config" => Some(PathBuf::from(&args[2])),
        _ => None,
    }
}

fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = ServerConfig::load(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    let server = Server::new(config);
    server
        .register_signals()
        .context("failed to install signal handlers")?;
    server.run().context("server terminated abnormally")?;
    Ok(())
}
