//! Node daemon entry point.
//!
//! The single required start-up parameter is the configuration file path;
//! its absence is a fatal error before any component is constructed.
//!
//! ```text
//! castled --config /etc/castle/castle.json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};

use castle::config::NodeConfig;
use castle::node::Node;
use castle::telemetry::{LogFormat, try_init_logging};

fn config_path_from_args(mut args: impl Iterator<Item = String>) -> Result<PathBuf, String> {
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                return args
                    .next()
                    .map(PathBuf::from)
                    .ok_or_else(|| "Missing value for --config".to_string());
            }
            "--help" | "-h" => {
                return Err("Usage: castled --config <path>".to_string());
            }
            other => {
                return Err(format!("Unknown argument: {}", other));
            }
        }
    }
    Err("Missing --config flag".to_string())
}

fn main() -> ExitCode {
    try_init_logging(LogFormat::from_env());

    let path = match config_path_from_args(std::env::args().skip(1)) {
        Ok(path) => path,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::from(2);
        }
    };

    let config = match NodeConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(node_id = config.node_id, config = ?path, "Castle starting");

    let mut node = match Node::bootstrap(config) {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "Failure during startup");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = node.start() {
        error!(error = %e, "Failure during startup");
        node.shutdown();
        return ExitCode::FAILURE;
    }

    let signal = node.block_on(async { tokio::signal::ctrl_c().await });
    if let Err(e) = signal {
        error!(error = %e, "Failed to wait for shutdown signal");
    }

    info!("Stopping...");
    node.shutdown();
    ExitCode::SUCCESS
}
