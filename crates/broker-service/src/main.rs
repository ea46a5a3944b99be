//! Main entry point for the federated resource broker.
//!
//! Loads the configuration, builds the broker engine with the implementations
//! compiled into this binary, and runs the order processors together with the
//! HTTP API and federation endpoint until interrupted.

use broker_config::Config;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod factory_registry;
mod federation;
mod server;

use factory_registry::build_broker_from_config;
use federation::HttpFederationClient;

/// Command-line arguments for the broker service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started broker");

	let config_path = args.config.to_string_lossy().into_owned();
	let config = Config::from_file(&config_path).await?;
	tracing::info!(provider_id = %config.broker.provider_id, "Loaded configuration");

	let federation = Arc::new(HttpFederationClient::new(&config.federation)?);
	let api_config = config.api.clone().filter(|api| api.enabled);
	let engine = Arc::new(build_broker_from_config(config, federation)?);

	match api_config {
		Some(api_config) => {
			let broker_task = engine.run();
			let api_task =
				server::start_server(api_config, Arc::clone(&engine), Some(args.config.clone()));

			tokio::select! {
				result = broker_task => {
					tracing::info!("Broker finished");
					result?;
				}
				result = api_task => {
					tracing::info!("API server finished");
					engine.shutdown().await;
					result?;
				}
			}
		},
		None => {
			tracing::warn!("API disabled; the broker will not accept requests");
			engine.run().await?;
		},
	}

	tracing::info!("Stopped broker");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_args_default_values() {
		let args = Args::parse_from(["broker"]);
		assert_eq!(args.config, PathBuf::from("config.toml"));
		assert_eq!(args.log_level, "info");
	}

	#[test]
	fn test_args_custom_values() {
		let args = Args::parse_from(["broker", "--config", "site.toml", "-l", "debug"]);
		assert_eq!(args.config, PathBuf::from("site.toml"));
		assert_eq!(args.log_level, "debug");
	}
}
