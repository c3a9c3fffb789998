use std::path::PathBuf;

use async_shutdown::ShutdownManager;
use clap::Parser;
use skylight::{Config, Server};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Path to the JSON configuration file.
	config: PathBuf,

	/// Show more log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	verbose: u8,

	/// Show less log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	quiet: u8,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), ()> {
	let args = Args::parse();

	let log_level = match i16::from(args.verbose) - i16::from(args.quiet) {
		..= -2 => LevelFilter::ERROR,
		-1 => LevelFilter::WARN,
		0 => LevelFilter::INFO,
		1 => LevelFilter::DEBUG,
		2.. => LevelFilter::TRACE,
	};
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(log_level.into())
				.from_env_lossy(),
		)
		.init();

	let config = Config::read_from_file(&args.config)
		.map_err(|e| tracing::error!("{e:#}"))?;

	tracing::debug!("Using configuration:\n{config:#?}");

	// Spawn a task to wait for CTRL+C and trigger a shutdown.
	let shutdown = ShutdownManager::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::error!("Failed to wait for CTRL+C: {e}");
				std::process::exit(1);
			} else {
				tracing::info!("Received interrupt signal. Shutting down server...");
				shutdown.trigger_shutdown(0).ok();
			}
		}
	});

	let server = Server::new(config, shutdown.clone())
		.await
		.map_err(|e| tracing::error!("Failed to start server: {e}"))?;
	tracing::info!("Listening for clients on {}.", server.local_addr());

	// Wait until something causes a shutdown trigger.
	shutdown.wait_shutdown_triggered().await;

	// Drop the server, triggering the remaining systems to stop too.
	drop(server);

	let exit_code = shutdown.wait_shutdown_complete().await;
	tracing::trace!("Successfully waited for shutdown to complete.");
	std::process::exit(exit_code);
}
