use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use nca_mock_engine::{register_all, MockEngine};
use nca_scheduler::{MetadataStore, Registry, Scheduler};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod source;

use config::AgentConfig;
use source::DesiredStateSource;

#[derive(Parser, Debug)]
#[command(name = "nca-agent", about = "Network configuration agent")]
struct Cli {
	/// Path to the agent configuration, created with defaults if missing
	#[arg(long, short, default_value = "nca-agent.json")]
	config: PathBuf,

	/// Desired-state file, overrides the one in the configuration
	#[arg(long)]
	desired_state: Option<PathBuf>,
}

fn setup_logging(log_level: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_writer(std::io::stderr))
		.init();
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			tracing::error!(?e, "Failed to listen for Ctrl+C");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(e) => {
				tracing::error!(?e, "Failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => info!("Received Ctrl+C"),
		() = terminate => info!("Received SIGTERM"),
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let mut config = AgentConfig::load_or_create(&cli.config)
		.with_context(|| format!("failed to load config from {}", cli.config.display()))?;
	if let Some(desired_state) = cli.desired_state {
		config.desired_state = desired_state;
	}

	setup_logging(&config.log_level);

	let engine = Arc::new(MockEngine::with_latency(config.engine_latency()));
	let metadata = MetadataStore::new();

	let mut builder = Registry::builder();
	register_all(&mut builder, &engine, &metadata)?;
	let registry = builder.build()?;
	debug!(?registry, "Descriptors registered");

	let scheduler = Scheduler::new(registry, metadata, config.scheduler.clone());

	let mut watcher = scheduler.subscribe();
	let status_log = tokio::spawn(async move {
		while let Some(event) = watcher.next().await {
			debug!(
				txn_seq = event.txn_seq,
				key = %event.outcome.key,
				status = %event.outcome.status,
				"Value status"
			);
		}
	});

	info!(desired_state = ?config.desired_state, "Agent started");

	let source = DesiredStateSource::new(scheduler.clone(), config.desired_state.clone(), config);

	tokio::select! {
		() = source.run() => info!("Desired-state source stopped"),
		() = shutdown_signal() => {}
	}

	info!("Shutting down");
	scheduler.shutdown().await;
	status_log.abort();

	Ok(())
}
