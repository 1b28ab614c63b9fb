use cd_core::{JsonFileStore, Orchestrator, OrchestratorOptions, RunOutcome, SyncEvent};
use cd_esi_client::{EsiApi, RequestConfig};
use cd_utils::error::report_error;

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "corpdeck-sync", about = "Keeps corporation data in sync with the external API")]
struct Args {
	/// Directory holding the stored configuration and the logs
	#[arg(long, env = "CORPDECK_DATA_DIR", default_value = "./data")]
	data_dir: PathBuf,

	#[arg(long, env = "CORPDECK_API_URL", default_value = "https://esi.evetech.net")]
	api_url: String,

	#[arg(long, env = "CORPDECK_CORPORATION_ID")]
	corporation_id: u64,

	#[arg(long, env = "CORPDECK_ACCESS_TOKEN", hide_env_values = true)]
	access_token: Option<String>,

	#[arg(
		long,
		env = "CORPDECK_LOG",
		default_value = "cd_core=info,cd_esi_client=info,corpdeck_sync=info"
	)]
	log: String,

	/// Probe every current endpoint version before the first tick
	#[arg(long, default_value_t = false)]
	validate_on_start: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	init_tracing(&args.data_dir, &args.log)?;

	let options = OrchestratorOptions::default();

	let api = EsiApi::new(
		RequestConfig::new(
			args.api_url,
			args.corporation_id,
			args.access_token,
			options.call_timeout,
		)?,
		&options.catalog,
	);
	let store = JsonFileStore::new(args.data_dir.join("config"));

	let orchestrator = Orchestrator::new(Arc::new(store), Arc::new(api), options)
		.await
		.context("Failed to initialize the sync orchestrator")?;

	let forwarder = tokio::spawn(forward_events(orchestrator.subscribe()));

	if args.validate_on_start {
		report_error(
			&orchestrator
				.commands()
				.validate_all_routes()
				.await
				.map(|report| {
					info!(
						invalid = report.results.iter().filter(|result| !result.is_valid).count(),
						updates = report.updates.len(),
						"Startup validation finished;"
					);
				}),
		);
	}

	orchestrator.start();
	info!(
		corporation_id = args.corporation_id,
		data_dir = %args.data_dir.display(),
		"Corpdeck sync daemon running;"
	);

	tokio::signal::ctrl_c()
		.await
		.context("Failed to listen for the shutdown signal")?;

	info!("Shutting down;");
	orchestrator.shutdown().await;
	forwarder.abort();

	Ok(())
}

/// Logs to stdout and to a daily rotated `<data_dir>/logs/daemon.log`.
fn init_tracing(data_dir: &Path, directives: &str) -> anyhow::Result<()> {
	let logs_dir = data_dir.join("logs");
	std::fs::create_dir_all(&logs_dir)
		.with_context(|| format!("Failed to create logs directory {}", logs_dir.display()))?;

	let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "daemon.log");

	tracing_subscriber::registry()
		.with(EnvFilter::try_new(directives).context("Invalid log directives")?)
		.with(
			fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_writer(std::io::stdout),
		)
		.with(
			fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_ansi(false)
				.with_writer(file_appender),
		)
		.try_init()
		.context("Failed to initialize tracing")
}

/// Stand-in for outbound alerting: every event ends up in the log.
async fn forward_events(mut events: broadcast::Receiver<SyncEvent>) {
	loop {
		match events.recv().await {
			Ok(SyncEvent::RunFinished(record)) if record.outcome == RunOutcome::Failed => {
				warn!(
					process = %record.process,
					version = ?record.version,
					error = ?record.error,
					"Sync run failed;"
				);
			}
			Ok(SyncEvent::UpdateAvailable {
				process,
				current,
				newer,
			}) => {
				info!(%process, %current, ?newer, "Newer endpoint version available;");
			}
			Ok(event) => debug!(?event, "Sync event;"),
			Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event forwarder lagged behind;"),
			Err(RecvError::Closed) => break,
		}
	}
}
