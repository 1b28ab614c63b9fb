#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Decides when each category of corporation data is synchronized, through which versioned
//! endpoint, and what happens when synchronization fails.

use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast;
use tracing::info;

pub mod api;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod endpoint;
mod error;
pub mod events;
pub mod executor;
pub mod facade;
pub mod probe;
pub mod scheduler;
pub mod state;
pub mod status;

pub use api::{ApiError, CallResponse, ExternalApi, ProbeResponse};
pub use catalog::{Catalog, ProcessSpec};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, JsonFileStore, KvStore, MemoryStore, SyncConfig};
pub use error::{Error, ErrorKind};
pub use events::{EventBus, SyncEvent};
pub use executor::{DispatchedRun, RunOutcome, RunRecord, RunTrigger};
pub use facade::{ConfigFacade, RouteReport};
pub use probe::{ValidationOutcome, ValidationResult};
pub use scheduler::{PollerState, Scheduler, TickReport};
pub use state::OrchestratorState;
pub use status::{MasterPollerStatus, ProcessStatus};

use executor::RunExecutor;
use probe::ValidationProbe;

/// Tuning knobs of an [`Orchestrator`].
pub struct OrchestratorOptions {
	pub catalog: Catalog,
	pub clock: Arc<dyn Clock>,
	/// Upper bound of one synchronization call.
	pub call_timeout: Duration,
	/// Upper bound of one validation probe.
	pub probe_timeout: Duration,
	/// Probes in flight during a bulk validation.
	pub validation_concurrency: usize,
	pub event_capacity: usize,
}

impl Default for OrchestratorOptions {
	fn default() -> Self {
		Self {
			catalog: Catalog::builtin(),
			clock: Arc::new(SystemClock),
			call_timeout: Duration::from_secs(30),
			probe_timeout: Duration::from_secs(10),
			validation_concurrency: 4,
			event_capacity: 1024,
		}
	}
}

/// Owns every component and wires them together.
pub struct Orchestrator {
	state: Arc<OrchestratorState>,
	scheduler: Arc<Scheduler>,
	commands: ConfigFacade,
	events: EventBus,
}

impl Orchestrator {
	/// Loads (or initializes) the stored configuration and builds every component.
	///
	/// The control loop is not running until [`Orchestrator::start`] is called.
	pub async fn new(
		store: Arc<dyn KvStore>,
		api: Arc<dyn ExternalApi>,
		options: OrchestratorOptions,
	) -> Result<Self, Error> {
		let OrchestratorOptions {
			catalog,
			clock,
			call_timeout,
			probe_timeout,
			validation_concurrency,
			event_capacity,
		} = options;

		let config = SyncConfig::load(&*store, &catalog).await?;
		let state = Arc::new(OrchestratorState::new(catalog, &config, clock.now()).await);
		let events = EventBus::new(event_capacity);

		let executor = RunExecutor::new(
			Arc::clone(&state),
			Arc::clone(&api),
			Arc::clone(&clock),
			events.clone(),
			call_timeout,
		);

		let scheduler = Arc::new(Scheduler::new(
			Arc::clone(&state),
			executor.clone(),
			Arc::clone(&clock),
			events.clone(),
		));

		let commands = ConfigFacade::new(
			Arc::clone(&state),
			Arc::clone(&scheduler),
			executor,
			ValidationProbe::new(api, clock, probe_timeout, validation_concurrency),
			store,
			events.clone(),
		);

		info!(
			processes = state.processes().names().len(),
			master_enabled = config.master_poller.enabled,
			master_interval_minutes = config.master_poller.interval_minutes,
			"Sync orchestrator initialized;"
		);

		Ok(Self {
			state,
			scheduler,
			commands,
			events,
		})
	}

	pub fn start(&self) {
		self.scheduler.start();
	}

	/// Stops the control loop; in-flight runs finish on their own.
	pub async fn shutdown(&self) {
		self.scheduler.shutdown().await;
	}

	#[must_use]
	pub const fn commands(&self) -> &ConfigFacade {
		&self.commands
	}

	#[must_use]
	pub const fn scheduler(&self) -> &Arc<Scheduler> {
		&self.scheduler
	}

	#[must_use]
	pub const fn state(&self) -> &Arc<OrchestratorState> {
		&self.state
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.events.subscribe()
	}
}
