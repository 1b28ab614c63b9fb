//! The only mutation path for orchestrator configuration, plus the status queries.
//!
//! Every command persists the whole configuration document before touching in-memory state,
//! so a failed write leaves the orchestrator exactly as it was.

use crate::{
	catalog::ProcessOverride,
	config::{KvStore, SyncConfig},
	endpoint::EndpointBinding,
	events::{EventBus, SyncEvent},
	executor::{DispatchedRun, RunExecutor, RunTrigger},
	probe::{ValidationProbe, ValidationResult},
	scheduler::Scheduler,
	state::OrchestratorState,
	status::{MasterPollerStatus, ProcessStatus},
	Error,
};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Newer endpoint versions available for a process; never applied automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionUpdate {
	pub process: String,
	pub current: String,
	pub newer: Vec<String>,
}

/// Outcome of a bulk validation of every current endpoint version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteReport {
	/// One entry per process, in catalog order.
	pub results: Vec<ValidationResult>,
	pub updates: Vec<VersionUpdate>,
}

impl RouteReport {
	#[must_use]
	pub fn update_available(&self) -> bool {
		!self.updates.is_empty()
	}

	#[must_use]
	pub fn result(&self, process: &str) -> Option<&ValidationResult> {
		self.results.iter().find(|result| result.process == process)
	}
}

pub struct ConfigFacade {
	state: Arc<OrchestratorState>,
	scheduler: Arc<Scheduler>,
	executor: RunExecutor,
	probe: ValidationProbe,
	store: Arc<dyn KvStore>,
	events: EventBus,
	write_lock: Mutex<()>,
}

impl ConfigFacade {
	pub fn new(
		state: Arc<OrchestratorState>,
		scheduler: Arc<Scheduler>,
		executor: RunExecutor,
		probe: ValidationProbe,
		store: Arc<dyn KvStore>,
		events: EventBus,
	) -> Self {
		Self {
			state,
			scheduler,
			executor,
			probe,
			store,
			events,
			write_lock: Mutex::new(()),
		}
	}

	/// Zero disables the process; a run already in flight is left alone.
	#[instrument(skip(self), err)]
	pub async fn set_interval(&self, process: &str, minutes: u32) -> Result<(), Error> {
		self.change_process(
			process,
			ProcessOverride {
				interval_minutes: Some(minutes),
				current_version: None,
			},
		)
		.await
	}

	/// Runs already resolved keep the version they started with.
	#[instrument(skip(self), err)]
	pub async fn set_endpoint_version(&self, process: &str, version: &str) -> Result<(), Error> {
		self.change_process(
			process,
			ProcessOverride {
				interval_minutes: None,
				current_version: Some(version.to_owned()),
			},
		)
		.await
	}

	/// Starts a run now, regardless of the schedule; fails fast if one is in flight.
	#[instrument(skip(self), err)]
	pub async fn trigger_manual_run(&self, process: &str) -> Result<DispatchedRun, Error> {
		let run = self.executor.dispatch(process, RunTrigger::Manual)?;
		info!("Manual run dispatched;");

		Ok(run)
	}

	/// Probes `version`, or the current version when `None`, without switching to it.
	#[instrument(skip(self), err)]
	pub async fn validate_route(
		&self,
		process: &str,
		version: Option<&str>,
	) -> Result<ValidationResult, Error> {
		let binding = self.state.registry().binding(process).await?;

		let version = match version {
			Some(version) => {
				binding.ensure_supported(process, version)?;
				version.to_owned()
			}
			None => binding.current_version().to_owned(),
		};

		let result = self.probe.validate(process, &version).await;
		self.record_validation(&result).await?;

		Ok(result)
	}

	/// Probes the current version of every process; one failing probe never hides the others.
	#[instrument(skip(self), err)]
	pub async fn validate_all_routes(&self) -> Result<RouteReport, Error> {
		let registry = self.state.registry();
		let mut targets = Vec::with_capacity(self.state.processes().names().len());

		for process in self.state.processes().names() {
			targets.push((process.clone(), registry.current_version(process).await?));
		}

		let results = self.probe.validate_all(targets).await;
		let mut updates = vec![];

		for result in &results {
			self.record_validation(result).await?;

			let newer = registry.newer_versions(&result.process).await?;
			if !newer.is_empty() {
				let update = VersionUpdate {
					process: result.process.clone(),
					current: result.version.clone(),
					newer,
				};

				self.events.emit(SyncEvent::UpdateAvailable {
					process: update.process.clone(),
					current: update.current.clone(),
					newer: update.newer.clone(),
				});

				updates.push(update);
			}
		}

		info!(
			validated = results.len(),
			invalid = results.iter().filter(|result| !result.is_valid).count(),
			updates = updates.len(),
			"Validated every endpoint;"
		);

		Ok(RouteReport { results, updates })
	}

	/// Restores built-in intervals, versions and master poller settings; run history is kept.
	#[instrument(skip(self), err)]
	pub async fn reset_to_defaults(&self) -> Result<(), Error> {
		let _write = self.write_lock.lock().await;

		let defaults = SyncConfig::defaults(self.state.catalog());
		if self.state.to_config().await == defaults {
			debug!("Configuration already at defaults;");
			return Ok(());
		}

		defaults.save(&*self.store).await?;

		for (process, process_config) in &defaults.processes {
			self.state
				.apply_override(process, process_config.to_override())
				.await?;
		}

		self.scheduler
			.set_interval(defaults.master_poller.interval_minutes)
			.await?;
		self.scheduler
			.set_enabled(defaults.master_poller.enabled)
			.await;

		self.events
			.emit(SyncEvent::ConfigurationChanged { process: None });
		info!("Configuration reset to defaults;");

		Ok(())
	}

	#[instrument(skip(self), err)]
	pub async fn set_master_poller_enabled(&self, enabled: bool) -> Result<(), Error> {
		let _write = self.write_lock.lock().await;

		let mut config = self.state.to_config().await;
		if config.master_poller.enabled == enabled {
			return Ok(());
		}

		config.master_poller.enabled = enabled;
		config.save(&*self.store).await?;

		self.scheduler.set_enabled(enabled).await;

		Ok(())
	}

	/// Must be at least one minute; the next tick is re-armed from now.
	#[instrument(skip(self), err)]
	pub async fn set_master_poller_interval(&self, minutes: u32) -> Result<(), Error> {
		if minutes == 0 {
			return Err(Error::InvalidInterval(
				"master poller interval must be at least one minute",
			));
		}

		let _write = self.write_lock.lock().await;

		let mut config = self.state.to_config().await;
		if config.master_poller.interval_minutes == minutes {
			return Ok(());
		}

		config.master_poller.interval_minutes = minutes;
		config.save(&*self.store).await?;

		self.scheduler.set_interval(minutes).await?;

		Ok(())
	}

	pub fn status(&self, process: &str) -> Result<ProcessStatus, Error> {
		self.state.status().status(process)
	}

	#[must_use]
	pub fn all_statuses(&self) -> Vec<ProcessStatus> {
		self.state.status().all()
	}

	#[must_use]
	pub fn master_poller_status(&self) -> MasterPollerStatus {
		self.state.status().master()
	}

	#[must_use]
	pub fn failing_count(&self) -> usize {
		self.state.status().failing_count()
	}

	pub async fn endpoint(&self, process: &str) -> Result<EndpointBinding, Error> {
		self.state.registry().binding(process).await
	}

	async fn change_process(&self, process: &str, changes: ProcessOverride) -> Result<(), Error> {
		let _write = self.write_lock.lock().await;

		if let Some(version) = &changes.current_version {
			self.state
				.registry()
				.binding(process)
				.await?
				.ensure_supported(process, version)?;
		}

		let mut config = self.state.to_config().await;
		let Some(entry) = config.processes.get_mut(process) else {
			return Err(Error::UnknownProcess(process.to_owned()));
		};

		let before = entry.clone();

		if let Some(minutes) = changes.interval_minutes {
			entry.interval_minutes = minutes;
		}

		if let Some(version) = &changes.current_version {
			entry.current_version.clone_from(version);
		}

		if *entry == before {
			debug!("Process configuration unchanged;");
			return Ok(());
		}

		config.save(&*self.store).await?;

		if !self.state.apply_override(process, changes).await? {
			warn!("Persisted a change that did not alter the in-memory state;");
		}

		self.events.emit(SyncEvent::ConfigurationChanged {
			process: Some(process.to_owned()),
		});
		info!("Process configuration changed;");

		Ok(())
	}

	async fn record_validation(&self, result: &ValidationResult) -> Result<(), Error> {
		self.state
			.registry()
			.record_validation(&result.process, &result.version, result.to_record())
			.await?;

		self.events
			.emit(SyncEvent::ValidationCompleted(result.clone()));

		Ok(())
	}
}
