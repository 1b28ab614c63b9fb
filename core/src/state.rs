use crate::{
	catalog::{Catalog, ProcessDescriptor, ProcessOverride, ProcessSet},
	clock::after_minutes,
	config::{MasterPollerConfig, ProcessConfig, SyncConfig},
	endpoint::EndpointRegistry,
	scheduler::PollerState,
	status::StatusStore,
	Error,
};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

/// Settings and bookkeeping of the master poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterPollerState {
	pub enabled: bool,
	pub interval_minutes: u32,
	pub state: PollerState,
	pub last_tick_at: Option<DateTime<Utc>>,
	pub next_tick_at: Option<DateTime<Utc>>,
}

impl MasterPollerState {
	#[must_use]
	pub fn new(enabled: bool, interval_minutes: u32, now: DateTime<Utc>) -> Self {
		let mut master = Self::stopped(interval_minutes);
		master.set_enabled(enabled, now);
		master
	}

	#[must_use]
	pub const fn stopped(interval_minutes: u32) -> Self {
		Self {
			enabled: false,
			interval_minutes,
			state: PollerState::Stopped,
			last_tick_at: None,
			next_tick_at: None,
		}
	}

	#[must_use]
	pub fn is_tick_due(&self, now: DateTime<Utc>) -> bool {
		self.enabled
			&& self.state == PollerState::Idle
			&& self.next_tick_at.is_some_and(|next| now >= next)
	}

	/// Returns `true` if the poller switched state.
	///
	/// Enabling only schedules the next tick one interval away, it never ticks right away.
	pub fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) -> bool {
		if self.enabled == enabled {
			return false;
		}

		self.enabled = enabled;

		if enabled {
			self.state = PollerState::Idle;
			self.next_tick_at = Some(after_minutes(now, self.interval_minutes));
		} else {
			self.state = PollerState::Stopped;
			self.next_tick_at = None;
		}

		true
	}

	/// Returns `true` if the interval changed, in which case a running poller is re-armed.
	pub fn set_interval(&mut self, minutes: u32, now: DateTime<Utc>) -> Result<bool, Error> {
		if minutes == 0 {
			return Err(Error::InvalidInterval(
				"master poller interval must be at least one minute",
			));
		}

		if self.interval_minutes == minutes {
			return Ok(false);
		}

		self.interval_minutes = minutes;

		if self.enabled {
			self.next_tick_at = Some(after_minutes(now, minutes));
		}

		Ok(true)
	}

	/// `Idle -> Ticking`; a stopped poller stays stopped and returns `false`.
	pub(crate) fn begin_tick(&mut self) -> bool {
		if !self.enabled {
			return false;
		}

		self.state = PollerState::Ticking;
		true
	}

	/// Back to `Idle` unless the poller got disabled while dispatching.
	pub(crate) fn finish_tick(&mut self, now: DateTime<Utc>) {
		self.last_tick_at = Some(now);

		if self.enabled {
			self.state = PollerState::Idle;
			self.next_tick_at = Some(after_minutes(now, self.interval_minutes));
		} else {
			self.state = PollerState::Stopped;
			self.next_tick_at = None;
		}
	}
}

/// Everything the scheduler, the executor and the configuration facade share.
#[derive(Debug)]
pub struct OrchestratorState {
	catalog: Catalog,
	processes: ProcessSet,
	registry: EndpointRegistry,
	master: Mutex<MasterPollerState>,
	status: StatusStore,
}

impl OrchestratorState {
	/// Builds the state from the catalog defaults overlaid with `config`.
	pub async fn new(catalog: Catalog, config: &SyncConfig, now: DateTime<Utc>) -> Self {
		let processes = ProcessSet::from_catalog(&catalog);
		let registry = EndpointRegistry::from_catalog(&catalog);
		let master = MasterPollerState::new(
			config.master_poller.enabled,
			config.master_poller.interval_minutes,
			now,
		);

		let this = Self::from_parts(catalog, processes, registry, master).await;

		for (process, process_config) in &config.processes {
			if let Err(e) = this
				.apply_override(process, process_config.to_override())
				.await
			{
				warn!(%process, ?e, "Ignoring stored process configuration;");
			}
		}

		this
	}

	pub async fn from_parts(
		catalog: Catalog,
		processes: ProcessSet,
		registry: EndpointRegistry,
		master: MasterPollerState,
	) -> Self {
		let status = StatusStore::new(&processes.all().await, &master);

		Self {
			catalog,
			processes,
			registry,
			master: Mutex::new(master),
			status,
		}
	}

	#[must_use]
	pub const fn catalog(&self) -> &Catalog {
		&self.catalog
	}

	#[must_use]
	pub const fn processes(&self) -> &ProcessSet {
		&self.processes
	}

	#[must_use]
	pub const fn registry(&self) -> &EndpointRegistry {
		&self.registry
	}

	#[must_use]
	pub const fn status(&self) -> &StatusStore {
		&self.status
	}

	pub async fn master(&self) -> MasterPollerState {
		self.master.lock().await.clone()
	}

	/// Mutates one descriptor under its lock and publishes the new snapshot.
	pub(crate) async fn update_process<T>(
		&self,
		process: &str,
		f: impl FnOnce(&mut ProcessDescriptor) -> T,
	) -> Result<T, Error> {
		let mut descriptor = self.processes.lock(process).await?;
		let out = f(&mut descriptor);
		self.status.publish(&descriptor);

		Ok(out)
	}

	pub(crate) async fn update_master<T>(&self, f: impl FnOnce(&mut MasterPollerState) -> T) -> T {
		let mut master = self.master.lock().await;
		let out = f(&mut master);
		self.status.publish_master(&master);

		out
	}

	/// Applies `changes` to one process; an unsupported version rejects the whole override.
	///
	/// Returns `true` if anything changed.
	pub async fn apply_override(
		&self,
		process: &str,
		changes: ProcessOverride,
	) -> Result<bool, Error> {
		if let Some(version) = &changes.current_version {
			self.registry
				.binding(process)
				.await?
				.ensure_supported(process, version)?;
		} else {
			// surface unknown processes even for interval-only overrides
			self.processes.lock(process).await?;
		}

		let mut changed = false;

		if let Some(minutes) = changes.interval_minutes {
			changed |= self
				.update_process(process, |descriptor| descriptor.set_interval(minutes))
				.await?;
		}

		if let Some(version) = &changes.current_version {
			changed |= self.registry.set_current_version(process, version).await?;
		}

		Ok(changed)
	}

	/// Snapshot of everything that is persisted.
	pub async fn to_config(&self) -> SyncConfig {
		let master = self.master().await;
		let mut processes = Vec::with_capacity(self.processes.names().len());

		for descriptor in self.processes.all().await {
			match self.registry.current_version(descriptor.name()).await {
				Ok(current_version) => processes.push((
					descriptor.name().to_owned(),
					ProcessConfig {
						interval_minutes: descriptor.interval_minutes(),
						current_version,
					},
				)),
				Err(e) => warn!(process = %descriptor.name(), ?e, "Process without endpoint binding;"),
			}
		}

		SyncConfig::new(
			MasterPollerConfig {
				enabled: master.enabled,
				interval_minutes: master.interval_minutes,
			},
			processes,
		)
	}
}
