//! The master poller: one control loop that wakes on its interval and dispatches due runs.

use crate::{
	clock::Clock,
	events::{EventBus, SyncEvent},
	executor::{DispatchedRun, RunExecutor, RunRecord, RunTrigger},
	state::{MasterPollerState, OrchestratorState},
	status::RunGuard,
	Error,
};

use std::{
	future::pending,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use chrono::{DateTime, Utc};
use futures_concurrency::future::{Join, Race};
use serde::Serialize;
use tokio::{
	sync::Notify,
	task::JoinHandle,
	time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const ONE_MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PollerState {
	Idle,
	Ticking,
	Stopped,
}

/// What one tick dispatched.
#[derive(Debug)]
pub struct TickReport {
	pub at: DateTime<Utc>,
	pub dispatched: Vec<DispatchedRun>,
	/// Due processes left alone because their previous run is still in flight.
	pub skipped_running: Vec<String>,
}

impl TickReport {
	#[must_use]
	pub fn dispatched_processes(&self) -> Vec<&str> {
		self.dispatched
			.iter()
			.map(|run| run.process.as_str())
			.collect()
	}

	/// Waits for every dispatched run; runs whose task died are left out.
	pub async fn join_all(self) -> Vec<RunRecord> {
		self.dispatched
			.into_iter()
			.map(|run| run.handle)
			.collect::<Vec<_>>()
			.join()
			.await
			.into_iter()
			.filter_map(|res| {
				res.map_err(|e| error!(?e, "Failed to join run task;"))
					.ok()
			})
			.collect()
	}
}

struct ControlLoop {
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

pub struct Scheduler {
	state: Arc<OrchestratorState>,
	executor: RunExecutor,
	clock: Arc<dyn Clock>,
	events: EventBus,
	reconfigure: Notify,
	control: Mutex<Option<ControlLoop>>,
}

impl Scheduler {
	pub fn new(
		state: Arc<OrchestratorState>,
		executor: RunExecutor,
		clock: Arc<dyn Clock>,
		events: EventBus,
	) -> Self {
		Self {
			state,
			executor,
			clock,
			events,
			reconfigure: Notify::new(),
			control: Mutex::new(None),
		}
	}

	pub async fn master(&self) -> MasterPollerState {
		self.state.master().await
	}

	/// Ticks if the master poller is enabled and its next tick is due.
	pub async fn poll(&self) -> Option<TickReport> {
		let now = self.clock.now();

		if self.state.master().await.is_tick_due(now) {
			Some(self.tick_at(now).await)
		} else {
			None
		}
	}

	/// Marks `process` as running only if it is still due once marked.
	///
	/// A run finishing between the caller's due check and the mark re-arms the process, so
	/// the due check is repeated while holding the guard.
	async fn acquire_if_due(
		&self,
		process: &str,
		now: DateTime<Utc>,
	) -> Result<Option<RunGuard>, Error> {
		let guard = self.state.status().try_acquire(process)?;

		if self.state.processes().is_due(process, now).await? {
			Ok(Some(guard))
		} else {
			Ok(None)
		}
	}

	/// Dispatches every due process in catalog order, without waiting for any of them.
	///
	/// A stopped poller dispatches nothing and stays stopped.
	pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
		let mut report = TickReport {
			at: now,
			dispatched: vec![],
			skipped_running: vec![],
		};

		if !self.state.update_master(MasterPollerState::begin_tick).await {
			debug!("Master poller is stopped, not ticking;");
			return report;
		}

		self.events.emit(SyncEvent::PollerStateChanged {
			state: PollerState::Ticking,
		});

		for process in self.state.processes().names() {
			match self.state.processes().is_due(process, now).await {
				Ok(true) => {}
				Ok(false) => continue,
				Err(e) => {
					error!(%process, ?e, "Failed to check whether process is due;");
					continue;
				}
			}

			match self.acquire_if_due(process, now).await {
				Ok(Some(guard)) => report
					.dispatched
					.push(self.executor.spawn(guard, RunTrigger::Scheduled)),
				Ok(None) => trace!(%process, "Process got re-armed before dispatch;"),
				Err(Error::AlreadyRunning(_)) => {
					debug!(%process, "Skipping due process, previous run still in flight;");
					report.skipped_running.push(process.clone());
				}
				Err(e) => error!(%process, ?e, "Failed to dispatch run;"),
			}
		}

		let state = self
			.state
			.update_master(|master| {
				master.finish_tick(now);
				master.state
			})
			.await;

		trace!(
			dispatched = report.dispatched.len(),
			skipped = report.skipped_running.len(),
			"Tick completed;"
		);

		self.events.emit(SyncEvent::TickCompleted {
			at: now,
			dispatched: report
				.dispatched_processes()
				.into_iter()
				.map(ToOwned::to_owned)
				.collect(),
			skipped: report.skipped_running.clone(),
		});
		self.events.emit(SyncEvent::PollerStateChanged { state });

		report
	}

	/// Returns `true` if the poller switched between running and stopped.
	pub async fn set_enabled(&self, enabled: bool) -> bool {
		let now = self.clock.now();
		let (changed, state) = self
			.state
			.update_master(|master| (master.set_enabled(enabled, now), master.state))
			.await;

		if changed {
			info!(%state, "Master poller toggled;");
			self.events.emit(SyncEvent::PollerStateChanged { state });
			self.reconfigure.notify_one();
		}

		changed
	}

	pub async fn set_interval(&self, minutes: u32) -> Result<bool, Error> {
		let now = self.clock.now();
		let changed = self
			.state
			.update_master(|master| master.set_interval(minutes, now))
			.await?;

		if changed {
			debug!(interval_minutes = minutes, "Master poller interval changed;");
			self.reconfigure.notify_one();
		}

		Ok(changed)
	}

	/// Spawns the control loop; a loop that panics is started again.
	pub fn start(self: &Arc<Self>) {
		let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);

		if control.is_some() {
			warn!("Master poller loop already started;");
			return;
		}

		let cancel = CancellationToken::new();

		let handle = tokio::spawn({
			let this = Arc::clone(self);
			let cancel = cancel.clone();

			async move {
				loop {
					if let Err(e) = tokio::spawn({
						let this = Arc::clone(&this);
						let cancel = cancel.child_token();
						async move { this.run_loop(cancel).await }
					})
					.await
					{
						error!(?e, "Master poller loop died; restarting it;");
					}

					if cancel.is_cancelled() {
						break;
					}
				}
			}
		});

		*control = Some(ControlLoop { cancel, handle });

		info!("Master poller loop started;");
	}

	/// Stops the control loop. Runs already dispatched carry on to completion.
	pub async fn shutdown(&self) {
		let control = self
			.control
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();

		let Some(ControlLoop { cancel, handle }) = control else {
			return;
		};

		cancel.cancel();

		let abort_handle = handle.abort_handle();

		match timeout(ONE_MINUTE, handle).await {
			Ok(Ok(())) => info!("Master poller loop stopped;"),
			Ok(Err(e)) => error!(?e, "Master poller loop failed while stopping;"),
			Err(_) => {
				error!("Master poller loop failed to stop in the allotted time, aborting;");
				abort_handle.abort();
			}
		}
	}

	async fn run_loop(&self, cancel: CancellationToken) {
		enum StreamMessage {
			Tick,
			Reconfigured,
			Stop,
		}

		loop {
			let until_next_tick = self.until_next_tick().await;

			match (
				async {
					match until_next_tick {
						Some(duration) => sleep(duration).await,
						None => pending().await,
					}
					StreamMessage::Tick
				},
				async {
					self.reconfigure.notified().await;
					StreamMessage::Reconfigured
				},
				async {
					cancel.cancelled().await;
					StreamMessage::Stop
				},
			)
				.race()
				.await
			{
				StreamMessage::Tick => {
					// dispatched runs are detached, their handles are not needed here
					self.poll().await;
				}
				StreamMessage::Reconfigured => trace!("Master poller reconfigured;"),
				StreamMessage::Stop => break,
			}
		}
	}

	async fn until_next_tick(&self) -> Option<Duration> {
		let master = self.state.master().await;

		if !master.enabled {
			return None;
		}

		master.next_tick_at.map(|next_tick_at| {
			(next_tick_at - self.clock.now())
				.to_std()
				.unwrap_or(Duration::ZERO)
		})
	}
}
