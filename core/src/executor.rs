use crate::{
	api::{ApiError, CallResponse, ExternalApi},
	clock::Clock,
	events::{EventBus, SyncEvent},
	state::OrchestratorState,
	status::RunGuard,
	Error, ErrorKind,
};

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::{task::JoinHandle, time::timeout};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunOutcome {
	#[default]
	Unknown,
	Success,
	/// Some records came in but the call also reported an error.
	Partial,
	Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunTrigger {
	Scheduled,
	Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStage {
	Resolving,
	Calling,
	Recording,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
	pub kind: ErrorKind,
	pub detail: String,
}

impl From<&Error> for RunError {
	fn from(e: &Error) -> Self {
		Self {
			kind: e.kind(),
			detail: e.to_string(),
		}
	}
}

/// Terminal record of one run; only the latest one per process is folded into its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
	pub process: String,
	/// `None` when no version could be resolved.
	pub version: Option<String>,
	pub trigger: RunTrigger,
	pub started_at: DateTime<Utc>,
	pub finished_at: DateTime<Utc>,
	pub outcome: RunOutcome,
	pub record_count: u64,
	pub error: Option<RunError>,
}

/// A run handed to the runtime; awaiting `handle` yields its record.
#[derive(Debug)]
pub struct DispatchedRun {
	pub process: String,
	pub handle: JoinHandle<RunRecord>,
}

#[derive(Clone)]
pub struct RunExecutor {
	state: Arc<OrchestratorState>,
	api: Arc<dyn ExternalApi>,
	clock: Arc<dyn Clock>,
	events: EventBus,
	call_timeout: Duration,
}

impl RunExecutor {
	pub fn new(
		state: Arc<OrchestratorState>,
		api: Arc<dyn ExternalApi>,
		clock: Arc<dyn Clock>,
		events: EventBus,
		call_timeout: Duration,
	) -> Self {
		Self {
			state,
			api,
			clock,
			events,
			call_timeout,
		}
	}

	/// Runs `process` to completion on the current task.
	pub async fn execute(&self, process: &str, trigger: RunTrigger) -> Result<RunRecord, Error> {
		let guard = self.state.status().try_acquire(process)?;
		Ok(self.run(guard, trigger).await)
	}

	/// Marks `process` as running and spawns the run; never waits on the external API.
	///
	/// Errors with [`Error::AlreadyRunning`] instead of queueing behind a run in progress.
	pub fn dispatch(&self, process: &str, trigger: RunTrigger) -> Result<DispatchedRun, Error> {
		let guard = self.state.status().try_acquire(process)?;

		Ok(self.spawn(guard, trigger))
	}

	/// Spawns the run of the process `guard` already marks as running.
	pub(crate) fn spawn(&self, guard: RunGuard, trigger: RunTrigger) -> DispatchedRun {
		let process = guard.process().to_owned();

		let handle = tokio::spawn({
			let this = self.clone();
			async move { this.run(guard, trigger).await }
		});

		DispatchedRun { process, handle }
	}

	#[instrument(skip_all, fields(process = %guard.process(), %trigger))]
	async fn run(&self, guard: RunGuard, trigger: RunTrigger) -> RunRecord {
		let process = guard.process().to_owned();
		let started_at = self.clock.now();

		self.events.emit(SyncEvent::RunStarted {
			process: process.clone(),
			trigger,
		});

		self.progress(&process, RunStage::Resolving);

		let (version, result) = match self.state.registry().current_version(&process).await {
			Ok(version) => {
				self.progress(&process, RunStage::Calling);
				let result = self.call(&process, &version).await;
				(Some(version), result)
			}
			Err(e) => {
				error!(?e, "Process has no endpoint binding;");
				(
					None,
					Err(Error::Configuration(format!(
						"process '{process}' has no endpoint binding"
					))),
				)
			}
		};

		self.progress(&process, RunStage::Recording);

		let (outcome, record_count, error) = match result {
			Ok(CallResponse {
				record_count,
				error: None,
			}) => (RunOutcome::Success, record_count, None),

			Ok(CallResponse {
				record_count,
				error: Some(detail),
			}) => (
				RunOutcome::Partial,
				record_count,
				Some(RunError {
					kind: ErrorKind::ExternalUnavailable,
					detail,
				}),
			),

			Err(e) => (RunOutcome::Failed, 0, Some(RunError::from(&e))),
		};

		let record = RunRecord {
			process: process.clone(),
			version,
			trigger,
			started_at,
			finished_at: self.clock.now(),
			outcome,
			record_count,
			error,
		};

		if let Err(e) = self
			.state
			.update_process(&process, |descriptor| descriptor.record_run(&record))
			.await
		{
			error!(?e, "Failed to record run;");
		}

		match &record.error {
			None => info!(record_count, "Run finished;"),
			Some(RunError { kind, detail }) => {
				warn!(%outcome, %kind, %detail, record_count, "Run finished with errors;");
			}
		}

		drop(guard);

		self.events.emit(SyncEvent::RunFinished(record.clone()));

		record
	}

	async fn call(&self, process: &str, version: &str) -> Result<CallResponse, Error> {
		match timeout(
			self.call_timeout,
			AssertUnwindSafe(self.api.call(process, version)).catch_unwind(),
		)
		.await
		{
			Ok(Ok(Ok(response))) => Ok(response),
			Ok(Ok(Err(e))) => Err(Error::from_api(process, version, e)),
			Ok(Err(_)) => {
				error!("External call panicked;");
				Err(Error::ExternalUnavailable {
					process: process.to_owned(),
					detail: "external call panicked".to_owned(),
				})
			}
			Err(_) => Err(Error::from_api(process, version, ApiError::Timeout)),
		}
	}

	fn progress(&self, process: &str, stage: RunStage) {
		self.events.emit(SyncEvent::RunProgress {
			process: process.to_owned(),
			stage,
		});
	}
}
