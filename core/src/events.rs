//! Event bus for everything observing the orchestrator: UI invalidation, alerting, archiving of
//! run records.

use crate::{
	executor::{RunRecord, RunStage, RunTrigger},
	probe::ValidationResult,
	scheduler::PollerState,
};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum SyncEvent {
	PollerStateChanged {
		state: PollerState,
	},

	TickCompleted {
		at: DateTime<Utc>,
		dispatched: Vec<String>,
		/// Due processes skipped because their previous run is still going.
		skipped: Vec<String>,
	},

	RunStarted {
		process: String,
		trigger: RunTrigger,
	},

	RunProgress {
		process: String,
		stage: RunStage,
	},

	RunFinished(RunRecord),

	ValidationCompleted(ValidationResult),

	/// Newer endpoint versions exist for a process; never applied automatically.
	UpdateAvailable {
		process: String,
		current: String,
		newer: Vec<String>,
	},

	/// `None` when every process was touched at once, e.g. on a reset to defaults.
	ConfigurationChanged {
		process: Option<String>,
	},
}

#[derive(Debug, Clone)]
pub struct EventBus {
	sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self { sender }
	}

	pub fn emit(&self, event: SyncEvent) {
		// Nobody listening is fine
		let _ = self.sender.send(event);
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1024)
	}
}
