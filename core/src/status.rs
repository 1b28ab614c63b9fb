//! Read model polled by the presentation layer, plus the per-process running guard.

use crate::{
	catalog::ProcessDescriptor, executor::RunOutcome, scheduler::PollerState, state::MasterPollerState,
	Error,
};

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, PoisonError, RwLock,
	},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
	pub process: String,
	pub enabled: bool,
	pub interval_minutes: u32,
	pub last_run_at: Option<DateTime<Utc>>,
	pub next_run_at: Option<DateTime<Utc>>,
	pub last_outcome: RunOutcome,
	pub last_record_count: u64,
	pub last_error: Option<String>,
	pub running: bool,
}

impl ProcessStatus {
	fn refresh(&mut self, descriptor: &ProcessDescriptor) {
		self.enabled = descriptor.is_enabled();
		self.interval_minutes = descriptor.interval_minutes();
		self.last_run_at = descriptor.last_run_at();
		self.next_run_at = descriptor.next_run_at();
		self.last_outcome = descriptor.last_outcome();
		self.last_record_count = descriptor.last_record_count();
		self.last_error = descriptor.last_error().map(ToOwned::to_owned);
	}
}

impl From<&ProcessDescriptor> for ProcessStatus {
	fn from(descriptor: &ProcessDescriptor) -> Self {
		let mut status = Self {
			process: descriptor.name().to_owned(),
			enabled: false,
			interval_minutes: 0,
			last_run_at: None,
			next_run_at: None,
			last_outcome: RunOutcome::Unknown,
			last_record_count: 0,
			last_error: None,
			running: false,
		};
		status.refresh(descriptor);
		status
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MasterPollerStatus {
	pub enabled: bool,
	pub interval_minutes: u32,
	pub state: PollerState,
	pub last_tick_at: Option<DateTime<Utc>>,
	pub next_tick_at: Option<DateTime<Utc>>,
}

impl From<&MasterPollerState> for MasterPollerStatus {
	fn from(master: &MasterPollerState) -> Self {
		Self {
			enabled: master.enabled,
			interval_minutes: master.interval_minutes,
			state: master.state,
			last_tick_at: master.last_tick_at,
			next_tick_at: master.next_tick_at,
		}
	}
}

#[derive(Debug)]
struct StatusCell {
	running: AtomicBool,
	snapshot: RwLock<ProcessStatus>,
}

impl StatusCell {
	fn write(&self, f: impl FnOnce(&mut ProcessStatus)) {
		f(&mut *self.snapshot.write().unwrap_or_else(PoisonError::into_inner));
	}

	fn read(&self) -> ProcessStatus {
		self.snapshot
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}
}

/// Snapshots are cloned out of short-lived `std` locks that are never held across an await.
#[derive(Debug)]
pub struct StatusStore {
	order: Vec<String>,
	cells: HashMap<String, Arc<StatusCell>>,
	master: RwLock<MasterPollerStatus>,
}

impl StatusStore {
	pub fn new<'a>(
		descriptors: impl IntoIterator<Item = &'a ProcessDescriptor>,
		master: &MasterPollerState,
	) -> Self {
		let (order, cells) = descriptors
			.into_iter()
			.map(|descriptor| {
				let name = descriptor.name().to_owned();
				(
					name.clone(),
					(
						name,
						Arc::new(StatusCell {
							running: AtomicBool::new(false),
							snapshot: RwLock::new(ProcessStatus::from(descriptor)),
						}),
					),
				)
			})
			.unzip();

		Self {
			order,
			cells,
			master: RwLock::new(MasterPollerStatus::from(master)),
		}
	}

	pub fn status(&self, process: &str) -> Result<ProcessStatus, Error> {
		self.cell(process).map(|cell| cell.read())
	}

	/// Every process in catalog order.
	#[must_use]
	pub fn all(&self) -> Vec<ProcessStatus> {
		self.order
			.iter()
			.filter_map(|name| self.cells.get(name))
			.map(|cell| cell.read())
			.collect()
	}

	#[must_use]
	pub fn master(&self) -> MasterPollerStatus {
		self.master
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	#[must_use]
	pub fn is_running(&self, process: &str) -> bool {
		self.cells
			.get(process)
			.is_some_and(|cell| cell.running.load(Ordering::Acquire))
	}

	/// Processes whose last run failed, for the aggregate failure indicator.
	#[must_use]
	pub fn failing_count(&self) -> usize {
		self.all()
			.iter()
			.filter(|status| status.last_outcome == RunOutcome::Failed)
			.count()
	}

	/// Atomically marks `process` as running.
	///
	/// The mark is released when the returned guard drops, whatever way the run ends.
	pub fn try_acquire(&self, process: &str) -> Result<RunGuard, Error> {
		let cell = self.cell(process)?;

		if cell
			.running
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Err(Error::AlreadyRunning(process.to_owned()));
		}

		cell.write(|status| status.running = true);
		trace!(%process, "Acquired running guard;");

		Ok(RunGuard {
			process: process.to_owned(),
			cell: Arc::clone(cell),
		})
	}

	pub(crate) fn publish(&self, descriptor: &ProcessDescriptor) {
		if let Some(cell) = self.cells.get(descriptor.name()) {
			cell.write(|status| status.refresh(descriptor));
		}
	}

	pub(crate) fn publish_master(&self, master: &MasterPollerState) {
		*self.master.write().unwrap_or_else(PoisonError::into_inner) =
			MasterPollerStatus::from(master);
	}

	fn cell(&self, process: &str) -> Result<&Arc<StatusCell>, Error> {
		self.cells
			.get(process)
			.ok_or_else(|| Error::UnknownProcess(process.to_owned()))
	}
}

/// Proof that a process is marked as running.
#[derive(Debug)]
pub struct RunGuard {
	process: String,
	cell: Arc<StatusCell>,
}

impl RunGuard {
	#[must_use]
	pub fn process(&self) -> &str {
		&self.process
	}
}

impl Drop for RunGuard {
	fn drop(&mut self) {
		self.cell.write(|status| status.running = false);
		self.cell.running.store(false, Ordering::Release);
		trace!(process = %self.process, "Released running guard;");
	}
}
