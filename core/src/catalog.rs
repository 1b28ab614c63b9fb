//! The fixed set of synchronized processes and their schedule descriptors.

use crate::{
	clock::after_minutes,
	executor::{RunOutcome, RunRecord},
	Error,
};

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

/// Master poller cadence used when nothing else was configured.
pub const DEFAULT_MASTER_INTERVAL_MINUTES: u32 = 5;

/// Static description of one synchronized data category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
	pub name: String,
	pub default_interval_minutes: u32,
	/// Ordered oldest to newest.
	pub supported_versions: Vec<String>,
	pub default_version: String,
	/// Route template below the version segment, `{corporation_id}` is substituted by the client.
	pub route: String,
}

impl ProcessSpec {
	pub fn new(
		name: impl Into<String>,
		default_interval_minutes: u32,
		supported_versions: &[&str],
		default_version: impl Into<String>,
		route: impl Into<String>,
	) -> Self {
		Self {
			name: name.into(),
			default_interval_minutes,
			supported_versions: supported_versions.iter().map(ToString::to_string).collect(),
			default_version: default_version.into(),
			route: route.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
	specs: Vec<ProcessSpec>,
}

impl Catalog {
	/// Checks that names are unique and every default version is one of the supported ones.
	pub fn new(specs: Vec<ProcessSpec>) -> Result<Self, Error> {
		let mut seen = HashSet::with_capacity(specs.len());

		for spec in &specs {
			if !seen.insert(spec.name.as_str()) {
				return Err(Error::Configuration(format!(
					"process '{}' declared twice in the catalog",
					spec.name
				)));
			}

			if spec.supported_versions.is_empty() {
				return Err(Error::Configuration(format!(
					"process '{}' has no supported versions",
					spec.name
				)));
			}

			if !spec.supported_versions.contains(&spec.default_version) {
				return Err(Error::Configuration(format!(
					"default version {} of process '{}' is not in its supported versions",
					spec.default_version, spec.name
				)));
			}
		}

		Ok(Self { specs })
	}

	/// Corporation data categories shown by the dashboard.
	#[must_use]
	pub fn builtin() -> Self {
		Self {
			specs: vec![
				ProcessSpec::new(
					"members",
					60,
					&["v3", "v4"],
					"v4",
					"corporations/{corporation_id}/members/",
				),
				ProcessSpec::new(
					"assets",
					60,
					&["v3", "v4", "v5"],
					"v5",
					"corporations/{corporation_id}/assets/",
				),
				ProcessSpec::new(
					"manufacturing",
					15,
					&["v1"],
					"v1",
					"corporations/{corporation_id}/industry/jobs/",
				),
				ProcessSpec::new(
					"mining",
					60,
					&["v1"],
					"v1",
					"corporation/{corporation_id}/mining/observers/",
				),
				ProcessSpec::new(
					"market",
					10,
					&["v2", "v3"],
					"v2",
					"corporations/{corporation_id}/orders/",
				),
				ProcessSpec::new(
					"killmails",
					30,
					&["v1"],
					"v1",
					"corporations/{corporation_id}/killmails/recent/",
				),
				ProcessSpec::new(
					"income",
					30,
					&["v3", "v4"],
					"v4",
					"corporations/{corporation_id}/wallets/1/journal/",
				),
			],
		}
	}

	#[must_use]
	pub fn specs(&self) -> &[ProcessSpec] {
		&self.specs
	}

	#[must_use]
	pub fn get(&self, name: &str) -> Option<&ProcessSpec> {
		self.specs.iter().find(|spec| spec.name == name)
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.specs.iter().map(|spec| spec.name.as_str())
	}
}

/// Schedule summary of one process.
///
/// `enabled` is not stored: a process is enabled exactly when its interval is non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessDescriptor {
	name: String,
	interval_minutes: u32,
	last_run_at: Option<DateTime<Utc>>,
	next_run_at: Option<DateTime<Utc>>,
	last_outcome: RunOutcome,
	last_record_count: u64,
	last_error: Option<String>,
}

impl ProcessDescriptor {
	pub fn new(name: impl Into<String>, interval_minutes: u32) -> Self {
		Self {
			name: name.into(),
			interval_minutes,
			last_run_at: None,
			next_run_at: None,
			last_outcome: RunOutcome::Unknown,
			last_record_count: 0,
			last_error: None,
		}
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub const fn interval_minutes(&self) -> u32 {
		self.interval_minutes
	}

	#[must_use]
	pub const fn is_enabled(&self) -> bool {
		self.interval_minutes > 0
	}

	#[must_use]
	pub const fn last_run_at(&self) -> Option<DateTime<Utc>> {
		self.last_run_at
	}

	#[must_use]
	pub const fn next_run_at(&self) -> Option<DateTime<Utc>> {
		self.next_run_at
	}

	#[must_use]
	pub const fn last_outcome(&self) -> RunOutcome {
		self.last_outcome
	}

	#[must_use]
	pub const fn last_record_count(&self) -> u64 {
		self.last_record_count
	}

	#[must_use]
	pub fn last_error(&self) -> Option<&str> {
		self.last_error.as_deref()
	}

	#[must_use]
	pub fn is_due(&self, now: DateTime<Utc>) -> bool {
		if !self.is_enabled() {
			return false;
		}

		match (self.last_run_at, self.next_run_at) {
			(None, _) => true,
			(Some(_), Some(next_run_at)) => now >= next_run_at,
			// unreachable while enabled, `next_run_at` is always set after a run
			(Some(_), None) => true,
		}
	}

	/// Returns `true` if the interval actually changed.
	pub fn set_interval(&mut self, interval_minutes: u32) -> bool {
		if self.interval_minutes == interval_minutes {
			return false;
		}

		self.interval_minutes = interval_minutes;
		self.rearm();

		true
	}

	/// Folds a finished run into the summary; failed runs consume the schedule slot too.
	pub fn record_run(&mut self, record: &RunRecord) {
		self.last_run_at = Some(record.finished_at);
		self.last_outcome = record.outcome;

		if matches!(record.outcome, RunOutcome::Success | RunOutcome::Partial) {
			self.last_record_count = record.record_count;
		}

		self.last_error = record.error.as_ref().map(|e| e.detail.clone());
		self.rearm();
	}

	fn rearm(&mut self) {
		self.next_run_at = match (self.last_run_at, self.interval_minutes) {
			(_, 0) | (None, _) => None,
			(Some(last_run_at), minutes) => Some(after_minutes(last_run_at, minutes)),
		};
	}
}

/// Partial update of a process configuration, absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOverride {
	pub interval_minutes: Option<u32>,
	pub current_version: Option<String>,
}

impl ProcessOverride {
	#[must_use]
	pub fn disable() -> Self {
		Self {
			interval_minutes: Some(0),
			current_version: None,
		}
	}
}

/// Descriptors of every process, each behind its own lock so schedule updates of one process
/// never wait on another.
#[derive(Debug)]
pub struct ProcessSet {
	order: Vec<String>,
	descriptors: HashMap<String, Mutex<ProcessDescriptor>>,
}

impl ProcessSet {
	#[must_use]
	pub fn from_catalog(catalog: &Catalog) -> Self {
		Self::from_descriptors(
			catalog
				.specs()
				.iter()
				.map(|spec| ProcessDescriptor::new(&spec.name, spec.default_interval_minutes)),
		)
	}

	pub fn from_descriptors(descriptors: impl IntoIterator<Item = ProcessDescriptor>) -> Self {
		let (order, descriptors) = descriptors
			.into_iter()
			.map(|descriptor| {
				(
					descriptor.name.clone(),
					(descriptor.name.clone(), Mutex::new(descriptor)),
				)
			})
			.unzip();

		Self { order, descriptors }
	}

	/// Process names in catalog order.
	#[must_use]
	pub fn names(&self) -> &[String] {
		&self.order
	}

	pub async fn all(&self) -> Vec<ProcessDescriptor> {
		let mut all = Vec::with_capacity(self.order.len());

		for name in &self.order {
			if let Some(descriptor) = self.descriptors.get(name) {
				all.push(descriptor.lock().await.clone());
			}
		}

		all
	}

	pub async fn get(&self, name: &str) -> Result<ProcessDescriptor, Error> {
		Ok(self.lock(name).await?.clone())
	}

	pub async fn is_due(&self, name: &str, now: DateTime<Utc>) -> Result<bool, Error> {
		Ok(self.lock(name).await?.is_due(now))
	}

	pub(crate) async fn lock(&self, name: &str) -> Result<MutexGuard<'_, ProcessDescriptor>, Error> {
		match self.descriptors.get(name) {
			Some(descriptor) => Ok(descriptor.lock().await),
			None => Err(Error::UnknownProcess(name.to_owned())),
		}
	}
}
