use super::FakeApi;

use cd_core::{
	ConfigError, ConfigFacade, KvStore, ManualClock, MemoryStore, Orchestrator,
	OrchestratorOptions, TickReport,
};

use std::{
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

pub fn start_time() -> DateTime<Utc> {
	"2026-01-01T00:00:00Z"
		.parse()
		.expect("hardcoded timestamp is valid")
}

pub fn minutes_after_start(minutes: i64) -> DateTime<Utc> {
	start_time() + TimeDelta::minutes(minutes)
}

/// Memory store that counts writes and can be told to fail them.
#[derive(Debug, Default)]
pub struct RecordingStore {
	inner: MemoryStore,
	writes: AtomicUsize,
	fail_writes: AtomicBool,
}

impl RecordingStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn writes(&self) -> usize {
		self.writes.load(Ordering::SeqCst)
	}

	pub fn fail_writes(&self, fail: bool) {
		self.fail_writes.store(fail, Ordering::SeqCst);
	}
}

#[async_trait]
impl KvStore for RecordingStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ConfigError> {
		self.inner.get(key).await
	}

	async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), ConfigError> {
		if self.fail_writes.load(Ordering::SeqCst) {
			return Err(ConfigError::Backend("disk full".to_owned()));
		}

		self.writes.fetch_add(1, Ordering::SeqCst);
		self.inner.set(key, value).await
	}
}

/// An orchestrator over a [`FakeApi`] and a [`ManualClock`], with its control loop never started.
pub struct Harness {
	pub orchestrator: Orchestrator,
	pub api: Arc<FakeApi>,
	pub clock: Arc<ManualClock>,
	pub store: Arc<dyn KvStore>,
}

impl Harness {
	pub async fn new() -> Self {
		Self::with_store(Arc::new(MemoryStore::new())).await
	}

	pub async fn with_store(store: Arc<dyn KvStore>) -> Self {
		Self::build(store, FakeApi::new(), |_| {}).await
	}

	pub async fn build(
		store: Arc<dyn KvStore>,
		api: Arc<FakeApi>,
		tune: impl FnOnce(&mut OrchestratorOptions),
	) -> Self {
		let clock = Arc::new(ManualClock::new(start_time()));

		let mut options = OrchestratorOptions {
			clock: clock.clone(),
			call_timeout: Duration::from_secs(5),
			probe_timeout: Duration::from_secs(5),
			..Default::default()
		};
		tune(&mut options);

		let orchestrator = Orchestrator::new(Arc::clone(&store), api.clone(), options)
			.await
			.expect("orchestrator builds over a healthy store");

		Self {
			orchestrator,
			api,
			clock,
			store,
		}
	}

	/// Same store and API, fresh in-memory state, as after a restart.
	pub async fn reopen(&self) -> Self {
		Self::build(Arc::clone(&self.store), Arc::clone(&self.api), |_| {}).await
	}

	pub fn commands(&self) -> &ConfigFacade {
		self.orchestrator.commands()
	}

	pub fn advance(&self, minutes: i64) {
		self.clock.advance(TimeDelta::minutes(minutes));
	}

	pub async fn tick(&self) -> TickReport {
		use cd_core::Clock;

		self.orchestrator
			.scheduler()
			.tick_at(self.clock.now())
			.await
	}
}
