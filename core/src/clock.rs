use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};

/// Source of wall-clock time for schedule computations.
pub trait Clock: Send + Sync + 'static {
	fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// A clock that only moves when told to, so schedules can be asserted exactly.
#[derive(Debug)]
pub struct ManualClock {
	now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
	#[must_use]
	pub const fn new(start: DateTime<Utc>) -> Self {
		Self {
			now: RwLock::new(start),
		}
	}

	pub fn set(&self, now: DateTime<Utc>) {
		*self.now.write().unwrap_or_else(PoisonError::into_inner) = now;
	}

	pub fn advance(&self, by: TimeDelta) {
		let mut now = self.now.write().unwrap_or_else(PoisonError::into_inner);
		*now += by;
	}
}

impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self.now.read().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Adds `minutes` to `at`, used for every next-due computation.
#[must_use]
pub fn after_minutes(at: DateTime<Utc>, minutes: u32) -> DateTime<Utc> {
	at + TimeDelta::minutes(i64::from(minutes))
}
