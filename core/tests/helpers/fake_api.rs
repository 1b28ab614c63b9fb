//! Scripted stand-in for the external API.

use cd_core::{ApiError, CallResponse, ExternalApi, ProbeResponse};

use std::{
	collections::HashMap,
	sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::Semaphore;

/// Records every call returns unless scripted otherwise.
pub const DEFAULT_RECORD_COUNT: u64 = 10;

#[derive(Debug, Clone)]
pub enum Script<T> {
	Respond(Result<T, ApiError>),
	Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Endpoint {
	Call,
	Probe,
}

#[derive(Default)]
struct Inner {
	calls: HashMap<String, Script<CallResponse>>,
	probes: HashMap<(String, String), Script<ProbeResponse>>,
	gates: HashMap<(Endpoint, String), Arc<Semaphore>>,
	active: HashMap<String, usize>,
	max_active: HashMap<String, usize>,
	probe_gate: Option<Arc<Semaphore>>,
	probes_in_flight: usize,
	max_probes_in_flight: usize,
	call_log: Vec<(String, String)>,
	probe_log: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakeApi {
	inner: Mutex<Inner>,
}

impl FakeApi {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn respond(&self, process: &str, result: Result<CallResponse, ApiError>) {
		self.inner()
			.calls
			.insert(process.to_owned(), Script::Respond(result));
	}

	pub fn panic_on_call(&self, process: &str) {
		self.inner().calls.insert(process.to_owned(), Script::Panic);
	}

	pub fn probe_answers(
		&self,
		process: &str,
		version: &str,
		result: Result<ProbeResponse, ApiError>,
	) {
		self.inner().probes.insert(
			(process.to_owned(), version.to_owned()),
			Script::Respond(result),
		);
	}

	pub fn panic_on_probe(&self, process: &str, version: &str) {
		self.inner()
			.probes
			.insert((process.to_owned(), version.to_owned()), Script::Panic);
	}

	/// Calls of `process` made from now on block until [`FakeApi::release`].
	pub fn gate(&self, process: &str) {
		self.inner()
			.gates
			.insert((Endpoint::Call, process.to_owned()), Arc::new(Semaphore::new(0)));
	}

	/// Probes of `process` made from now on never answer.
	pub fn hang_probes(&self, process: &str) {
		self.inner()
			.gates
			.insert((Endpoint::Probe, process.to_owned()), Arc::new(Semaphore::new(0)));
	}

	/// Probes of every process made from now on block until [`FakeApi::release_probes`].
	pub fn gate_probes(&self) {
		self.inner().probe_gate = Some(Arc::new(Semaphore::new(0)));
	}

	pub fn release_probes(&self, count: usize) {
		if let Some(gate) = &self.inner().probe_gate {
			gate.add_permits(count);
		}
	}

	pub fn probes_in_flight(&self) -> usize {
		self.inner().probes_in_flight
	}

	pub fn max_probes_in_flight(&self) -> usize {
		self.inner().max_probes_in_flight
	}

	/// Lets one blocked call of `process` through.
	pub fn release(&self, process: &str) {
		if let Some(gate) = self.inner().gates.get(&(Endpoint::Call, process.to_owned())) {
			gate.add_permits(1);
		}
	}

	/// New calls of `process` no longer block; calls already waiting still need a release.
	pub fn ungate(&self, process: &str) {
		self.inner()
			.gates
			.remove(&(Endpoint::Call, process.to_owned()));
	}

	/// Versions used by the calls made for `process`, in call order.
	pub fn calls(&self, process: &str) -> Vec<String> {
		self.inner()
			.call_log
			.iter()
			.filter(|(called, _)| called == process)
			.map(|(_, version)| version.clone())
			.collect()
	}

	pub fn probes(&self) -> Vec<(String, String)> {
		self.inner().probe_log.clone()
	}

	pub fn max_concurrent(&self, process: &str) -> usize {
		self.inner()
			.max_active
			.get(process)
			.copied()
			.unwrap_or_default()
	}

	fn inner(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().expect("fake api lock is never poisoned")
	}
}

/// Leaves the active count on drop, so panicking calls are accounted for too.
struct Active<'a> {
	api: &'a FakeApi,
	process: String,
}

impl Drop for Active<'_> {
	fn drop(&mut self) {
		if let Some(active) = self.api.inner().active.get_mut(&self.process) {
			*active -= 1;
		}
	}
}

struct InFlightProbe<'a> {
	api: &'a FakeApi,
}

impl Drop for InFlightProbe<'_> {
	fn drop(&mut self) {
		self.api.inner().probes_in_flight -= 1;
	}
}

#[async_trait]
impl ExternalApi for FakeApi {
	async fn call(&self, process: &str, version: &str) -> Result<CallResponse, ApiError> {
		let (script, gate) = {
			let mut inner = self.inner();
			inner
				.call_log
				.push((process.to_owned(), version.to_owned()));

			let active = inner.active.entry(process.to_owned()).or_default();
			*active += 1;
			let active = *active;

			let max_active = inner.max_active.entry(process.to_owned()).or_default();
			*max_active = (*max_active).max(active);

			(
				inner
					.calls
					.get(process)
					.cloned()
					.unwrap_or_else(|| {
						Script::Respond(Ok(CallResponse::complete(DEFAULT_RECORD_COUNT)))
					}),
				inner
					.gates
					.get(&(Endpoint::Call, process.to_owned()))
					.cloned(),
			)
		};

		let _active = Active {
			api: self,
			process: process.to_owned(),
		};

		if let Some(gate) = gate {
			gate.acquire().await.expect("gates are never closed").forget();
		}

		match script {
			Script::Respond(result) => result,
			Script::Panic => panic!("scripted panic while calling {process}"),
		}
	}

	async fn probe(&self, process: &str, version: &str) -> Result<ProbeResponse, ApiError> {
		let (script, gate, shared_gate) = {
			let mut inner = self.inner();
			inner
				.probe_log
				.push((process.to_owned(), version.to_owned()));

			inner.probes_in_flight += 1;
			inner.max_probes_in_flight = inner.max_probes_in_flight.max(inner.probes_in_flight);

			(
				inner
					.probes
					.get(&(process.to_owned(), version.to_owned()))
					.cloned()
					.unwrap_or_else(|| {
						Script::Respond(Ok(ProbeResponse {
							status_code: 200,
							detail: String::new(),
						}))
					}),
				inner
					.gates
					.get(&(Endpoint::Probe, process.to_owned()))
					.cloned(),
				inner.probe_gate.clone(),
			)
		};

		let _in_flight = InFlightProbe { api: self };

		if let Some(gate) = gate {
			gate.acquire().await.expect("gates are never closed").forget();
		}

		if let Some(gate) = shared_gate {
			gate.acquire().await.expect("gates are never closed").forget();
		}

		match script {
			Script::Respond(result) => result,
			Script::Panic => panic!("scripted panic while probing {process} {version}"),
		}
	}
}
