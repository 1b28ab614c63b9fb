use crate::{catalog::Catalog, probe::ValidationOutcome, Error};

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// What the validation probe last said about one version of a process endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationRecord {
	pub valid: bool,
	pub outcome: ValidationOutcome,
	pub checked_at: DateTime<Utc>,
	pub detail: String,
}

/// The external API version a process is bound to.
///
/// Version tokens are opaque; their order in `supported_versions` is the only notion of "newer".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointBinding {
	supported_versions: Vec<String>,
	current_version: String,
	last_validation: BTreeMap<String, ValidationRecord>,
}

impl EndpointBinding {
	pub fn new(
		process: &str,
		supported_versions: Vec<String>,
		current_version: impl Into<String>,
	) -> Result<Self, Error> {
		let current_version = current_version.into();

		if supported_versions.is_empty() {
			return Err(Error::Configuration(format!(
				"process '{process}' has no supported versions"
			)));
		}

		if !supported_versions.contains(&current_version) {
			return Err(Error::UnsupportedVersion {
				process: process.to_owned(),
				version: current_version,
			});
		}

		Ok(Self {
			supported_versions,
			current_version,
			last_validation: BTreeMap::new(),
		})
	}

	#[must_use]
	pub fn supported_versions(&self) -> &[String] {
		&self.supported_versions
	}

	#[must_use]
	pub fn current_version(&self) -> &str {
		&self.current_version
	}

	#[must_use]
	pub const fn last_validation(&self) -> &BTreeMap<String, ValidationRecord> {
		&self.last_validation
	}

	#[must_use]
	pub fn supports(&self, version: &str) -> bool {
		self.supported_versions.iter().any(|v| v == version)
	}

	pub fn ensure_supported(&self, process: &str, version: &str) -> Result<(), Error> {
		if self.supports(version) {
			Ok(())
		} else {
			Err(Error::UnsupportedVersion {
				process: process.to_owned(),
				version: version.to_owned(),
			})
		}
	}

	/// Returns `true` if the binding moved to a different version.
	///
	/// The newly selected version loses any earlier validation record: it stays unvalidated until
	/// probed again while bound.
	pub fn set_current_version(&mut self, process: &str, version: &str) -> Result<bool, Error> {
		self.ensure_supported(process, version)?;

		if self.current_version == version {
			return Ok(false);
		}

		self.last_validation.remove(version);
		self.current_version = version.to_owned();

		Ok(true)
	}

	pub fn record_validation(&mut self, version: &str, record: ValidationRecord) {
		self.last_validation.insert(version.to_owned(), record);
	}

	/// Versions newer than the current one that the probe has not confirmed to be gone.
	#[must_use]
	pub fn newer_versions(&self) -> Vec<String> {
		self.supported_versions
			.iter()
			.skip_while(|version| **version != self.current_version)
			.skip(1)
			.filter(|version| {
				!matches!(
					self.last_validation.get(*version),
					Some(ValidationRecord {
						outcome: ValidationOutcome::Invalid,
						..
					})
				)
			})
			.cloned()
			.collect()
	}
}

/// Endpoint bindings of every process, locked per process.
///
/// Runs read the current version through the same lock that configuration changes take, so a run
/// never observes a version switch halfway.
#[derive(Debug)]
pub struct EndpointRegistry {
	bindings: HashMap<String, Mutex<EndpointBinding>>,
}

impl EndpointRegistry {
	#[must_use]
	pub fn from_catalog(catalog: &Catalog) -> Self {
		Self {
			bindings: catalog
				.specs()
				.iter()
				.map(|spec| {
					(
						spec.name.clone(),
						Mutex::new(EndpointBinding {
							supported_versions: spec.supported_versions.clone(),
							current_version: spec.default_version.clone(),
							last_validation: BTreeMap::new(),
						}),
					)
				})
				.collect(),
		}
	}

	pub fn from_bindings(bindings: impl IntoIterator<Item = (String, EndpointBinding)>) -> Self {
		Self {
			bindings: bindings
				.into_iter()
				.map(|(process, binding)| (process, Mutex::new(binding)))
				.collect(),
		}
	}

	pub async fn binding(&self, process: &str) -> Result<EndpointBinding, Error> {
		Ok(self.lock(process).await?.clone())
	}

	pub async fn current_version(&self, process: &str) -> Result<String, Error> {
		Ok(self.lock(process).await?.current_version.clone())
	}

	pub async fn supported_versions(&self, process: &str) -> Result<Vec<String>, Error> {
		Ok(self.lock(process).await?.supported_versions.clone())
	}

	/// Returns `true` if the binding changed, see [`EndpointBinding::set_current_version`].
	pub async fn set_current_version(&self, process: &str, version: &str) -> Result<bool, Error> {
		let changed = self
			.lock(process)
			.await?
			.set_current_version(process, version)?;

		if changed {
			debug!(%process, %version, "Endpoint version switched;");
		}

		Ok(changed)
	}

	pub async fn record_validation(
		&self,
		process: &str,
		version: &str,
		record: ValidationRecord,
	) -> Result<(), Error> {
		self.lock(process)
			.await?
			.record_validation(version, record);

		Ok(())
	}

	pub async fn newer_versions(&self, process: &str) -> Result<Vec<String>, Error> {
		Ok(self.lock(process).await?.newer_versions())
	}

	async fn lock(&self, process: &str) -> Result<MutexGuard<'_, EndpointBinding>, Error> {
		match self.bindings.get(process) {
			Some(binding) => Ok(binding.lock().await),
			None => Err(Error::UnknownProcess(process.to_owned())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(outcome: ValidationOutcome) -> ValidationRecord {
		ValidationRecord {
			valid: outcome == ValidationOutcome::Valid,
			outcome,
			checked_at: DateTime::<Utc>::UNIX_EPOCH,
			detail: String::new(),
		}
	}

	fn market() -> EndpointBinding {
		EndpointBinding::new("market", vec!["v2".into(), "v3".into()], "v2")
			.expect("market binding is valid")
	}

	#[test]
	fn rejects_unsupported_versions_without_changes() {
		let mut binding = market();
		let before = binding.clone();

		assert!(matches!(
			binding.set_current_version("market", "v5"),
			Err(Error::UnsupportedVersion { ref version, .. }) if version == "v5"
		));
		assert_eq!(binding, before);
	}

	#[test]
	fn switching_versions_drops_stale_validation_of_the_target() {
		let mut binding = market();
		binding.record_validation("v3", record(ValidationOutcome::Valid));
		binding.record_validation("v2", record(ValidationOutcome::Valid));

		assert!(binding.set_current_version("market", "v3").expect("v3 is supported"));
		assert_eq!(binding.current_version(), "v3");
		assert!(!binding.last_validation().contains_key("v3"));
		assert!(binding.last_validation().contains_key("v2"));

		// same version again is a no-op
		assert!(!binding.set_current_version("market", "v3").expect("v3 is supported"));
	}

	#[test]
	fn newer_versions_skip_confirmed_invalid_ones() {
		let mut binding = EndpointBinding::new(
			"assets",
			vec!["v3".into(), "v4".into(), "v5".into()],
			"v3",
		)
		.expect("assets binding is valid");

		assert_eq!(binding.newer_versions(), ["v4", "v5"]);

		binding.record_validation("v4", record(ValidationOutcome::Invalid));
		binding.record_validation("v5", record(ValidationOutcome::Unreachable));
		assert_eq!(binding.newer_versions(), ["v5"]);

		binding
			.set_current_version("assets", "v5")
			.expect("v5 is supported");
		assert!(binding.newer_versions().is_empty());
	}

	#[test]
	fn new_binding_requires_member_version() {
		assert!(matches!(
			EndpointBinding::new("market", vec!["v2".into()], "v3"),
			Err(Error::UnsupportedVersion { .. })
		));
		assert!(matches!(
			EndpointBinding::new("market", vec![], "v3"),
			Err(Error::Configuration(_))
		));
	}

	#[tokio::test]
	async fn registry_reports_unknown_processes() {
		let registry = EndpointRegistry::from_catalog(&Catalog::builtin());

		assert_eq!(
			registry
				.supported_versions("market")
				.await
				.expect("market is in the catalog"),
			["v2", "v3"]
		);
		assert!(matches!(
			registry.current_version("wallet").await,
			Err(Error::UnknownProcess(_))
		));
	}
}
