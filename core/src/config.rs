//! Persisted orchestrator configuration and the key-value stores it lives in.

use crate::catalog::{Catalog, ProcessOverride, DEFAULT_MASTER_INTERVAL_MINUTES};

use cd_utils::error::FileIOError;

use std::{
	collections::{BTreeMap, HashMap},
	io,
	path::{Path, PathBuf},
};

use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;
use tokio::{fs, sync::RwLock};
use tracing::{debug, error, info, warn};

/// Key of the configuration document in the [`KvStore`].
pub const SYNC_CONFIG_KEY: &str = "sync_config";

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("invalid sync configuration document: {0}")]
	SerdeJson(#[from] serde_json::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("invalid store key: '{0}'")]
	InvalidKey(String),
	#[error("unexpected migration: {current} -> {next}")]
	UnexpectedMigration { current: u64, next: u64 },
	#[error("unknown sync configuration version: {0}")]
	UnknownVersion(u64),
	#[error("store backend failure: {0}")]
	Backend(String),
}

/// Named blobs, the only persistence facility the orchestrator needs.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ConfigError>;

	async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), ConfigError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
	blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl KvStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ConfigError> {
		Ok(self.blobs.read().await.get(key).cloned())
	}

	async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), ConfigError> {
		self.blobs.write().await.insert(key.to_owned(), value);
		Ok(())
	}
}

/// One `<key>.json` file per key under `root`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
	root: PathBuf,
}

impl JsonFileStore {
	pub fn new(root: impl AsRef<Path>) -> Self {
		Self {
			root: root.as_ref().to_path_buf(),
		}
	}

	#[must_use]
	pub fn root(&self) -> &Path {
		&self.root
	}

	fn path(&self, key: &str) -> Result<PathBuf, ConfigError> {
		if key.is_empty()
			|| !key
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
		{
			return Err(ConfigError::InvalidKey(key.to_owned()));
		}

		Ok(self.root.join(format!("{key}.json")))
	}
}

#[async_trait]
impl KvStore for JsonFileStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ConfigError> {
		let path = self.path(key)?;

		match fs::read(&path).await {
			Ok(bytes) => Ok(Some(bytes)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(FileIOError::from((path, e, "Failed to read stored value")).into()),
		}
	}

	async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), ConfigError> {
		let path = self.path(key)?;
		let tmp_path = path.with_extension("json.tmp");

		fs::create_dir_all(&self.root)
			.await
			.map_err(|e| FileIOError::from((&self.root, e, "Failed to create store directory")))?;

		fs::write(&tmp_path, value)
			.await
			.map_err(|e| FileIOError::from((&tmp_path, e, "Failed to write stored value")))?;

		fs::rename(&tmp_path, &path)
			.await
			.map_err(|e| FileIOError::from((&path, e, "Failed to replace stored value")))?;

		Ok(())
	}
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, strum::Display, Serialize_repr, Deserialize_repr)]
#[repr(u64)]
pub enum SyncConfigVersion {
	/// Processes carried their own `enabled` flag next to the interval.
	V1 = 1,
	V2 = 2,
}

impl SyncConfigVersion {
	pub const LATEST: Self = Self::V2;

	const fn from_int(version: u64) -> Option<Self> {
		match version {
			1 => Some(Self::V1),
			2 => Some(Self::V2),
			_ => None,
		}
	}

	const fn int_value(self) -> u64 {
		self as u64
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterPollerConfig {
	pub enabled: bool,
	pub interval_minutes: u32,
}

impl Default for MasterPollerConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			interval_minutes: DEFAULT_MASTER_INTERVAL_MINUTES,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
	pub interval_minutes: u32,
	pub current_version: String,
}

impl ProcessConfig {
	#[must_use]
	pub fn to_override(&self) -> ProcessOverride {
		ProcessOverride {
			interval_minutes: Some(self.interval_minutes),
			current_version: Some(self.current_version.clone()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
	pub version: SyncConfigVersion,
	pub master_poller: MasterPollerConfig,
	pub processes: BTreeMap<String, ProcessConfig>,
}

impl SyncConfig {
	pub fn new(
		master_poller: MasterPollerConfig,
		processes: impl IntoIterator<Item = (String, ProcessConfig)>,
	) -> Self {
		Self {
			version: SyncConfigVersion::LATEST,
			master_poller,
			processes: processes.into_iter().collect(),
		}
	}

	#[must_use]
	pub fn defaults(catalog: &Catalog) -> Self {
		Self::new(
			MasterPollerConfig::default(),
			catalog.specs().iter().map(|spec| {
				(
					spec.name.clone(),
					ProcessConfig {
						interval_minutes: spec.default_interval_minutes,
						current_version: spec.default_version.clone(),
					},
				)
			}),
		)
	}

	pub fn to_vec(&self) -> Result<Vec<u8>, ConfigError> {
		serde_json::to_vec_pretty(self).map_err(Into::into)
	}

	/// Parses a stored document of any known version, migrating it to the latest one.
	pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
		Self::parse(bytes).map(|(config, _)| config)
	}

	/// Loads the stored configuration, writing the defaults when there is none yet.
	///
	/// Migrated or repaired documents are written back.
	pub async fn load(store: &dyn KvStore, catalog: &Catalog) -> Result<Self, ConfigError> {
		let Some(bytes) = store.get(SYNC_CONFIG_KEY).await? else {
			info!("No stored sync configuration, writing defaults;");
			let config = Self::defaults(catalog);
			config.save(store).await?;
			return Ok(config);
		};

		let (mut config, migrated) = Self::parse(&bytes)?;

		if config.normalize(catalog) || migrated {
			config.save(store).await?;
		}

		Ok(config)
	}

	pub async fn save(&self, store: &dyn KvStore) -> Result<(), ConfigError> {
		store.set(SYNC_CONFIG_KEY, self.to_vec()?).await?;
		debug!("Sync configuration saved;");

		Ok(())
	}

	/// Makes the document agree with `catalog`; returns `true` if anything had to change.
	///
	/// Unknown processes are dropped, missing ones get their defaults and stored versions the
	/// catalog no longer supports fall back to the default version.
	pub fn normalize(&mut self, catalog: &Catalog) -> bool {
		let mut changed = false;

		if self.master_poller.interval_minutes == 0 {
			warn!("Stored master poller interval is zero, using the default;");
			self.master_poller.interval_minutes = DEFAULT_MASTER_INTERVAL_MINUTES;
			changed = true;
		}

		self.processes.retain(|process, _| {
			let known = catalog.get(process).is_some();
			if !known {
				warn!(%process, "Ignoring stored configuration of unknown process;");
				changed = true;
			}
			known
		});

		for spec in catalog.specs() {
			match self.processes.get_mut(&spec.name) {
				Some(process) if !spec.supported_versions.contains(&process.current_version) => {
					warn!(
						process = %spec.name,
						stored_version = %process.current_version,
						default_version = %spec.default_version,
						"Stored endpoint version is not supported anymore;"
					);
					process.current_version.clone_from(&spec.default_version);
					changed = true;
				}
				Some(_) => {}
				None => {
					self.processes.insert(
						spec.name.clone(),
						ProcessConfig {
							interval_minutes: spec.default_interval_minutes,
							current_version: spec.default_version.clone(),
						},
					);
					changed = true;
				}
			}
		}

		changed
	}

	fn parse(bytes: &[u8]) -> Result<(Self, bool), ConfigError> {
		let mut document: Map<String, Value> = serde_json::from_slice(bytes)?;

		let stored = document
			.get("version")
			.and_then(Value::as_u64)
			.unwrap_or(SyncConfigVersion::V1.int_value());

		if stored > SyncConfigVersion::LATEST.int_value() || stored == 0 {
			return Err(ConfigError::UnknownVersion(stored));
		}

		let migrated = stored < SyncConfigVersion::LATEST.int_value();

		for (current, next) in (stored..=SyncConfigVersion::LATEST.int_value()).tuple_windows() {
			match (
				SyncConfigVersion::from_int(current),
				SyncConfigVersion::from_int(next),
			) {
				(Some(SyncConfigVersion::V1), Some(SyncConfigVersion::V2)) => {
					info!("Running sync config migrator: {current} -> {next}");
					fold_enabled_flags(&mut document);
				}

				_ => {
					error!(current, "Sync config version is not handled;");
					return Err(ConfigError::UnexpectedMigration { current, next });
				}
			}
		}

		document.insert(
			String::from("version"),
			Value::from(SyncConfigVersion::LATEST.int_value()),
		);

		Ok((serde_json::from_value(Value::Object(document))?, migrated))
	}
}

/// V1 -> V2: a disabled process becomes a process with a zero interval.
fn fold_enabled_flags(document: &mut Map<String, Value>) {
	let Some(Value::Object(processes)) = document.get_mut("processes") else {
		return;
	};

	for process in processes.values_mut() {
		if let Value::Object(process) = process {
			if let Some(Value::Bool(false)) = process.remove("enabled") {
				process.insert(String::from("interval_minutes"), Value::from(0_u32));
			}
		}
	}
}
