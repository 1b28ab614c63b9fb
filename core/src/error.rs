use crate::{api::ApiError, config::ConfigError};

use serde::Serialize;
use thiserror::Error;

/// Coarse classification of every failure the orchestrator reports.
///
/// Run records and validation results carry a kind rather than a full [`Error`] so they stay
/// cheap to clone into status snapshots and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
	NotFound,
	InvalidArgument,
	UnsupportedVersion,
	AlreadyRunning,
	ConfigurationError,
	ExternalUnavailable,
	ValidationMismatch,
	Persistence,
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("unknown sync process: '{0}'")]
	UnknownProcess(String),
	#[error("version '{version}' is not supported by process '{process}'")]
	UnsupportedVersion { process: String, version: String },
	#[error("process '{0}' is already running")]
	AlreadyRunning(String),
	#[error("configuration error: {0}")]
	Configuration(String),
	#[error("external API unavailable for '{process}': {detail}")]
	ExternalUnavailable { process: String, detail: String },
	#[error("endpoint {version} of '{process}' no longer matches the external API: {detail}")]
	ValidationMismatch {
		process: String,
		version: String,
		detail: String,
	},
	#[error("invalid interval: {0}")]
	InvalidInterval(&'static str),

	#[error(transparent)]
	Persistence(#[from] ConfigError),
}

impl Error {
	#[must_use]
	pub const fn kind(&self) -> ErrorKind {
		match self {
			Self::UnknownProcess(_) => ErrorKind::NotFound,
			Self::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
			Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
			Self::Configuration(_) => ErrorKind::ConfigurationError,
			Self::ExternalUnavailable { .. } => ErrorKind::ExternalUnavailable,
			Self::ValidationMismatch { .. } => ErrorKind::ValidationMismatch,
			Self::InvalidInterval(_) => ErrorKind::InvalidArgument,
			Self::Persistence(_) => ErrorKind::Persistence,
		}
	}

	/// Classifies a failed external call made on behalf of `process` using `version`.
	///
	/// A vanished route (404/410) or a payload of the wrong shape means the bound version no
	/// longer matches the external API; everything else is treated as the API being unavailable.
	pub(crate) fn from_api(process: &str, version: &str, e: ApiError) -> Self {
		match e {
			ApiError::Status { status, .. } if matches!(status, 404 | 410) => {
				Self::ValidationMismatch {
					process: process.to_owned(),
					version: version.to_owned(),
					detail: e.to_string(),
				}
			}
			ApiError::SchemaMismatch(_) => Self::ValidationMismatch {
				process: process.to_owned(),
				version: version.to_owned(),
				detail: e.to_string(),
			},
			ApiError::Timeout
			| ApiError::Connection(_)
			| ApiError::Status { .. }
			| ApiError::Other(_) => Self::ExternalUnavailable {
				process: process.to_owned(),
				detail: e.to_string(),
			},
		}
	}
}
