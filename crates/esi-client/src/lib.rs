#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! [`ExternalApi`] over HTTP: versioned corporation endpoints, paginated with the `X-Pages`
//! header.

use cd_core::{ApiError, CallResponse, Catalog, ExternalApi, ProbeResponse};
use cd_utils::truncate_detail;

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

const PAGES_HEADER: &str = "x-pages";
const MAX_DETAIL_CHARS: usize = 256;

pub struct RequestConfig {
	pub client: reqwest::Client,
	pub api_url: String,
	pub corporation_id: u64,
	pub auth_token: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("failed to build http client: {0}")]
	Client(#[from] reqwest::Error),
}

impl RequestConfig {
	/// A client with `timeout` applied to every request.
	pub fn new(
		api_url: impl Into<String>,
		corporation_id: u64,
		auth_token: Option<String>,
		timeout: Duration,
	) -> Result<Self, Error> {
		Ok(Self {
			client: reqwest::Client::builder()
				.user_agent(concat!("corpdeck/", env!("CARGO_PKG_VERSION")))
				.timeout(timeout)
				.build()?,
			api_url: api_url.into(),
			corporation_id,
			auth_token,
		})
	}
}

trait WithAuth {
	fn with_auth(self, token: Option<&str>) -> Self;
}

impl WithAuth for reqwest::RequestBuilder {
	fn with_auth(self, token: Option<&str>) -> Self {
		match token {
			Some(token) => self.bearer_auth(token),
			None => self,
		}
	}
}

/// Client of the external API for every process of a [`Catalog`].
pub struct EsiApi {
	config: RequestConfig,
	routes: HashMap<String, String>,
}

struct Page {
	records: u64,
	pages: u32,
}

impl EsiApi {
	#[must_use]
	pub fn new(config: RequestConfig, catalog: &Catalog) -> Self {
		Self {
			config,
			routes: catalog
				.specs()
				.iter()
				.map(|spec| (spec.name.clone(), spec.route.clone()))
				.collect(),
		}
	}

	fn url(&self, process: &str, version: &str) -> Result<String, ApiError> {
		self.routes
			.get(process)
			.map(|route| {
				build_url(
					&self.config.api_url,
					version,
					route,
					self.config.corporation_id,
				)
			})
			.ok_or_else(|| ApiError::Other(format!("no route known for process '{process}'")))
	}

	async fn get(&self, url: &str, page: u32) -> Result<reqwest::Response, ApiError> {
		trace!(%url, page, "Requesting page;");

		self.config
			.client
			.get(url)
			.query(&[("page", page)])
			.with_auth(self.config.auth_token.as_deref())
			.send()
			.await
			.map_err(map_transport)
	}

	async fn fetch_page(&self, url: &str, page: u32) -> Result<Page, ApiError> {
		let response = self.get(url, page).await?;
		let status = response.status();
		let pages = parse_pages(response.headers());
		let body = response.bytes().await.map_err(map_transport)?;

		if !status.is_success() {
			return Err(ApiError::Status {
				status: status.as_u16(),
				detail: truncate_detail(&String::from_utf8_lossy(&body), MAX_DETAIL_CHARS),
			});
		}

		Ok(Page {
			records: count_records(&body)?,
			pages,
		})
	}
}

#[async_trait]
impl ExternalApi for EsiApi {
	async fn call(&self, process: &str, version: &str) -> Result<CallResponse, ApiError> {
		let url = self.url(process, version)?;

		let Page {
			mut records,
			pages,
		} = self.fetch_page(&url, 1).await?;

		for page in 2..=pages {
			match self.fetch_page(&url, page).await {
				Ok(Page { records: more, .. }) => records += more,
				Err(e) => {
					warn!(%process, %version, page, pages, ?e, "Failed to fetch page;");
					return Ok(CallResponse {
						record_count: records,
						error: Some(format!("page {page} of {pages}: {e}")),
					});
				}
			}
		}

		debug!(%process, %version, records, pages, "Fetched every page;");

		Ok(CallResponse::complete(records))
	}

	async fn probe(&self, process: &str, version: &str) -> Result<ProbeResponse, ApiError> {
		let url = self.url(process, version)?;
		let response = self.get(&url, 1).await?;
		let status = response.status();
		let body = response.bytes().await.map_err(map_transport)?;

		if !status.is_success() {
			return Ok(ProbeResponse {
				status_code: status.as_u16(),
				detail: truncate_detail(&String::from_utf8_lossy(&body), MAX_DETAIL_CHARS),
			});
		}

		let records = count_records(&body)?;

		Ok(ProbeResponse {
			status_code: status.as_u16(),
			detail: format!("{records} records on the first page"),
		})
	}
}

/// `{api_url}/{version}/{route}` with the corporation id substituted into the route.
#[must_use]
pub fn build_url(api_url: &str, version: &str, route: &str, corporation_id: u64) -> String {
	format!(
		"{}/{version}/{}",
		api_url.trim_end_matches('/'),
		route
			.trim_start_matches('/')
			.replace("{corporation_id}", &corporation_id.to_string())
	)
}

/// Page count announced by the API; one page when the header is missing or garbled.
#[must_use]
pub fn parse_pages(headers: &HeaderMap) -> u32 {
	headers
		.get(PAGES_HEADER)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.trim().parse::<u32>().ok())
		.filter(|pages| *pages > 0)
		.unwrap_or(1)
}

/// Every corporation endpoint answers with a JSON array; anything else is a contract change.
pub fn count_records(body: &[u8]) -> Result<u64, ApiError> {
	match serde_json::from_slice::<Value>(body) {
		Ok(Value::Array(records)) => Ok(u64::try_from(records.len()).unwrap_or(u64::MAX)),
		Ok(other) => Err(ApiError::SchemaMismatch(format!(
			"expected a JSON array, got {}",
			json_kind(&other)
		))),
		Err(e) => Err(ApiError::SchemaMismatch(format!("invalid JSON body: {e}"))),
	}
}

fn json_kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "a boolean",
		Value::Number(_) => "a number",
		Value::String(_) => "a string",
		Value::Array(_) => "an array",
		Value::Object(_) => "an object",
	}
}

fn map_transport(e: reqwest::Error) -> ApiError {
	if e.is_timeout() {
		ApiError::Timeout
	} else if e.is_connect() {
		ApiError::Connection(e.to_string())
	} else {
		ApiError::Other(e.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use reqwest::header::HeaderValue;

	#[test]
	fn urls_carry_version_and_corporation() {
		assert_eq!(
			build_url(
				"https://esi.example.com/",
				"v5",
				"corporations/{corporation_id}/assets/",
				98_000_001
			),
			"https://esi.example.com/v5/corporations/98000001/assets/"
		);
	}

	#[test]
	fn routes_come_from_the_catalog() {
		let api = EsiApi::new(
			RequestConfig {
				client: reqwest::Client::new(),
				api_url: "https://esi.example.com".into(),
				corporation_id: 42,
				auth_token: None,
			},
			&Catalog::builtin(),
		);

		assert_eq!(
			api.url("mining", "v1").expect("mining is in the catalog"),
			"https://esi.example.com/v1/corporation/42/mining/observers/"
		);
		assert!(matches!(api.url("wallet", "v1"), Err(ApiError::Other(_))));
	}

	#[test]
	fn missing_or_garbled_page_headers_mean_one_page() {
		let mut headers = HeaderMap::new();
		assert_eq!(parse_pages(&headers), 1);

		headers.insert(PAGES_HEADER, HeaderValue::from_static("4"));
		assert_eq!(parse_pages(&headers), 4);

		headers.insert(PAGES_HEADER, HeaderValue::from_static("many"));
		assert_eq!(parse_pages(&headers), 1);

		headers.insert(PAGES_HEADER, HeaderValue::from_static("0"));
		assert_eq!(parse_pages(&headers), 1);
	}

	#[test]
	fn only_arrays_are_counted() {
		assert_eq!(
			count_records(br#"[{"order_id": 1}, {"order_id": 2}]"#).expect("array body"),
			2
		);
		assert_eq!(count_records(b"[]").expect("array body"), 0);

		assert!(matches!(
			count_records(br#"{"error": "not found"}"#),
			Err(ApiError::SchemaMismatch(detail)) if detail.contains("an object")
		));
		assert!(matches!(
			count_records(b"<html>"),
			Err(ApiError::SchemaMismatch(_))
		));
	}
}
