//! Configuration Tests
//!
//! Persistence round trips, migration of stored documents, idempotent commands and the
//! all-or-nothing behaviour of commands whose write fails.

mod helpers;

use helpers::*;

use cd_core::{
	config::SYNC_CONFIG_KEY, Catalog, ErrorKind, JsonFileStore, KvStore, MemoryStore,
	PollerState, SyncConfig,
};

use std::sync::Arc;

use serde_json::json;

async fn stored_config(store: &dyn KvStore) -> SyncConfig {
	SyncConfig::from_slice(
		&store
			.get(SYNC_CONFIG_KEY)
			.await
			.expect("store is readable")
			.expect("configuration was written"),
	)
	.expect("stored configuration parses")
}

#[tokio::test]
async fn configuration_survives_a_restart() {
	let h = Harness::new().await;

	h.commands()
		.set_interval("members", 120)
		.await
		.expect("members exists");
	h.commands()
		.set_interval("mining", 0)
		.await
		.expect("mining exists");
	h.commands()
		.set_endpoint_version("income", "v3")
		.await
		.expect("v3 is supported by income");
	h.commands()
		.set_master_poller_interval(15)
		.await
		.expect("15 minutes is valid");
	h.commands()
		.set_master_poller_enabled(false)
		.await
		.expect("store is healthy");

	let reopened = h.reopen().await;

	assert_eq!(
		reopened.orchestrator.state().to_config().await,
		h.orchestrator.state().to_config().await
	);

	for process in Catalog::builtin().names() {
		let before = h.commands().endpoint(process).await.expect("process exists");
		let after = reopened
			.commands()
			.endpoint(process)
			.await
			.expect("process exists");
		assert_eq!(before.current_version(), after.current_version());
		assert_eq!(before.supported_versions(), after.supported_versions());

		let before = h.commands().status(process).expect("process exists");
		let after = reopened.commands().status(process).expect("process exists");
		assert_eq!(before.interval_minutes, after.interval_minutes);
		assert_eq!(before.enabled, after.enabled);
	}

	let master = reopened.commands().master_poller_status();
	assert!(!master.enabled);
	assert_eq!(master.interval_minutes, 15);
	assert_eq!(master.state, PollerState::Stopped);
}

#[tokio::test]
async fn version_changes_are_checked_against_the_catalog() {
	let h = Harness::new().await;

	for spec in Catalog::builtin().specs() {
		for version in &spec.supported_versions {
			h.commands()
				.set_endpoint_version(&spec.name, version)
				.await
				.expect("supported versions are accepted");
			assert_eq!(
				h.commands()
					.endpoint(&spec.name)
					.await
					.expect("process exists")
					.current_version(),
				version.as_str()
			);
		}

		let before = h.commands().endpoint(&spec.name).await.expect("process exists");
		let e = h
			.commands()
			.set_endpoint_version(&spec.name, "v99")
			.await
			.expect_err("v99 is never supported");
		assert_eq!(e.kind(), ErrorKind::UnsupportedVersion);
		assert_eq!(
			h.commands().endpoint(&spec.name).await.expect("process exists"),
			before
		);
	}

	let e = h
		.commands()
		.set_endpoint_version("wallet", "v1")
		.await
		.expect_err("wallet is not a process");
	assert_eq!(e.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn repeated_commands_write_once() {
	let store = RecordingStore::new();
	let h = Harness::with_store(store.clone()).await;
	// defaults written on first load
	assert_eq!(store.writes(), 1);

	for _ in 0..3 {
		h.commands()
			.set_interval("market", 30)
			.await
			.expect("market exists");
		h.commands()
			.set_endpoint_version("market", "v3")
			.await
			.expect("v3 is supported by market");
		h.commands()
			.set_master_poller_interval(10)
			.await
			.expect("10 minutes is valid");
		h.commands()
			.set_master_poller_enabled(true)
			.await
			.expect("store is healthy");
	}

	assert_eq!(store.writes(), 4);
	assert_eq!(
		stored_config(&*store).await,
		h.orchestrator.state().to_config().await
	);
}

#[tokio::test]
async fn failed_writes_leave_state_untouched() {
	let store = RecordingStore::new();
	let h = Harness::with_store(store.clone()).await;
	store.fail_writes(true);

	let e = h
		.commands()
		.set_interval("market", 30)
		.await
		.expect_err("store refuses writes");
	assert_eq!(e.kind(), ErrorKind::Persistence);
	assert_eq!(
		h.commands()
			.status("market")
			.expect("market exists")
			.interval_minutes,
		10
	);

	let e = h
		.commands()
		.set_endpoint_version("assets", "v3")
		.await
		.expect_err("store refuses writes");
	assert_eq!(e.kind(), ErrorKind::Persistence);
	assert_eq!(
		h.commands()
			.endpoint("assets")
			.await
			.expect("assets exists")
			.current_version(),
		"v5"
	);

	assert!(h.commands().set_master_poller_enabled(false).await.is_err());
	assert!(h.commands().master_poller_status().enabled);

	store.fail_writes(false);
	assert_eq!(
		stored_config(&*store).await,
		SyncConfig::defaults(&Catalog::builtin())
	);
}

#[tokio::test]
async fn reset_restores_defaults_and_keeps_history() {
	let h = Harness::new().await;
	h.tick().await.join_all().await;

	h.commands()
		.set_interval("assets", 0)
		.await
		.expect("assets exists");
	h.commands()
		.set_endpoint_version("members", "v3")
		.await
		.expect("v3 is supported by members");
	h.commands()
		.set_master_poller_interval(30)
		.await
		.expect("30 minutes is valid");

	h.commands()
		.reset_to_defaults()
		.await
		.expect("store is healthy");

	let defaults = SyncConfig::defaults(&Catalog::builtin());
	assert_eq!(h.orchestrator.state().to_config().await, defaults);
	assert_eq!(stored_config(&*h.store).await, defaults);

	let assets = h.commands().status("assets").expect("assets exists");
	assert!(assets.enabled);
	assert_eq!(assets.last_run_at, Some(start_time()));
	assert_eq!(assets.next_run_at, Some(minutes_after_start(60)));
	assert_eq!(h.commands().master_poller_status().interval_minutes, 5);
}

#[tokio::test]
async fn master_poller_interval_must_be_positive() {
	let h = Harness::new().await;

	let e = h
		.commands()
		.set_master_poller_interval(0)
		.await
		.expect_err("zero is not a valid master interval");
	assert_eq!(e.kind(), ErrorKind::InvalidArgument);
	assert_eq!(h.commands().master_poller_status().interval_minutes, 5);

	h.advance(2);
	h.commands()
		.set_master_poller_interval(20)
		.await
		.expect("20 minutes is valid");
	assert_eq!(
		h.commands().master_poller_status().next_tick_at,
		Some(minutes_after_start(22))
	);
}

#[tokio::test]
async fn v1_documents_are_migrated_on_load() {
	let store = Arc::new(MemoryStore::new());
	store
		.set(
			SYNC_CONFIG_KEY,
			serde_json::to_vec(&json!({
				"version": 1,
				"master_poller": { "enabled": true, "interval_minutes": 0 },
				"processes": {
					"market": { "enabled": false, "interval_minutes": 10, "current_version": "v3" },
					"assets": { "enabled": true, "interval_minutes": 45, "current_version": "v9" },
					"wallet": { "enabled": true, "interval_minutes": 5, "current_version": "v1" },
				}
			}))
			.expect("json value serializes"),
		)
		.await
		.expect("memory store never fails");

	let h = Harness::with_store(store.clone()).await;

	let market = h.commands().status("market").expect("market exists");
	assert!(!market.enabled);
	assert_eq!(
		h.commands()
			.endpoint("market")
			.await
			.expect("market exists")
			.current_version(),
		"v3"
	);

	// unsupported stored version falls back to the default one, the interval is kept
	assert_eq!(
		h.commands()
			.status("assets")
			.expect("assets exists")
			.interval_minutes,
		45
	);
	assert_eq!(
		h.commands()
			.endpoint("assets")
			.await
			.expect("assets exists")
			.current_version(),
		"v5"
	);

	assert!(h.commands().status("wallet").is_err());
	assert_eq!(h.commands().master_poller_status().interval_minutes, 5);

	let stored = stored_config(&*store).await;
	assert_eq!(stored, h.orchestrator.state().to_config().await);
	assert!(!stored.processes.contains_key("wallet"));
}

#[tokio::test]
async fn json_file_store_backs_the_orchestrator() {
	let dir = tempfile::tempdir().expect("temp dir");
	let store = Arc::new(JsonFileStore::new(dir.path()));

	let h = Harness::with_store(store.clone()).await;
	h.commands()
		.set_interval("manufacturing", 5)
		.await
		.expect("manufacturing exists");

	assert!(dir.path().join("sync_config.json").exists());

	let reopened = Harness::with_store(Arc::new(JsonFileStore::new(dir.path()))).await;
	assert_eq!(
		reopened
			.commands()
			.status("manufacturing")
			.expect("manufacturing exists")
			.interval_minutes,
		5
	);
}
