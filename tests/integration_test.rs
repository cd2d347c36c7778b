//! Integration tests: reconciliation across restarts over the encrypted
//! SQLite store, and the capture pipeline end to end.

use chrono::Utc;
use std::sync::Arc;
use tracekeep_agent::{
    collectors::{
        ChannelProcessor, EventCollector, Normalizer, RawRecord, SubscriptionState, TraceSession,
        UserDataBuilder, KERNEL_NETWORK_PROVIDER, POWERSHELL_PROVIDER,
    },
    config::{
        codec, AgentSettings, CliOverrides, HostPaths, Origin, Reconciler, TrackingOption,
        CURRENT_SCHEMA_VERSION,
    },
    logging::LogHandle,
    storage::{BlobKey, BlobStore, SqliteBlobStore},
};

fn key() -> BlobKey {
    AgentSettings::default().blob_key
}

fn host(base: &std::path::Path) -> HostPaths {
    HostPaths {
        secure_base: Some(base.to_path_buf()),
        system_root: base.to_path_buf(),
    }
}

#[test]
fn reconcile_survives_restart_over_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("store.db");

    let first = {
        let store = SqliteBlobStore::open(&db, b"entropy").unwrap();
        let mut overrides = CliOverrides::service();
        overrides.collection_service = Some("tk-first".into());
        overrides.image_load_tracking = Some(true);
        Reconciler::new(&store, key(), host(dir.path()), LogHandle::disabled())
            .reconcile(&overrides)
            .unwrap()
    };
    assert_eq!(first.origin, Origin::Bootstrapped);

    let store = SqliteBlobStore::open(&db, b"entropy").unwrap();
    let mut overrides = CliOverrides::default();
    overrides.collection_service = Some("tk-second".into());
    let second = Reconciler::new(&store, key(), host(dir.path()), LogHandle::disabled())
        .reconcile(&overrides)
        .unwrap();

    let c = &second.config;
    assert_eq!(second.origin, Origin::Reconciled);
    assert_eq!(c.collection_service.current, "tk-second");
    assert_eq!(c.collection_service.previous, "tk-first");
    assert!(c.is_new_collection_service());
    assert!(c.options.current.contains(TrackingOption::ImageLoad));
    assert_eq!(c.working_directory, first.config.working_directory);

    let saved = codec::decode(&store.load(&key()).unwrap()).unwrap();
    assert_eq!(saved.version, CURRENT_SCHEMA_VERSION);
    assert_eq!(saved, second.record);
}

#[test]
fn wrong_entropy_bootstraps_again() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("store.db");
    let store = SqliteBlobStore::open(&db, b"one").unwrap();
    Reconciler::new(&store, key(), host(dir.path()), LogHandle::disabled())
        .reconcile(&CliOverrides::default())
        .unwrap();
    drop(store);

    let other = SqliteBlobStore::open(&db, b"two").unwrap();
    let out = Reconciler::new(&other, key(), host(dir.path()), LogHandle::disabled())
        .reconcile(&CliOverrides::default())
        .unwrap();
    assert_eq!(out.origin, Origin::Bootstrapped);
}

fn record(provider: &str, event_id: u16, user_data: Vec<u8>) -> RawRecord {
    RawRecord {
        provider: provider.into(),
        event_id,
        opcode: 0,
        process_id: 640,
        thread_id: 2,
        timestamp: Utc::now(),
        user_data,
    }
}

#[test]
fn capture_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store = tracekeep_agent::storage::MemoryBlobStore::new();
    let config = Reconciler::new(&store, key(), host(dir.path()), LogHandle::disabled())
        .reconcile(&CliOverrides::default())
        .unwrap()
        .config;
    assert!(!config.network_tracking());

    let normalizer = Arc::new(Normalizer::for_config(&config));
    assert_eq!(normalizer.table().providers(), vec![POWERSHELL_PROVIDER]);

    let (processor, mut rx) = ChannelProcessor::channel();
    let processor = Arc::new(processor);
    let mut session = TraceSession::start("e2e", LogHandle::disabled()).unwrap();
    let mut collector = EventCollector::new(
        POWERSHELL_PROVIDER,
        Arc::clone(&normalizer),
        processor,
        LogHandle::disabled(),
    );
    collector.start(&mut session).unwrap();

    let feeder = session.feeder();
    let script = UserDataBuilder::new()
        .u32(1)
        .u32(1)
        .utf16("Invoke-WebRequest http://example.invalid")
        .utf16("{0001}")
        .utf16("")
        .build();
    feeder.push(record(POWERSHELL_PROVIDER, 4104, script)).unwrap();
    feeder.push(record(POWERSHELL_PROVIDER, 4104, vec![0xff])).unwrap();
    feeder.push(record(POWERSHELL_PROVIDER, 40961, Vec::new())).unwrap();
    // Network tracking is off, so this provider has no subscriber.
    feeder.push(record(KERNEL_NETWORK_PROVIDER, 12, Vec::new())).unwrap();

    collector.stop(&session);
    session.stop();
    assert_eq!(collector.state(), SubscriptionState::Closed);

    let first = rx.try_recv().unwrap();
    assert_eq!(first.event_id, 1001);
    assert_eq!(first.free_text, "Invoke-WebRequest http://example.invalid");
    assert_eq!(first.provider_name, POWERSHELL_PROVIDER);
    let second = rx.try_recv().unwrap();
    assert!(second.free_text.is_empty());
    assert_eq!(second.process_id, 640);
    assert!(rx.try_recv().is_err());

    let stats = collector.stats();
    assert_eq!((stats.dispatched, stats.dropped, stats.failed), (2, 1, 0));
}

#[test]
fn replay_lines_parse_as_raw_records() {
    let line = r#"{"provider":"Microsoft-Windows-PowerShell","event_id":4104,"process_id":9,"timestamp":"2024-01-01T00:00:00Z","user_data":"AQAAAA=="}"#;
    let rec: RawRecord = serde_json::from_str(line).unwrap();
    assert_eq!(rec.event_id, 4104);
    assert_eq!(rec.opcode, 0);
    assert_eq!(rec.user_data, vec![1, 0, 0, 0]);
}
