//! End-to-end sync between agents and an in-process central service.

use chrono::Utc;
use localmachine_engine::{
    AgentConfig, CycleOutcome, CycleReport, InMemoryMasterData, LocalExportService,
    LocalImportService, MasterDataSyncer, OnlineWebClient, StaticFacilityDirectory,
};
use localmachine_protocol::{endpoints, BusinessVersion, FacilityId};
use localmachine_server::{
    CompatibilityGate, InMemoryMasterDataSource, InMemorySnapshotStore, ServerConfig, WebServer,
};
use localmachine_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

fn cycle<C: OnlineWebClient>(agent: &TestAgent<C>) -> CycleReport {
    match agent.service.sync_cycle().expect("cycle failed") {
        CycleOutcome::Completed(report) => report,
        CycleOutcome::Skipped => panic!("cycle was skipped"),
    }
}

#[test]
fn events_and_acks_flow_between_facilities() {
    let network = TestNetwork::new();
    let (a, b) = (network.agent(), network.agent());
    let sent: Vec<_> = (0..3).map(|_| a.emit(b.home(), "ORDER", 64)).collect();

    let report = cycle(&a);
    assert_eq!(report.pushed, 3);
    assert_eq!(a.status().pending_push, 0);
    assert_eq!(network.server.log().len(), 3);

    let report = cycle(&b);
    assert!(report.pull.is_completed());
    assert_eq!(report.replay.replayed, 3);
    assert_eq!(report.acks_sent, 3);
    assert_eq!(
        b.replays.replayed(),
        sent.iter().map(|e| e.id).collect::<Vec<_>>()
    );
    assert_eq!(b.status().unshipped_acks, 0);
    assert!(b.status().last_synced_time.is_some());

    assert_eq!(a.status().pending_export, 3);
    let report = cycle(&a);
    assert_eq!(report.acks_received, 3);
    assert_eq!(a.status().pending_export, 0);
    assert!(network.server.log().acks_for(a.home()).is_empty());

    // Nothing left to move.
    let report = cycle(&b);
    assert_eq!(report.replay.replayed, 0);
    assert_eq!(b.replays.replayed().len(), 3);
}

#[test]
fn failed_replay_is_retried_next_cycle() {
    let network = TestNetwork::new();
    let (a, b) = (network.agent(), network.agent());
    let event = a.emit(b.home(), "SHIPMENT", 16);
    cycle(&a);

    b.replays.fail_category("SHIPMENT");
    let report = cycle(&b);
    assert_eq!(report.replay.failed, 1);
    assert_eq!(b.status().pending_replay, 1);

    b.replays.recover("SHIPMENT");
    let report = cycle(&b);
    assert_eq!(report.replay.replayed, 1);
    assert_eq!(b.status().pending_replay, 0);
    assert_eq!(b.replays.count_of(&event.id), 1);
}

#[test]
fn small_network_capacity_splits_pushes() {
    let network = TestNetwork::new();
    let a = network.agent_with(|c| c.with_network_capacity(2_500));
    let b = network.agent();
    for _ in 0..5 {
        a.emit(b.home(), "ORDER", 1_000);
    }

    let report = cycle(&a);
    assert_eq!(report.pushed, 5);
    assert_eq!(network.server.log().len(), 5);

    cycle(&b);
    assert_eq!(b.replays.replayed().len(), 5);
}

#[test]
fn old_agents_do_not_receive_gated_categories() {
    let gate = CompatibilityGate::new().suppress_below("STOCK_MOVED", BusinessVersion::new(2, 0, 0));
    let network = TestNetwork::with_server(WebServer::with_parts(
        ServerConfig::new().with_public_url(CENTRAL_URL),
        Arc::new(gate),
        Arc::new(InMemoryMasterDataSource::new()),
        Arc::new(InMemorySnapshotStore::new()),
    ));
    let a = network.agent();
    let old = network.agent_with(|c| c.with_agent_version(BusinessVersion::new(1, 4, 0)));
    let new = network.agent_with(|c| c.with_agent_version(BusinessVersion::new(2, 1, 0)));

    let order = a.emit(old.home(), "ORDER", 8);
    a.emit(old.home(), "STOCK_MOVED", 8);
    let moved = a.emit(new.home(), "STOCK_MOVED", 8);
    cycle(&a);

    cycle(&old);
    cycle(&new);
    assert_eq!(old.replays.replayed(), vec![order.id]);
    assert_eq!(new.replays.replayed(), vec![moved.id]);
}

#[test]
fn archive_carries_events_to_an_offline_facility() {
    let network = TestNetwork::new();
    let (a, b) = (network.agent(), network.agent());
    let event = a.emit(b.home(), "ORDER", 32);

    let directory = StaticFacilityDirectory::new()
        .with_facility(a.home(), "HC01", "Health Centre 1")
        .with_facility(b.home(), "DH02", "District Hospital 2");
    let export = LocalExportService::new(a.store().clone(), Arc::new(directory), 1 << 20);
    let archive = export.export(Utc::now()).unwrap().unwrap();
    assert_eq!(archive.event_count, 1);
    assert!(archive.files[0].starts_with("DH02_HC01_"));

    let import = LocalImportService::new(
        b.store().clone(),
        b.service.errors().clone(),
        b.service.importer().clone(),
    );
    let summary = import
        .import_archive(&archive.bytes, b.service.replay_context())
        .unwrap();
    assert_eq!(summary.replayed, 1);

    // Both sides come online later; nothing is replayed twice.
    cycle(&a);
    cycle(&b);
    cycle(&a);
    assert_eq!(b.replays.count_of(&event.id), 1);
    assert_eq!(a.status().pending_export, 0);
    assert_eq!(b.status().pending_push, 0);
}

#[test]
fn master_data_resync_and_catch_up() {
    let source = Arc::new(InMemoryMasterDataSource::new());
    source.set_table("products.csv", b"id,name\n1,ORS\n".to_vec());
    let network = TestNetwork::with_server(WebServer::with_parts(
        ServerConfig::new().with_public_url(CENTRAL_URL),
        Arc::new(CompatibilityGate::new()),
        source,
        Arc::new(InMemorySnapshotStore::new()),
    ));
    let central = network.server.master_data();
    central.create_snapshot(Utc::now()).unwrap();
    central.record_change("products.csv", b"2,Zinc".to_vec());
    central.record_change("products.csv", b"3,Amoxicillin".to_vec());

    let home = FacilityId::new();
    let tables = Arc::new(InMemoryMasterData::new());
    let syncer = MasterDataSyncer::new(
        AgentConfig::new(home, CENTRAL_URL).with_delta_page_limit(1),
        network.client(),
        tables.clone(),
    );

    let report = syncer.resync().unwrap();
    assert_eq!(report.deltas_applied, 2);
    assert_eq!(tables.table("products.csv").unwrap(), b"id,name\n1,ORS\n");
    assert_eq!(tables.version(), central.latest_snapshot().map(|s| s.version));

    let latest = central.record_change("products.csv", b"4,Paracetamol".to_vec());
    let report = syncer.catch_up().unwrap();
    assert_eq!(report.deltas_applied, 1);
    assert_eq!(report.offset, Some(latest));
    assert_eq!(central.offset(home).unwrap().record_offset, latest);
    assert_eq!(tables.deltas().len(), 3);
}

#[test]
fn master_data_file_then_online_catch_up() {
    let source = Arc::new(InMemoryMasterDataSource::new());
    source.set_table("products.csv", b"id,name\n1,ORS\n".to_vec());
    let network = TestNetwork::with_server(WebServer::with_parts(
        ServerConfig::new().with_public_url(CENTRAL_URL),
        Arc::new(CompatibilityGate::new()),
        source,
        Arc::new(InMemorySnapshotStore::new()),
    ));
    let central = network.server.master_data();
    central.create_snapshot(Utc::now()).unwrap();
    central.record_change("products.csv", b"2,Zinc".to_vec());

    let home = FacilityId::new();
    let response = network
        .server
        .route_get(&format!("{}{home}", endpoints::MASTER_DATA_EXPORT));
    assert!(response.is_success());

    let tables = Arc::new(InMemoryMasterData::new());
    let syncer = MasterDataSyncer::new(
        AgentConfig::new(home, CENTRAL_URL),
        network.client(),
        tables.clone(),
    );
    let report = syncer.import_snapshot_file(&response.body).unwrap();
    assert_eq!(report.deltas_applied, 1);
    assert_eq!(tables.version(), central.latest_snapshot().map(|s| s.version));

    let latest = central.record_change("products.csv", b"3,Amoxicillin".to_vec());
    let report = syncer.catch_up().unwrap();
    assert_eq!(report.deltas_applied, 1);
    assert_eq!(report.offset, Some(latest));
    assert_eq!(tables.deltas().len(), 2);
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn every_event_reaches_its_receiver_once(
        routes in prop::collection::vec(
            (any::<bool>(), prop::sample::select(TEST_CATEGORIES), 0usize..256),
            0..12,
        )
    ) {
        let network = TestNetwork::new();
        let fixed = |n| FacilityId::from_uuid(Uuid::from_u128(n));
        let a = network.agent_with(|cfg| AgentConfig { home_facility: fixed(1), ..cfg });
        let b = network.agent_with(|cfg| AgentConfig { home_facility: fixed(2), ..cfg });
        let c = network.agent_with(|cfg| AgentConfig { home_facility: fixed(3), ..cfg });

        let mut to_b = Vec::new();
        let mut to_c = Vec::new();
        for (for_b, category, size) in &routes {
            let receiver = if *for_b { b.home() } else { c.home() };
            let event = a.emit(receiver, category, *size);
            if *for_b { to_b.push(event.id) } else { to_c.push(event.id) }
        }

        cycle(&a);
        cycle(&b);
        cycle(&c);
        cycle(&b);

        prop_assert_eq!(b.replays.replayed(), to_b);
        prop_assert_eq!(c.replays.replayed(), to_c);
        prop_assert_eq!(a.status().pending_push, 0);
    }
}
