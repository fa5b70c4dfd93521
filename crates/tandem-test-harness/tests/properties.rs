//! Properties that must hold for the pair across failovers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_failover::{DatasetKey, Forwarded, KeyFormat};
use tandem_journal::JournalEntry;
use tandem_peer::Session;
use tandem_target::{EndpointState, FailoverMode, PathState, Rediscovery, TargetEndpoint};
use tandem_test_harness::targets::{iscsi_lun, nvme_namespace};
use tandem_test_harness::{HaPair, Initiator, wait_until};
use tandem_types::{
    DisabledReason, DisabledReasons, HaStatus, JournalGeneration, KeyEntry, KeyUpdate, NodeSlot,
    ServiceOptions, ServiceVerb, SqlParam, WriteSequence,
};
use proptest::prelude::*;
use test_case::test_case;

const DRAIN: Duration = Duration::from_secs(10);

fn assert_single_master(pair: &HaPair, expected: NodeSlot) {
    let statuses = pair.statuses();
    let masters: Vec<_> = statuses
        .iter()
        .filter(|(_, s)| **s == HaStatus::Master)
        .collect();
    assert_eq!(masters.len(), 1, "statuses: {statuses:?}");
    assert_eq!(*masters[0].0, expected);
    for (slot, status) in &statuses {
        if *slot != expected {
            assert_eq!(*status, HaStatus::Backup, "controller {slot}");
        }
    }
}

// ============================================================================
// Roles
// ============================================================================

#[test]
fn test_single_master_after_every_failover() {
    let pair = HaPair::start().unwrap();
    assert_single_master(&pair, NodeSlot::A);

    pair.orderly_failover().unwrap();
    assert_single_master(&pair, NodeSlot::B);

    pair.orderly_failover().unwrap();
    assert_single_master(&pair, NodeSlot::A);

    pair.crash_failover().unwrap();
    assert_single_master(&pair, NodeSlot::B);

    pair.restart(NodeSlot::A).unwrap();
    pair.settle();
    assert_single_master(&pair, NodeSlot::B);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_single_master_over_failover_sequences(
        crashes in prop::collection::vec(any::<bool>(), 1..5)
    ) {
        let pair = HaPair::start().unwrap();
        let mut master = NodeSlot::A;
        for crash in crashes {
            let previous = master;
            if crash {
                master = pair.crash_failover().unwrap();
                pair.restart(previous).unwrap();
                pair.settle();
            } else {
                master = pair.orderly_failover().unwrap();
            }
            prop_assert_ne!(master, previous);
            assert_single_master(&pair, master);
        }
    }
}

#[test]
fn test_unelected_pair_has_no_master() {
    let pair = HaPair::builder().unelected().start().unwrap();
    assert_eq!(pair.master(), None);
}

// ============================================================================
// Journal
// ============================================================================

#[test]
fn test_journal_delivers_after_link_returns() {
    let pair = HaPair::start().unwrap();
    let master = pair.node(NodeSlot::A).unwrap();
    let standby = pair.node(NodeSlot::B).unwrap();

    pair.set_link(false);
    master.store.set_value("ntp.server", "pool.ntp.org").unwrap();
    master.store.set_value("ntp.server", "time.example.net").unwrap();
    assert!(wait_until(DRAIN, || master.pending_journal() == 2));
    assert_eq!(standby.store.value("ntp.server").unwrap(), None);

    pair.set_link(true);
    assert!(wait_until(DRAIN, || {
        standby.store.value("ntp.server").unwrap().as_deref() == Some("time.example.net")
    }));
    assert!(wait_until(DRAIN, || master.pending_journal() == 0));
}

#[test]
fn test_journal_write_survives_master_crash() {
    let pair = HaPair::start().unwrap();
    pair.set_link(false);
    let master = pair.node(NodeSlot::A).unwrap();
    master.store.set_value("motd", "before the crash").unwrap();

    // Stopping the worker drains the queue into the journal file.
    pair.crash(NodeSlot::A).unwrap();
    assert_eq!(master.pending_journal(), 1);
    drop(master);

    pair.set_link(true);
    pair.restart(NodeSlot::A).unwrap();
    let standby = pair.node(NodeSlot::B).unwrap();
    assert!(wait_until(DRAIN, || {
        standby.store.value("motd").unwrap().as_deref() == Some("before the crash")
    }));
}

#[test]
fn test_replayed_entry_applies_once() {
    let pair = HaPair::start().unwrap();
    let standby = pair.node(NodeSlot::B).unwrap();
    let entry = JournalEntry {
        generation: JournalGeneration::mint(),
        sequence: WriteSequence::new(1),
        sql: "INSERT INTO system_keyvalue (key, value) VALUES (?1, ?2)".to_string(),
        params: vec![SqlParam::from("hostname"), SqlParam::from("tandem-a")],
    };

    standby.service.apply_replicated_write(&entry).unwrap();
    // A second INSERT of the same key would violate the primary key.
    standby.service.apply_replicated_write(&entry).unwrap();
    assert_eq!(
        standby.store.value("hostname").unwrap().as_deref(),
        Some("tandem-a")
    );
}

// ============================================================================
// Keys
// ============================================================================

#[test]
fn test_unlocked_key_reaches_standby_and_survives_takeover() {
    let pair = HaPair::start().unwrap();
    let master = pair.node(NodeSlot::A).unwrap();
    master
        .service
        .on_dataset_unlock(&[
            DatasetKey {
                name: "tank/secure".to_string(),
                key_format: KeyFormat::Passphrase,
                key: Some("correct horse".to_string()),
            },
            DatasetKey {
                name: "tank/raw".to_string(),
                key_format: KeyFormat::Raw,
                key: Some("00ff".to_string()),
            },
        ])
        .unwrap();

    let standby = pair.node(NodeSlot::B).unwrap();
    let keys = standby.service.encryption_keys();
    assert_eq!(
        keys.zfs.get("tank/secure").map(String::as_str),
        Some("correct horse")
    );
    assert!(!keys.zfs.contains_key("tank/raw"));
    assert_eq!(keys, master.service.encryption_keys());
    drop(master);

    pair.crash_failover().unwrap();
    assert!(
        standby
            .controller
            .state()
            .unlocked
            .contains(&"tank/secure".to_string())
    );
}

#[test]
fn test_key_update_twice_equals_once() {
    let pair = HaPair::start().unwrap();
    let master = pair.node(NodeSlot::A).unwrap();
    let update = KeyUpdate {
        pools: vec![KeyEntry::new("legacy", "geli-pass")],
        datasets: vec![KeyEntry::new("tank/home", "home-pass")],
        sync_keys: true,
    };

    master.service.update_encryption_keys(update.clone()).unwrap();
    let once = master.service.encryption_keys();
    master.service.update_encryption_keys(update).unwrap();
    assert_eq!(master.service.encryption_keys(), once);
    assert_eq!(pair.node(NodeSlot::B).unwrap().service.encryption_keys(), once);
}

// ============================================================================
// Targets
// ============================================================================

fn endpoints(mode: FailoverMode, count: u32) -> Vec<TargetEndpoint> {
    (1..=count).map(|nsid| nvme_namespace(1, nsid, mode)).collect()
}

#[test_case(FailoverMode::AluaAna, false, 1; "ana orderly one namespace")]
#[test_case(FailoverMode::AluaAna, false, 3; "ana orderly three namespaces")]
#[test_case(FailoverMode::AluaAna, true, 1; "ana crash one namespace")]
#[test_case(FailoverMode::AluaAna, true, 3; "ana crash three namespaces")]
#[test_case(FailoverMode::Vip, false, 1; "vip orderly one namespace")]
#[test_case(FailoverMode::Vip, false, 3; "vip orderly three namespaces")]
#[test_case(FailoverMode::Vip, true, 1; "vip crash one namespace")]
#[test_case(FailoverMode::Vip, true, 3; "vip crash three namespaces")]
fn test_failover_keeps_identity_within_budget(mode: FailoverMode, crash: bool, count: u32) {
    let budget = Duration::from_secs(60);
    let pair = HaPair::builder().failover_budget(budget).start().unwrap();
    let endpoints = endpoints(mode, count);
    for endpoint in &endpoints {
        pair.create_endpoint(endpoint.clone()).unwrap();
    }
    let initiator = Initiator::new(pair.clone());
    let before: Vec<_> = endpoints
        .iter()
        .map(|e| initiator.identity(&e.name).unwrap())
        .collect();

    let start = Instant::now();
    if crash {
        pair.crash_failover().unwrap();
    } else {
        pair.orderly_failover().unwrap();
    }
    for (endpoint, identity) in endpoints.iter().zip(before) {
        let waited = initiator.wait_for_io(&endpoint.name, budget).unwrap();
        assert!(waited <= budget);
        assert_eq!(initiator.identity(&endpoint.name).unwrap(), identity);
        assert_eq!(identity, endpoint.identity);
    }
    assert!(start.elapsed() <= budget);
}

#[test]
fn test_mixed_failover_modes() {
    let pair = HaPair::start().unwrap();
    let lun = iscsi_lun(1, 0, FailoverMode::AluaAna);
    let ns = nvme_namespace(2, 1, FailoverMode::Vip);
    pair.create_endpoint(lun.clone()).unwrap();
    pair.create_endpoint(ns.clone()).unwrap();

    let standby = pair.node(NodeSlot::B).unwrap();
    assert_eq!(
        standby.service.targets().state(&lun.name),
        Some(EndpointState::Path(PathState::NonOptimized))
    );
    assert_eq!(
        standby.service.targets().state(&ns.name),
        Some(EndpointState::NotAdvertised)
    );

    pair.orderly_failover().unwrap();
    let initiator = Initiator::new(pair.clone());
    let lun_path = initiator.path(&lun.name).unwrap();
    let ns_path = initiator.path(&ns.name).unwrap();
    assert_eq!(lun_path.slot, NodeSlot::B);
    assert_eq!(lun_path.state, EndpointState::Path(PathState::Optimized));
    assert_eq!(ns_path.slot, NodeSlot::B);
    assert_eq!(ns_path.state, EndpointState::Advertised);
}

#[test_case(Rediscovery::AsyncEvent, 1; "async event notifies initiators")]
#[test_case(Rediscovery::TearDown, 0; "teardown drops sessions instead")]
fn test_rediscovery_on_takeover(rediscovery: Rediscovery, notifications: u32) {
    let pair = HaPair::builder()
        .rediscovery(rediscovery)
        .start()
        .unwrap();
    let ns = nvme_namespace(1, 1, FailoverMode::AluaAna);
    pair.create_endpoint(ns.clone()).unwrap();
    let standby = pair.node(NodeSlot::B).unwrap();
    standby.targets.login(&ns.name, "host-nonoptimized");

    pair.orderly_failover().unwrap();
    assert_eq!(standby.targets.notifications(&ns.name), notifications);
    assert_eq!(
        standby.targets.state().sessions.contains_key(&ns.name),
        rediscovery == Rediscovery::AsyncEvent
    );
}

// ============================================================================
// Service forwarding
// ============================================================================

fn invocations(pair: &Arc<HaPair>, slot: NodeSlot, service: &str) -> usize {
    pair.node(slot)
        .unwrap()
        .controller
        .invocations()
        .iter()
        .filter(|(verb, name)| *verb == ServiceVerb::Start && name == service)
        .count()
}

#[test_case("smb", Forwarded::Sent, 1; "mirrored")]
#[test_case("smartd", Forwarded::Skipped, 0; "blocklisted")]
fn test_service_start_on_master(service: &str, forwarded: Forwarded, on_standby: usize) {
    let pair = HaPair::start().unwrap();
    let master = pair.node(NodeSlot::A).unwrap();
    let outcome = master
        .service
        .service_control(ServiceVerb::Start, service, ServiceOptions::default())
        .unwrap();

    assert_eq!(outcome, forwarded);
    assert_eq!(invocations(&pair, NodeSlot::A, service), 1);
    assert_eq!(invocations(&pair, NodeSlot::B, service), on_standby);
}

#[test]
fn test_service_start_on_standby_stays_local() {
    let pair = HaPair::start().unwrap();
    let standby = pair.node(NodeSlot::B).unwrap();
    let outcome = standby
        .service
        .service_control(ServiceVerb::Start, "smb", ServiceOptions::default())
        .unwrap();
    assert_eq!(outcome, Forwarded::Skipped);
    assert_eq!(invocations(&pair, NodeSlot::A, "smb"), 0);
}

// ============================================================================
// Disabled reasons
// ============================================================================

fn reasons_on(pair: &HaPair, slot: NodeSlot) -> DisabledReasons {
    pair.settle();
    pair.node(slot)
        .unwrap()
        .service
        .disabled_reasons(&Session::local())
}

#[test]
fn test_reasons_follow_conditions() {
    let pair = HaPair::start().unwrap();
    let shelf = pair.shelf().clone();
    assert!(reasons_on(&pair, NodeSlot::A).is_empty());

    shelf.update_chassis(NodeSlot::A, |c| c.critical = false);
    assert!(reasons_on(&pair, NodeSlot::A).contains(DisabledReason::NoCriticalInterfaces));
    shelf.update_chassis(NodeSlot::A, |c| c.critical = true);
    assert!(!reasons_on(&pair, NodeSlot::A).contains(DisabledReason::NoCriticalInterfaces));

    pair.set_link(false);
    assert!(reasons_on(&pair, NodeSlot::A).contains(DisabledReason::NoPong));
    pair.set_link(true);
    assert!(!reasons_on(&pair, NodeSlot::A).contains(DisabledReason::NoPong));

    shelf.update_chassis(NodeSlot::B, |c| c.licensed = false);
    assert!(reasons_on(&pair, NodeSlot::A).contains(DisabledReason::NoLicense));
    shelf.update_chassis(NodeSlot::B, |c| c.licensed = true);
    assert!(reasons_on(&pair, NodeSlot::A).is_empty());
}

#[test]
fn test_mismatched_disks_block_takeover() {
    let pair = HaPair::start().unwrap();
    pair.shelf().update_chassis(NodeSlot::B, |c| {
        c.disk_serials.pop();
    });
    assert!(reasons_on(&pair, NodeSlot::A).contains(DisabledReason::MismatchDisks));

    let err = pair.orderly_failover().unwrap_err();
    assert!(err.to_string().contains("takeover did not happen"), "{err}");
}
