//! End-to-end failover scenarios against the in-process HA pair.
//!
//! Each test boots two controllers with A as MASTER, exports endpoints,
//! drives I/O through an initiator and fails over.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tandem_failover::{DatasetKey, KeyFormat};
use tandem_target::{EndpointState, FailoverMode, PathState};
use tandem_test_harness::targets::nvme_namespace;
use tandem_test_harness::{HaPair, Initiator, wait_until};
use tandem_types::{HaStatus, NodeSlot};

const IO_TIMEOUT: Duration = Duration::from_secs(60);

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn pair_with_namespaces(subsystem: u32, count: u32, mode: FailoverMode) -> Arc<HaPair> {
    init_logging();
    let pair = HaPair::start().unwrap();
    for nsid in 1..=count {
        pair.create_endpoint(nvme_namespace(subsystem, nsid, mode))
            .unwrap();
    }
    pair
}

// ============================================================================
// ANA
// ============================================================================

#[test]
fn test_ana_orderly_failover_idle() {
    let pair = pair_with_namespaces(1, 1, FailoverMode::AluaAna);
    let initiator = Initiator::new(pair.clone());
    let pattern = b"ORDERLY_ANA_PATTERN_0001".to_vec();

    let before = initiator.path("subsys1-ns1").unwrap();
    assert_eq!(before.slot, NodeSlot::A);
    assert_eq!(before.state, EndpointState::Path(PathState::Optimized));
    initiator.write("subsys1-ns1", 0, &pattern).unwrap();

    assert_eq!(pair.orderly_failover().unwrap(), NodeSlot::B);
    initiator.wait_for_io("subsys1-ns1", IO_TIMEOUT).unwrap();

    let after = initiator.path("subsys1-ns1").unwrap();
    assert_eq!(after.slot, NodeSlot::B);
    assert_eq!(after.state, EndpointState::Path(PathState::Optimized));
    let old = pair.node(NodeSlot::A).unwrap();
    assert_eq!(
        old.service.targets().state("subsys1-ns1"),
        Some(EndpointState::Path(PathState::Inaccessible))
    );
    assert_eq!(initiator.read("subsys1-ns1", 0).unwrap(), pattern);
}

#[test]
fn test_ana_crash_failover_with_active_io() {
    let pair = pair_with_namespaces(1, 3, FailoverMode::AluaAna);
    let initiator = Arc::new(Initiator::new(pair.clone()));
    let stop = Arc::new(AtomicBool::new(false));
    let served_by_survivor = Arc::new(AtomicUsize::new(0));

    let writer = {
        let (initiator, stop, served) = (
            initiator.clone(),
            stop.clone(),
            served_by_survivor.clone(),
        );
        thread::spawn(move || {
            let mut nsid = 1;
            while !stop.load(Ordering::SeqCst) {
                let name = format!("subsys1-ns{nsid}");
                if initiator.write(&name, 0, b"IOWORKER") == Ok(NodeSlot::B) {
                    served.fetch_add(1, Ordering::SeqCst);
                }
                nsid = nsid % 3 + 1;
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert_eq!(served_by_survivor.load(Ordering::SeqCst), 0);
    assert_eq!(pair.crash_failover().unwrap(), NodeSlot::B);

    assert!(
        wait_until(IO_TIMEOUT, || served_by_survivor.load(Ordering::SeqCst) >= 3),
        "writer made no progress after the crash"
    );
    stop.store(true, Ordering::SeqCst);
    writer.join().unwrap();

    for nsid in 1..=3 {
        let data = initiator.read(&format!("subsys1-ns{nsid}"), 0).unwrap();
        assert!(data.starts_with(b"IOWORKER"), "namespace {nsid} lost data");
    }
    assert_eq!(pair.master(), Some(NodeSlot::B));
}

// ============================================================================
// VIP
// ============================================================================

#[test]
fn test_vip_orderly_failover_idle() {
    let pair = pair_with_namespaces(1, 1, FailoverMode::Vip);
    let initiator = Initiator::new(pair.clone());
    assert_eq!(initiator.path("subsys1-ns1").unwrap().slot, NodeSlot::A);

    pair.orderly_failover().unwrap();
    initiator.wait_for_io("subsys1-ns1", IO_TIMEOUT).unwrap();

    assert_eq!(initiator.write("subsys1-ns1", 0, b"testdata").unwrap(), NodeSlot::B);
    assert_eq!(initiator.read("subsys1-ns1", 0).unwrap(), b"testdata");
    assert_eq!(pair.shelf().lock().vip_owner, Some(NodeSlot::B));
    let old = pair.node(NodeSlot::A).unwrap();
    assert!(old.targets.state().advertised.is_empty());
}

// ============================================================================
// Scale
// ============================================================================

#[test]
fn test_scale_crash_failover() {
    init_logging();
    let pair = HaPair::start().unwrap();
    let mut names = Vec::new();
    for subsystem in 1..=50 {
        let ns = nvme_namespace(subsystem, 1, FailoverMode::AluaAna);
        names.push((ns.name.clone(), ns.identity.portal.clone()));
        pair.create_endpoint(ns).unwrap();
    }
    for nsid in 1..=20 {
        let ns = nvme_namespace(51, nsid, FailoverMode::AluaAna);
        names.push((ns.name.clone(), ns.identity.portal.clone()));
        pair.create_endpoint(ns).unwrap();
    }
    assert_eq!(names.len(), 70);

    let initiator = Initiator::new(pair.clone());
    let pattern = |name: &str, nqn: &str| format!("SCALE_TEST_{name}_{nqn}").into_bytes();
    for (name, nqn) in &names {
        initiator.write(name, 0, &pattern(name, nqn)).unwrap();
    }

    let trigger = Instant::now();
    assert_eq!(pair.crash_failover().unwrap(), NodeSlot::B);
    for (name, _) in &names {
        initiator
            .wait_for_io(name, IO_TIMEOUT)
            .unwrap_or_else(|| panic!("{name} never came back"));
    }
    let elapsed = trigger.elapsed();
    assert!(elapsed <= IO_TIMEOUT, "failover took {elapsed:?}");

    for (name, nqn) in &names {
        assert_eq!(initiator.read(name, 0).unwrap(), pattern(name, nqn));
    }
}

// ============================================================================
// Failback
// ============================================================================

#[test]
fn test_failover_then_failback() {
    let pair = pair_with_namespaces(1, 1, FailoverMode::AluaAna);
    let initiator = Initiator::new(pair.clone());
    let pattern = b"FAILBACK_TEST_INITIAL".to_vec();
    initiator.write("subsys1-ns1", 7, &pattern).unwrap();

    pair.crash_failover().unwrap();
    initiator.wait_for_io("subsys1-ns1", IO_TIMEOUT).unwrap();
    assert_eq!(initiator.path("subsys1-ns1").unwrap().slot, NodeSlot::B);
    assert_eq!(initiator.read("subsys1-ns1", 7).unwrap(), pattern);

    pair.restart(NodeSlot::A).unwrap();
    pair.settle();
    assert_eq!(
        pair.node(NodeSlot::A).unwrap().service.current_status(),
        HaStatus::Backup
    );

    assert_eq!(pair.orderly_failover().unwrap(), NodeSlot::A);
    initiator.wait_for_io("subsys1-ns1", IO_TIMEOUT).unwrap();
    assert_eq!(initiator.path("subsys1-ns1").unwrap().slot, NodeSlot::A);
    assert_eq!(initiator.read("subsys1-ns1", 7).unwrap(), pattern);
}

// ============================================================================
// Keys
// ============================================================================

#[test]
fn test_rebooted_standby_recovers_key_cache() {
    init_logging();
    let pair = HaPair::start().unwrap();
    let master = pair.node(NodeSlot::A).unwrap();
    master
        .service
        .on_dataset_unlock(&[DatasetKey {
            name: "tank/secret".into(),
            key_format: KeyFormat::Passphrase,
            key: Some("hunter22".into()),
        }])
        .unwrap();
    let cached = master.service.encryption_keys();
    assert_eq!(cached.zfs.get("tank/secret").map(String::as_str), Some("hunter22"));
    assert_eq!(pair.node(NodeSlot::B).unwrap().service.encryption_keys(), cached);

    pair.crash(NodeSlot::B).unwrap();
    let standby = pair.restart(NodeSlot::B).unwrap();
    assert_eq!(standby.service.current_status(), HaStatus::Backup);
    assert_eq!(standby.service.encryption_keys(), cached);
}

// ============================================================================
// Journal
// ============================================================================

#[test]
fn test_journal_survives_restart() {
    const WRITES: usize = 25;
    init_logging();
    let pair = HaPair::start().unwrap();
    pair.crash(NodeSlot::B).unwrap();

    let master = pair.node(NodeSlot::A).unwrap();
    for i in 0..WRITES {
        master
            .store
            .set_value(&format!("journal.survives.{i}"), &i.to_string())
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        master.pending_journal() == WRITES
    }));

    pair.crash(NodeSlot::A).unwrap();
    drop(master);
    let standby = pair.restart(NodeSlot::B).unwrap();
    let master = pair.restart(NodeSlot::A).unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || master.pending_journal() == 0),
        "journal never drained"
    );
    for i in 0..WRITES {
        assert_eq!(
            standby
                .store
                .value(&format!("journal.survives.{i}"))
                .unwrap(),
            Some(i.to_string())
        );
    }
}
