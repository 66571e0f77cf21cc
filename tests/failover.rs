//! Detection thresholds, automatic failover, cool-down, and switchover

use farmd::common::config::{DetectorConfig, ExecutorConfig, FailoverConfig};
use farmd::driver::ScriptedDriver;
use farmd::{
    EventBus, Executor, FailoverController, FailureDetector, FarmEvent, FarmEventKind, JobStatus,
    MemoryStore, Server, ServerMode, ServerStatus, TopologyStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Fixture {
    driver: Arc<ScriptedDriver>,
    topo: Arc<TopologyStore>,
    exec: Executor,
    controller: Arc<FailoverController>,
    detector: FailureDetector,
    events: EventBus,
    a: Server,
    b: Server,
    c: Server,
}

/// Group g1 with primary a (rank 0) and replicas b (rank 2), c (rank 5)
fn fixture(detector_cfg: DetectorConfig, failover_cfg: FailoverConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(ScriptedDriver::new());
    let topo = Arc::new(TopologyStore::load(store.clone()).unwrap());
    topo.create_group("g1", None).unwrap();
    let a = topo.register_server("g1", "db-a:3306", 0).unwrap();
    let b = topo.register_server("g1", "db-b:3306", 2).unwrap();
    let c = topo.register_server("g1", "db-c:3306", 5).unwrap();
    topo.set_primary("g1", Some(a.uuid)).unwrap();

    let events = EventBus::default();
    let exec = Executor::new(
        ExecutorConfig {
            retry_delay_ms: 1,
            ..Default::default()
        },
        store,
        driver.clone(),
        topo.clone(),
        events.clone(),
    );
    let controller = Arc::new(FailoverController::new(
        topo.clone(),
        exec.clone(),
        failover_cfg,
        events.clone(),
    ));
    let detector = FailureDetector::new(
        topo.clone(),
        driver.clone(),
        controller.clone(),
        detector_cfg,
        events.clone(),
    );
    Fixture {
        driver,
        topo,
        exec,
        controller,
        detector,
        events,
        a,
        b,
        c,
    }
}

fn drain(rx: &mut broadcast::Receiver<FarmEvent>) -> Vec<FarmEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_threshold_triggers_failover_exactly_once() {
    let f = fixture(
        DetectorConfig {
            interval_ms: 10,
            threshold: 3,
            window_ms: 10_000,
            ping_timeout_ms: 50,
        },
        FailoverConfig::default(),
    );
    let _workers = f.exec.start();
    let mut rx = f.events.subscribe();

    // Four failed checks in a row: suspect on the first, faulty on the third,
    // and the fourth must not re-trigger
    f.driver.set_down(f.a.uuid, true);
    for _ in 0..4 {
        f.detector.check_server(&f.a).await;
    }
    assert_eq!(f.detector.failures(&f.a.uuid), 4);

    let events = drain(&mut rx);
    let suspects = events
        .iter()
        .filter(|e| matches!(e.kind, FarmEventKind::ServerSuspect { .. }))
        .count();
    assert_eq!(suspects, 1);
    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.kind {
            FarmEventKind::FailoverStarted { job, candidate, .. } => Some((*job, *candidate)),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 1, "faulty edge must fire exactly once");

    let (job, candidate) = started[0];
    // Rank decides: b (rank 2) beats c (rank 5)
    assert_eq!(candidate, f.b.uuid);
    let report = f.exec.wait(job).await.unwrap();
    assert_eq!(report.status, JobStatus::Complete);

    // Committed outcome: old primary faulty, candidate promoted read-write,
    // surviving replica re-pointed at the new primary
    assert_eq!(f.topo.group("g1").unwrap().primary, Some(f.b.uuid));
    assert_eq!(f.topo.server(&f.a.uuid).unwrap().status, ServerStatus::Faulty);
    assert_eq!(f.topo.server(&f.b.uuid).unwrap().mode, ServerMode::ReadWrite);
    assert_eq!(f.driver.count("promote"), 1);
    assert!(f
        .driver
        .calls()
        .contains(&format!("start_replication {} <- {}", f.c.address, f.b.address)));
}

#[tokio::test]
async fn test_cooldown_suppresses_repeat_failover() {
    let f = fixture(DetectorConfig::default(), FailoverConfig { interval_ms: 60_000 });
    let _workers = f.exec.start();
    let mut rx = f.events.subscribe();

    let first = f.controller.on_server_faulty(f.a.uuid).unwrap().unwrap();
    assert_eq!(f.exec.wait(first).await.unwrap().status, JobStatus::Complete);
    assert_eq!(f.topo.group("g1").unwrap().primary, Some(f.b.uuid));

    // The new primary immediately reported faulty: still inside the group's
    // cool-down, so no second failover is submitted
    let second = f.controller.on_server_faulty(f.b.uuid).unwrap();
    assert!(second.is_none());

    let events = drain(&mut rx);
    let started = events
        .iter()
        .filter(|e| matches!(e.kind, FarmEventKind::FailoverStarted { .. }))
        .count();
    let suppressed = events
        .iter()
        .filter(|e| matches!(e.kind, FarmEventKind::FailoverSuppressed { .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(suppressed, 1);
    assert_eq!(f.driver.count("promote"), 1);
}

#[tokio::test]
async fn test_faulty_replica_is_deactivated_not_failed_over() {
    let f = fixture(DetectorConfig::default(), FailoverConfig::default());
    let _workers = f.exec.start();

    let job = f.controller.on_server_faulty(f.c.uuid).unwrap().unwrap();
    assert_eq!(f.exec.wait(job).await.unwrap().status, JobStatus::Complete);

    assert_eq!(f.topo.server(&f.c.uuid).unwrap().status, ServerStatus::Faulty);
    // The primary is untouched
    assert_eq!(f.topo.group("g1").unwrap().primary, Some(f.a.uuid));
    assert_eq!(f.driver.count("promote"), 0);
}

#[tokio::test]
async fn test_group_without_candidate_goes_leaderless() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(ScriptedDriver::new());
    let topo = Arc::new(TopologyStore::load(store.clone()).unwrap());
    topo.create_group("solo", None).unwrap();
    let p = topo.register_server("solo", "db-p:3306", 0).unwrap();
    topo.set_primary("solo", Some(p.uuid)).unwrap();

    let events = EventBus::default();
    let exec = Executor::new(
        ExecutorConfig::default(),
        store,
        driver,
        topo.clone(),
        events.clone(),
    );
    let controller =
        FailoverController::new(topo, exec, FailoverConfig::default(), events.clone());
    let mut rx = events.subscribe();

    assert!(controller.on_server_faulty(p.uuid).unwrap().is_none());
    assert!(controller.is_leaderless("solo"));
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, FarmEventKind::GroupLeaderless { .. })));
}

#[tokio::test]
async fn test_switchover_swaps_primary_and_rejoins_old_one() {
    let f = fixture(DetectorConfig::default(), FailoverConfig::default());
    let _workers = f.exec.start();

    // The current primary is not a valid target
    assert!(f.controller.switchover("g1", Some(f.a.uuid)).is_err());

    let job = f.controller.switchover("g1", Some(f.b.uuid)).unwrap();
    assert_eq!(f.exec.wait(job).await.unwrap().status, JobStatus::Complete);

    assert_eq!(f.topo.group("g1").unwrap().primary, Some(f.b.uuid));
    assert_eq!(f.topo.server(&f.a.uuid).unwrap().mode, ServerMode::ReadOnly);
    assert_eq!(f.topo.server(&f.b.uuid).unwrap().mode, ServerMode::ReadWrite);
    // Unlike failover, the demoted primary stays in service as a replica
    assert_eq!(f.topo.server(&f.a.uuid).unwrap().status, ServerStatus::Running);
    let calls = f.driver.calls();
    assert!(calls.contains(&format!("set_read_only {}", f.a.address)));
    assert!(calls.contains(&format!("reset_master {}", f.b.address)));
    assert!(calls.contains(&format!("start_replication {} <- {}", f.a.address, f.b.address)));
    assert!(calls.contains(&format!("start_replication {} <- {}", f.c.address, f.b.address)));
}

#[tokio::test]
async fn test_switchover_without_target_picks_best_rank() {
    let f = fixture(DetectorConfig::default(), FailoverConfig::default());
    let _workers = f.exec.start();

    let job = f.controller.switchover("g1", None).unwrap();
    assert_eq!(f.exec.wait(job).await.unwrap().status, JobStatus::Complete);
    assert_eq!(f.topo.group("g1").unwrap().primary, Some(f.b.uuid));
}

#[tokio::test]
async fn test_stale_failures_fall_out_of_the_window() {
    let f = fixture(
        DetectorConfig {
            interval_ms: 10,
            threshold: 3,
            window_ms: 50,
            ping_timeout_ms: 50,
        },
        FailoverConfig::default(),
    );

    f.driver.set_down(f.a.uuid, true);
    f.detector.check_server(&f.a).await;
    assert_eq!(f.detector.failures(&f.a.uuid), 1);

    // Far enough apart that the streak restarts instead of accumulating
    tokio::time::sleep(Duration::from_millis(100)).await;
    f.detector.check_server(&f.a).await;
    assert_eq!(f.detector.failures(&f.a.uuid), 1);
}

#[tokio::test]
async fn test_successful_ping_resets_the_streak() {
    let f = fixture(
        DetectorConfig {
            interval_ms: 10,
            threshold: 3,
            window_ms: 10_000,
            ping_timeout_ms: 50,
        },
        FailoverConfig::default(),
    );

    f.driver.set_down(f.a.uuid, true);
    f.detector.check_server(&f.a).await;
    f.detector.check_server(&f.a).await;
    assert_eq!(f.detector.failures(&f.a.uuid), 2);

    f.driver.set_down(f.a.uuid, false);
    f.detector.check_server(&f.a).await;
    assert_eq!(f.detector.failures(&f.a.uuid), 0);
}
