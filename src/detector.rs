//! Failure detector
//!
//! Heartbeat poller with a per-server `OK -> SUSPECT -> FAULTY` machine. This
//! is an unreliable detector by design: a live-but-slow server can be flagged
//! and the downstream failover is compensable to absorb that. The detector
//! never touches topology state itself; crossing the threshold triggers the
//! failover controller exactly once per edge, and everything else happens
//! inside executed job steps.

use crate::common::config::DetectorConfig;
use crate::common::utils::timestamp_now_millis;
use crate::driver::DatabaseDriver;
use crate::events::{EventBus, FarmEventKind};
use crate::failover::FailoverController;
use crate::topology::{Server, ServerId, TopologyStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Per-server failure bookkeeping. In-memory only; a restart starts counting
/// from scratch.
#[derive(Debug, Default, Clone)]
struct FailureRecord {
    /// Consecutive failed checks inside the current window
    failures: u32,
    /// Millisecond timestamp of the first failure in the window
    window_start: u64,
    /// SUSPECT already announced for this streak
    suspect: bool,
    /// FAULTY already reported for this streak (edge-trigger guard)
    reported: bool,
}

pub struct FailureDetector {
    topology: Arc<TopologyStore>,
    driver: Arc<dyn DatabaseDriver>,
    controller: Arc<FailoverController>,
    cfg: DetectorConfig,
    records: Mutex<HashMap<ServerId, FailureRecord>>,
    events: EventBus,
}

impl FailureDetector {
    pub fn new(
        topology: Arc<TopologyStore>,
        driver: Arc<dyn DatabaseDriver>,
        controller: Arc<FailoverController>,
        cfg: DetectorConfig,
        events: EventBus,
    ) -> Self {
        Self {
            topology,
            driver,
            controller,
            cfg,
            records: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Run the polling loop on its own task
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.cfg.interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_all().await;
            }
        })
    }

    /// One polling round over every RUNNING server
    pub async fn check_all(&self) {
        for server in self.topology.servers() {
            if server.status.is_running() {
                self.check_server(&server).await;
            }
        }
    }

    /// Probe one server and advance its failure record
    pub async fn check_server(&self, server: &Server) {
        let ping = self.driver.ping(server);
        let timeout = Duration::from_millis(self.cfg.ping_timeout_ms);
        let ok = matches!(tokio::time::timeout(timeout, ping).await, Ok(Ok(())));

        if ok {
            // Any success resets the streak; a server already FAULTY is not
            // polled and is only brought back by an explicit admin job
            self.records.lock().unwrap().remove(&server.uuid);
            return;
        }

        let report = {
            let mut records = self.records.lock().unwrap();
            let record = records.entry(server.uuid).or_default();
            let now = timestamp_now_millis();

            // Failures must accumulate within the window to count as a streak
            if record.failures > 0 && now.saturating_sub(record.window_start) > self.cfg.window_ms {
                *record = FailureRecord::default();
            }
            if record.failures == 0 {
                record.window_start = now;
            }
            record.failures += 1;

            if !record.suspect {
                record.suspect = true;
                self.events.publish(FarmEventKind::ServerSuspect {
                    server: server.uuid,
                    failures: record.failures,
                });
            }

            if record.failures >= self.cfg.threshold && !record.reported {
                record.reported = true;
                true
            } else {
                false
            }
        };

        if report {
            self.events.publish(FarmEventKind::ServerFaulty {
                server: server.uuid,
            });
            match self.controller.on_server_faulty(server.uuid) {
                Ok(Some(job)) => {
                    tracing::info!("faulty server {} handed to job {}", server.uuid, job);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("failover trigger for {} failed: {}", server.uuid, e);
                }
            }
        }
    }

    /// Current consecutive-failure count for a server (0 when clean)
    pub fn failures(&self, server: &ServerId) -> u32 {
        self.records
            .lock()
            .unwrap()
            .get(server)
            .map_or(0, |r| r.failures)
    }
}
