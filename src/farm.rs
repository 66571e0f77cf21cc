//! Farm bootstrap: wires the store, driver, executor, detector and controller

use crate::common::config::FarmConfig;
use crate::detector::FailureDetector;
use crate::driver::DatabaseDriver;
use crate::events::EventBus;
use crate::executor::scheduler::Executor;
use crate::failover::FailoverController;
use crate::store::StorageAdapter;
use crate::topology::TopologyStore;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// A running farm manager instance
pub struct Farm {
    config: FarmConfig,
    topology: Arc<TopologyStore>,
    executor: Executor,
    controller: Arc<FailoverController>,
    detector: Arc<FailureDetector>,
    events: EventBus,
}

impl Farm {
    /// Assemble a farm over a storage backend and a driver capability
    pub fn new(
        config: FarmConfig,
        store: Arc<dyn StorageAdapter>,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventBus::default();
        let topology = Arc::new(TopologyStore::load(store.clone())?);
        let executor = Executor::new(
            config.executor.clone(),
            store,
            driver.clone(),
            topology.clone(),
            events.clone(),
        );
        let controller = Arc::new(FailoverController::new(
            topology.clone(),
            executor.clone(),
            config.failover.clone(),
            events.clone(),
        ));
        let detector = Arc::new(FailureDetector::new(
            topology.clone(),
            driver,
            controller.clone(),
            config.detector.clone(),
            events.clone(),
        ));
        Ok(Self {
            config,
            topology,
            executor,
            controller,
            detector,
            events,
        })
    }

    pub fn topology(&self) -> &Arc<TopologyStore> {
        &self.topology
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn controller(&self) -> &Arc<FailoverController> {
        &self.controller
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start workers, recover pending jobs, start the detector, and run until
    /// interrupted
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting farm manager");
        tracing::info!("  workers: {}", self.config.executor.workers);
        tracing::info!(
            "  detection: every {}ms, threshold {} in {}ms",
            self.config.detector.interval_ms,
            self.config.detector.threshold,
            self.config.detector.window_ms
        );
        tracing::info!("  failover cool-down: {}ms", self.config.failover.interval_ms);

        let _workers = self.executor.start();
        let recovered = self.executor.recover()?;
        if recovered > 0 {
            tracing::info!("recovered {} pending jobs", recovered);
        }
        let _detector = self.detector.clone().spawn();

        // Periodic retention pruning
        let executor = self.executor.clone();
        let retention = Duration::from_secs(self.config.executor.retention_secs.max(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention / 2);
            loop {
                ticker.tick().await;
                if let Err(e) = executor.prune_finished() {
                    tracing::warn!("retention pruning failed: {}", e);
                }
            }
        });

        tracing::info!("farm manager ready");
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        Ok(())
    }
}
