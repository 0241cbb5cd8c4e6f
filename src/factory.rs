//! Factory for assembling a crash table
//!
//! Centralizes the initialization order shared by the binary and the
//! integration tests: store, metrics, settlement worker, scheduler, gateway.

use crate::{
    api::ApiServer,
    config::CrashConfig,
    errors::CrashResult,
    fairness::{CrashPointGenerator, CrashPointSource},
    gateway::GameGateway,
    ledger::bounded,
    metrics::GameMetrics,
    scheduler::{RoundScheduler, SchedulerHandle},
    settlement::{ReconciliationQueue, SettlementHandle, SettlementWorker},
    storage::RocksStore,
    store::{LedgerBatch, LedgerStore, MemoryStore},
    types::UserId,
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running table and the handles needed to drive and stop it
pub struct CrashTable {
    pub gateway: GameGateway,
    pub metrics: GameMetrics,
    pub store: Arc<dyn LedgerStore>,
    pub settlement: SettlementHandle,
    scheduler: SchedulerHandle,
    store_timeout: Duration,
    scheduler_task: JoinHandle<()>,
    settlement_task: JoinHandle<()>,
}

impl CrashTable {
    /// Credit points to a user, creating the balance row if needed
    pub async fn fund(&self, user_id: UserId, amount: u64) -> CrashResult<()> {
        let batch = LedgerBatch::new().credit(user_id, amount);
        bounded(self.store_timeout, self.store.apply(batch)).await?;
        info!("Funded user {} with {} points", user_id, amount);
        Ok(())
    }

    pub fn api_server(&self, config: &CrashConfig) -> ApiServer {
        ApiServer::new(
            config.api.clone(),
            self.gateway.clone(),
            self.metrics.clone(),
            config.monitoring.metrics_enabled,
        )
    }

    /// Stop the scheduler and wait for queued settlement jobs. A round with
    /// stakes in play is run to its crash and settled before the scheduler stops.
    pub async fn shutdown(self) -> CrashResult<()> {
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler already stopped: {}", e);
        }
        if let Err(e) = self.scheduler_task.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }

        self.settlement.wait_idle().await;
        let flagged = self.gateway.reconciliation().len();
        if flagged > 0 {
            warn!("{} settlement job(s) still need reconciliation", flagged);
        }
        self.settlement_task.abort();
        Ok(())
    }
}

pub struct GameFactory;

impl GameFactory {
    /// RocksDB when a path is configured, otherwise in memory
    pub fn open_store(config: &CrashConfig) -> CrashResult<Arc<dyn LedgerStore>> {
        match &config.storage.db_path {
            Some(path) => {
                info!("Opening RocksDB store at {}", path);
                Ok(Arc::new(RocksStore::open(path)?))
            }
            None => {
                warn!("No storage.db_path configured, balances are kept in memory only");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    /// Table with the provably fair generator
    pub async fn create_table(config: &CrashConfig, store: Arc<dyn LedgerStore>) -> CrashResult<CrashTable> {
        let source = Box::new(CrashPointGenerator::new(config.fairness_params()));
        Self::create_with_source(config, store, source).await
    }

    pub async fn create_with_source(
        config: &CrashConfig,
        store: Arc<dyn LedgerStore>,
        source: Box<dyn CrashPointSource>,
    ) -> CrashResult<CrashTable> {
        let metrics = GameMetrics::new()?;
        let reconciliation = Arc::new(ReconciliationQueue::new());
        let (settlement, settlement_task) = SettlementWorker::spawn(
            store.clone(),
            config.retry_policy(),
            metrics.clone(),
            reconciliation.clone(),
        );

        let (scheduler, handle) =
            RoundScheduler::new(config, source, store.clone(), settlement.clone(), metrics.clone()).await?;
        let scheduler_task = scheduler.spawn();
        let gateway = GameGateway::new(config, handle.clone(), store.clone(), reconciliation);

        Ok(CrashTable {
            gateway,
            metrics,
            store,
            settlement,
            scheduler: handle,
            store_timeout: config.store_timeout(),
            scheduler_task,
            settlement_task,
        })
    }
}
