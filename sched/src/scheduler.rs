use crate::{pool::LinkPool, registry::CancelRegistry, SchedResult, COLLECT_INTERVAL};
use siphon_gateway::Gateway;
use siphon_lib::{LinkKey, TaskKind};
use siphon_taskdb::TaskStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default pause between poll cycles. Held even when new rows are waiting:
/// the fixed cadence is the daemon's only back-pressure on the manager.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker bound of each per-link pool (`max_parallel_links` in the
    /// configuration document).
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub collect_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval: POLL_INTERVAL,
            collect_interval: COLLECT_INTERVAL,
        }
    }
}

/// The long-running loop of the daemon.
///
/// Each cycle, per kind (deletions first, so space frees before new data
/// lands): fetch `new` rows, hand each to its link's pool (created lazily),
/// rebuild that kind's cancellation registry from the `queued` set; then
/// recycle idle pools and sleep until the next cycle or the stop signal.
pub struct Scheduler {
    store: TaskStore,
    gateway: Gateway,
    config: SchedulerConfig,
    transfer_registry: Arc<CancelRegistry>,
    deletion_registry: Arc<CancelRegistry>,
    pools: HashMap<LinkKey, Arc<LinkPool>>,
    stop: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: TaskStore,
        gateway: Gateway,
        config: SchedulerConfig,
        stop: CancellationToken,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
            transfer_registry: Arc::new(CancelRegistry::new()),
            deletion_registry: Arc::new(CancelRegistry::new()),
            pools: HashMap::new(),
            stop,
        }
    }

    fn registry(&self, kind: TaskKind) -> &Arc<CancelRegistry> {
        match kind {
            TaskKind::Transfer => &self.transfer_registry,
            TaskKind::Deletion => &self.deletion_registry,
        }
    }

    /// Run until the stop token fires or a cycle fails, then walk the
    /// shutdown path either way.
    pub async fn run(&mut self) -> SchedResult<()> {
        // Rows stranded queued/active by an unclean stop go back to new
        // before the first cycle; no worker is ever spawned for them.
        self.store.recover_orphans()?;

        let outcome = self.run_loop().await;
        self.shutdown().await;
        outcome
    }

    async fn run_loop(&mut self) -> SchedResult<()> {
        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }
            self.poll_cycle().await?;
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn poll_cycle(&mut self) -> SchedResult<()> {
        for kind in [TaskKind::Deletion, TaskKind::Transfer] {
            let dispatched = self.dispatch_new(kind)?;
            if dispatched > 0 {
                tracing::info!("Scheduler.poll: dispatched {dispatched} new {kind} tasks");
            }
            let queued = self.store.list_queued(kind)?;
            self.registry(kind).refresh(queued);
        }
        self.sweep_pools().await;
        tracing::debug!(
            "Scheduler.poll: cycle complete, {} live pools, {} transfers and {} deletions queued",
            self.pools.len(),
            self.transfer_registry.len(),
            self.deletion_registry.len(),
        );
        Ok(())
    }

    /// Hand every `new` row of one kind to its pool. Rows arrive grouped by
    /// link, so the pool lookup only happens when the link changes.
    fn dispatch_new(&mut self, kind: TaskKind) -> SchedResult<usize> {
        let rows = self.store.fetch_new(kind)?;
        let dispatched = rows.len();

        let mut current: Option<Arc<LinkPool>> = None;
        for task in rows {
            let pool = match &current {
                Some(pool) if *pool.link() == task.link => pool.clone(),
                _ => {
                    let pool = self.pool_for(&task.link);
                    current = Some(pool.clone());
                    pool
                }
            };
            pool.add_task(task.id, task.params)?;
        }
        Ok(dispatched)
    }

    fn pool_for(&mut self, link: &LinkKey) -> Arc<LinkPool> {
        if let Some(pool) = self.pools.get(link) {
            return pool.clone();
        }
        tracing::info!("Scheduler.pool: opening pool for link {link}");
        let pool = LinkPool::new(
            link.clone(),
            self.store.clone(),
            self.gateway.clone(),
            self.registry(link.kind()).clone(),
            self.config.max_concurrent,
            self.config.collect_interval,
            self.stop.child_token(),
        );
        self.pools.insert(link.clone(), pool.clone());
        pool
    }

    /// Drop pools whose work has drained and revive the collector of those
    /// still busy. Idle pools must go promptly: they hold the per-link
    /// concurrency configuration and their resources scale with the set of
    /// historically seen links.
    async fn sweep_pools(&mut self) {
        let mut recycled = Vec::new();
        for (link, pool) in &self.pools {
            if pool.ready_for_recycle().await {
                recycled.push(link.clone());
            } else {
                pool.start_collector();
            }
        }
        for link in recycled {
            self.pools.remove(&link);
            tracing::info!("Scheduler.pool: recycled idle pool {link}");
        }
    }

    async fn shutdown(&mut self) {
        // 1. Stop flag; every collector observes it and exits.
        self.stop.cancel();

        // 2. Rows still queued or active go back to new.
        if let Err(error) = self.store.recover_orphans() {
            tracing::error!("Scheduler.shutdown: orphan recovery failed: {error}");
        }

        // 3. Probe the remaining pools until all are closed; with the stop
        //    flag set the probe force-terminates and joins each worker
        //    group.
        while !self.pools.is_empty() {
            let mut closed = Vec::new();
            for (link, pool) in &self.pools {
                if pool.ready_for_recycle().await {
                    closed.push(link.clone());
                }
            }
            for link in &closed {
                self.pools.remove(link);
            }
            if !self.pools.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        tracing::info!("Scheduler.shutdown: file-operations daemon stopped");
    }
}
