use crate::{registry::CancelRegistry, SchedResult};
use siphon_gateway::Gateway;
use siphon_lib::{LinkKey, OpParams, OpResult, TaskId, TaskKind, TaskStatus};
use siphon_taskdb::TaskStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Default pause between collector sweeps of the in-flight list.
pub const COLLECT_INTERVAL: Duration = Duration::from_secs(5);

/// Success log lines carry at most this many trailing bytes of the captured
/// storage log; failures log it whole.
const SUCCESS_LOG_EXCERPT: usize = 512;

/// One bounded worker pool for one link.
///
/// Lifecycle: open (accepting tasks) -> draining (in-flight completing) ->
/// closed (collector exited, nothing in flight), at which point the
/// scheduler drops the pool. Worker concurrency is bounded by a semaphore
/// sized `max_concurrent`; submissions beyond the bound queue on permit
/// acquisition in submission order.
pub struct LinkPool {
    link: LinkKey,
    store: TaskStore,
    gateway: Gateway,
    registry: Arc<CancelRegistry>,
    semaphore: Arc<Semaphore>,
    collect_interval: Duration,
    in_flight: Mutex<Vec<(TaskId, JoinHandle<OpResult>)>>,
    collector: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl LinkPool {
    pub fn new(
        link: LinkKey,
        store: TaskStore,
        gateway: Gateway,
        registry: Arc<CancelRegistry>,
        max_concurrent: usize,
        collect_interval: Duration,
        stop: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            link,
            store,
            gateway,
            registry,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            collect_interval,
            in_flight: Mutex::new(Vec::new()),
            collector: Mutex::new(None),
            stop,
        })
    }

    pub fn link(&self) -> &LinkKey {
        &self.link
    }

    fn kind(&self) -> TaskKind {
        self.link.kind()
    }

    /// Accept one `new` task: transition the row to `queued` and append the
    /// id to the cancellation registry (both under the registry lock, row
    /// write first), then submit a worker. The `new -> queued` write is the
    /// synchronization point that guarantees at most one worker per task.
    pub fn add_task(self: &Arc<Self>, id: TaskId, params: OpParams) -> SchedResult<()> {
        self.registry
            .enqueue_with(id, || self.store.set_status(self.kind(), id, TaskStatus::Queued))?;

        let handle = tokio::spawn(run_worker(
            self.semaphore.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.gateway.clone(),
            self.kind(),
            id,
            params,
            self.stop.clone(),
        ));
        self.in_flight.lock().unwrap().push((id, handle));
        self.start_collector();
        Ok(())
    }

    /// Spawn the collector if none is running. The collector exits once the
    /// in-flight list drains (or on stop), so both `add_task` and the
    /// scheduler's per-cycle sweep call this to revive it while work
    /// remains.
    pub fn start_collector(self: &Arc<Self>) {
        let mut slot = self.collector.lock().unwrap();
        let running = slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if running {
            return;
        }
        if self.in_flight.lock().unwrap().is_empty() {
            return;
        }
        let pool = self.clone();
        *slot = Some(tokio::spawn(async move { pool.collect_loop().await }));
    }

    async fn collect_loop(self: Arc<Self>) {
        loop {
            let finished = {
                let mut in_flight = self.in_flight.lock().unwrap();
                let mut pending = Vec::new();
                let mut finished = Vec::new();
                for entry in in_flight.drain(..) {
                    if entry.1.is_finished() {
                        finished.push(entry);
                    } else {
                        pending.push(entry);
                    }
                }
                *in_flight = pending;
                finished
            };

            for (id, handle) in finished {
                let result = match handle.await {
                    Ok(result) => result,
                    // A worker panic must not take the pool down; record it
                    // like any other plumbing failure.
                    Err(error) => OpResult::internal_error(format!("worker aborted: {error}")),
                };
                self.record(id, result);
            }

            if self.in_flight.lock().unwrap().is_empty() {
                return;
            }
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(self.collect_interval) => {}
            }
        }
    }

    /// Write the terminal status for one completed worker.
    fn record(&self, id: TaskId, result: OpResult) {
        let kind = self.kind();
        let status = if result.is_cancelled() {
            TaskStatus::Cancelled
        } else if result.is_success() {
            TaskStatus::Done
        } else {
            TaskStatus::Failed
        };

        let written = match status {
            TaskStatus::Cancelled => self.store.set_status(kind, id, status),
            _ => self.store.set_outcome(
                kind,
                id,
                status,
                result.exit_code,
                result.started_at,
                result.finished_at,
            ),
        };
        if let Err(error) = written {
            tracing::error!(
                "LinkPool[{}]: failed to record {status} for {kind} task {id}: {error}",
                self.link
            );
            return;
        }

        match status {
            TaskStatus::Done => tracing::info!(
                "LinkPool[{}]: {kind} task {id} done: {} {}",
                self.link,
                result.message,
                excerpt(&result.log),
            ),
            TaskStatus::Cancelled => {
                tracing::info!("LinkPool[{}]: {kind} task {id} cancelled", self.link)
            }
            _ => tracing::error!(
                "LinkPool[{}]: {kind} task {id} failed with code {}: {} {}",
                self.link,
                result.exit_code,
                result.message,
                result.log,
            ),
        }
    }

    /// Idempotent recycling probe: true once nothing is in flight and the
    /// collector has exited. After the stop flag is set the probe instead
    /// force-terminates the worker group and joins it; storage calls
    /// already on a blocking thread run to completion but their results are
    /// discarded, and orphan recovery re-normalizes their rows.
    pub async fn ready_for_recycle(&self) -> bool {
        if self.stop.is_cancelled() {
            let stragglers: Vec<_> = self.in_flight.lock().unwrap().drain(..).collect();
            for (_, handle) in &stragglers {
                handle.abort();
            }
            for (id, handle) in stragglers {
                if handle.await.is_err() {
                    tracing::debug!("LinkPool[{}]: terminated worker for task {id}", self.link);
                }
            }
            let collector = self.collector.lock().unwrap().take();
            if let Some(handle) = collector {
                let _ = handle.await;
            }
            return true;
        }

        if !self.in_flight.lock().unwrap().is_empty() {
            return false;
        }
        self.collector
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }
}

/// One worker, one task.
///
/// Protocol: claim the own id from the registry (a lost claim is an
/// upstream cancellation and storage is never touched), mark the row
/// `active`, then run the blocking gateway call on its own thread with its
/// own storage context. The structured result travels back to the collector
/// through the join handle.
#[allow(clippy::too_many_arguments)]
async fn run_worker(
    semaphore: Arc<Semaphore>,
    registry: Arc<CancelRegistry>,
    store: TaskStore,
    gateway: Gateway,
    kind: TaskKind,
    id: TaskId,
    params: OpParams,
    stop: CancellationToken,
) -> OpResult {
    let _permit = tokio::select! {
        _ = stop.cancelled() => return OpResult::cancelled(),
        permit = semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return OpResult::cancelled(),
        },
    };
    if stop.is_cancelled() {
        return OpResult::cancelled();
    }

    // 1. Claim the own id; losing means the manager cancelled the task
    //    between enqueue and dispatch.
    if !registry.try_claim(id) {
        return OpResult::cancelled();
    }

    // 2. The row goes active before any storage call.
    if let Err(error) = store.set_status(kind, id, TaskStatus::Active) {
        return OpResult::internal_error(format!("failed to mark task {id} active: {error}"));
    }

    // 3. The storage library blocks for up to hours; give it a dedicated
    //    thread and a private context.
    match tokio::task::spawn_blocking(move || gateway.execute(&params)).await {
        Ok(result) => result,
        Err(error) => OpResult::internal_error(format!("storage call aborted: {error}")),
    }
}

fn excerpt(log: &str) -> &str {
    if log.len() <= SUCCESS_LOG_EXCERPT {
        return log;
    }
    let mut start = log.len() - SUCCESS_LOG_EXCERPT;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    &log[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_keeps_short_logs_whole() {
        assert_eq!(excerpt("short log"), "short log");
    }

    #[test]
    fn excerpt_bounds_long_logs() {
        let log = "x".repeat(2000);
        assert_eq!(excerpt(&log).len(), SUCCESS_LOG_EXCERPT);
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let log = format!("{}ü", "x".repeat(SUCCESS_LOG_EXCERPT));
        let tail = excerpt(&log);
        assert!(tail.len() <= SUCCESS_LOG_EXCERPT);
        assert!(tail.ends_with('ü'));
    }
}
