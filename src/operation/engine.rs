use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::error::KapsuleError;
use crate::service::ContainerService;

use super::reporter::{EventSink, OperationHandle, OperationState, Reporter};
use super::{OperationStatus, Work};

/// How the engine makes an operation visible to clients. The D-Bus facade
/// exports an Operation object and returns a signal-emitting sink.
#[async_trait]
pub trait OperationPublisher: Send + Sync {
    async fn publish(&self, state: Arc<OperationState>) -> anyhow::Result<Arc<dyn EventSink>>;
    async fn unpublish(&self, id: u64);
}

/// How long a finished operation stays published so slow subscribers can
/// still read its final state.
const LINGER: Duration = Duration::from_secs(5);

/// Runs user-facing work items concurrently, one task per operation, and
/// owns the table of live operations.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    service: Arc<ContainerService>,
    publisher: Arc<dyn OperationPublisher>,
    table: Mutex<HashMap<u64, Arc<OperationHandle>>>,
    next_id: AtomicU64,
    linger: Duration,
}

impl Engine {
    pub fn new(service: Arc<ContainerService>, publisher: Arc<dyn OperationPublisher>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                service,
                publisher,
                table: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                linger: LINGER,
            }),
        }
    }

    /// Accept a work item: assign an id, publish the Operation object, and
    /// spawn its task. The object is live before this returns, so the reply
    /// carrying the path never races its visibility.
    pub async fn submit(&self, work: Work) -> crate::error::Result<u64> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(OperationState::new(id, work.kind(), work.target().to_string()));

        let sink = self
            .inner
            .publisher
            .publish(Arc::clone(&state))
            .await
            .map_err(KapsuleError::Internal)?;
        let handle = Arc::new(OperationHandle::new(state, sink));

        self.inner
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&handle));

        info!(
            operation = id,
            kind = work.kind(),
            container = work.target(),
            "operation started"
        );

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_work(id, work, handle).await;
        });

        Ok(id)
    }

    async fn run_work(&self, id: u64, work: Work, handle: Arc<OperationHandle>) {
        let reporter = Reporter::new(Arc::clone(&handle));
        let result = self.inner.service.execute(work, reporter).await;

        let (status, message) = match result {
            Ok(()) => (OperationStatus::Completed, String::new()),
            Err(KapsuleError::Cancelled) => {
                (OperationStatus::Cancelled, "operation cancelled".to_string())
            }
            Err(e) if handle.state.is_cancelled() => (
                OperationStatus::Cancelled,
                format!("operation cancelled: {e}"),
            ),
            Err(e) => (OperationStatus::Failed, e.to_string()),
        };

        if handle.finish(status, &message) {
            match status {
                OperationStatus::Completed => info!(operation = id, "operation completed"),
                OperationStatus::Cancelled => info!(operation = id, "operation cancelled"),
                _ => error!(operation = id, "operation failed: {}", message),
            }
        }

        // Keep the object around briefly so late subscribers observe the
        // terminal state, then drop it from the bus and the table.
        sleep(self.inner.linger).await;
        self.inner
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.inner.publisher.unpublish(id).await;
    }

    pub fn get(&self, id: u64) -> Option<Arc<OperationHandle>> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Arm cancellation on every live operation; returns how many accepted.
    pub fn cancel_all(&self) -> usize {
        let table = self.inner.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .values()
            .filter(|handle| handle.state.request_cancel())
            .count()
    }

    /// Wait until every operation has reached a terminal state or the
    /// deadline passes. Returns true when all settled in time.
    pub async fn await_terminal(&self, deadline: Duration) -> bool {
        let end = Instant::now() + deadline;
        loop {
            let all_terminal = {
                let table = self.inner.table.lock().unwrap_or_else(|e| e.into_inner());
                table.values().all(|h| h.state.status().is_terminal())
            };
            if all_terminal {
                return true;
            }
            if Instant::now() >= end {
                return false;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}
