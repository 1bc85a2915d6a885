//! Completion queue
//!
//! Operation tasks never touch the cluster status. They send a
//! [`CompletedOperation`] on the bounded queue of their cluster, and the next
//! reconcile cycle drains it before scheduling anything new.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::crd::OperationKind;

/// Default capacity of a cluster completion queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Outcome of an operation on one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedOperation {
    pub dc_rack: String,
    pub pod: String,
    pub operation: OperationKind,
    pub error: Option<String>,
}

impl CompletedOperation {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Bounded queue of completions for one cluster
pub struct CompletionQueue {
    tx: mpsc::Sender<CompletedOperation>,
    rx: Mutex<mpsc::Receiver<CompletedOperation>>,
}

impl CompletionQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue a completion, waiting while the queue is full
    pub async fn report(&self, completion: CompletedOperation) {
        if let Err(e) = self.tx.send(completion).await {
            warn!(pod = %e.0.pod, "Completion queue closed, dropping completion");
        }
    }

    /// Take every queued completion, in enqueue order
    pub fn drain(&self) -> Vec<CompletedOperation> {
        let mut rx = self.rx.lock();
        let mut drained = Vec::new();
        while let Ok(completion) = rx.try_recv() {
            drained.push(completion);
        }
        drained
    }
}

/// Completion queues keyed by cluster (`<namespace>/<name>`)
pub struct CompletionQueues {
    queues: DashMap<String, Arc<CompletionQueue>>,
    capacity: usize,
}

impl Default for CompletionQueues {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl CompletionQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity,
        }
    }

    pub fn for_cluster(&self, key: &str) -> Arc<CompletionQueue> {
        self.queues
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CompletionQueue::new(self.capacity)))
            .clone()
    }

    /// Forget the queue of a deleted cluster
    pub fn remove(&self, key: &str) {
        self.queues.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(pod: &str, error: Option<&str>) -> CompletedOperation {
        CompletedOperation {
            dc_rack: "dc1-rack1".into(),
            pod: pod.into(),
            operation: OperationKind::Cleanup,
            error: error.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_drain_in_enqueue_order() {
        let queue = CompletionQueue::new(10);
        queue.report(completion("p0", None)).await;
        queue.report(completion("p1", Some("boom"))).await;

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].pod, "p0");
        assert!(!drained[1].succeeded());
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn test_queues_are_per_cluster() {
        let queues = CompletionQueues::default();
        queues.for_cluster("ns/a").report(completion("p0", None)).await;
        assert!(queues.for_cluster("ns/b").drain().is_empty());
        assert_eq!(queues.for_cluster("ns/a").drain().len(), 1);
    }
}
