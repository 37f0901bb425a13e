use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;

use crate::lib::{
    broker::types::{Broker, QUEUE_CRITICAL, QUEUE_DEFAULT, QUEUE_LOW, TaskMessage},
    task::types::TaskResult,
};

/// Work for a dequeued task. An `Err` hands the task back to the broker's
/// retry policy.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process(&self, task: &TaskMessage) -> TaskResult<()>;
}

/// Relative share of polls each queue gets. A queue with weight 0 is
/// never listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueWeights(pub Vec<(String, u32)>);

impl Default for QueueWeights {
    fn default() -> Self {
        QueueWeights(vec![
            (QUEUE_CRITICAL.to_string(), 6),
            (QUEUE_DEFAULT.to_string(), 3),
            (QUEUE_LOW.to_string(), 1),
        ])
    }
}

impl QueueWeights {
    /// Weighted random order without replacement. Higher weights tend to
    /// come first, but every queue appears, so none starves.
    pub fn ordered<R: Rng>(&self, rng: &mut R) -> Vec<String> {
        let mut remaining: Vec<&(String, u32)> = self.0.iter().filter(|(_, w)| *w > 0).collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let total: u32 = remaining.iter().map(|(_, w)| *w).sum();
            let mut pick = rng.gen_range(0..total);
            let index = remaining
                .iter()
                .position(|(_, w)| {
                    if pick < *w {
                        true
                    } else {
                        pick -= *w;
                        false
                    }
                })
                .unwrap_or(0);
            order.push(remaining.remove(index).0.clone());
        }
        order
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queues: QueueWeights,
    pub dequeue_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            concurrency: 10,
            queues: QueueWeights::default(),
            dequeue_wait: Duration::from_secs(1),
        }
    }
}

/// Fixed set of consumers pulling from one broker into one handler.
pub struct WorkerPool {
    pub broker: Arc<dyn Broker>,
    pub handler: Arc<dyn TaskHandler>,
    pub config: WorkerConfig,
}
