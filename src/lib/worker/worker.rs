use std::{sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{TaskHandler, WorkerConfig, WorkerPool};
use crate::lib::broker::types::{Broker, FailOutcome, TaskMessage};

const BROKER_BACKOFF: Duration = Duration::from_secs(1);

impl WorkerPool {
    pub fn new(broker: Arc<dyn Broker>, handler: Arc<dyn TaskHandler>, config: WorkerConfig) -> Self {
        WorkerPool {
            broker,
            handler,
            config,
        }
    }

    /// Runs `concurrency` workers until `shutdown` fires. A worker finishes
    /// the task it holds before stopping.
    pub async fn run(self, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        info!("starting {} workers", concurrency);

        let mut workers = JoinSet::new();
        for index in 0..concurrency {
            workers.spawn(run_worker(
                index,
                self.broker.clone(),
                self.handler.clone(),
                self.config.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker exited abnormally: {}", e);
            }
        }
        info!("all workers stopped");
    }
}

async fn run_worker(
    index: usize,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    loop {
        let queues = config.queues.ordered(&mut rand::thread_rng());
        let dequeued = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            dequeued = broker.dequeue(&queues, config.dequeue_wait) => dequeued,
        };

        match dequeued {
            Ok(Some(task)) => run_task(index, broker.as_ref(), handler.as_ref(), task).await,
            Ok(None) => {}
            Err(e) => {
                warn!("worker {}: dequeue failed: {}", index, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(BROKER_BACKOFF) => {}
                }
            }
        }
    }
    debug!("worker {} stopped", index);
}

async fn run_task(index: usize, broker: &dyn Broker, handler: &dyn TaskHandler, task: TaskMessage) {
    debug!("worker {}: running {} ({})", index, task.id, task.kind);

    match handler.process(&task).await {
        Ok(()) => {
            if let Err(e) = broker.complete(&task).await {
                warn!("worker {}: could not ack {}: {}", index, task.id, e);
            }
        }
        Err(err) => {
            let (id, kind) = (task.id, task.kind.clone());
            match broker.fail(task, err.to_string()).await {
                Ok(FailOutcome::Retried) => warn!("task {} ({}) failed, will retry: {}", id, kind, err),
                Ok(FailOutcome::Dead) => error!("task {} ({}) failed for good: {}", id, kind, err),
                Err(e) => error!("task {} ({}) failed ({}) and could not be re-queued: {}", id, kind, err, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::{
        broker::{
            memory::MemoryBroker,
            types::{EnqueueOptions, QUEUE_DEFAULT, QUEUE_LOW},
        },
        task::types::{TaskError, TaskResult},
        worker::types::QueueWeights,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::{SeedableRng, rngs::StdRng};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        failing: bool,
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn process(&self, task: &TaskMessage) -> TaskResult<()> {
            self.seen.lock().push(task.kind.clone());
            if self.failing {
                return Err(TaskError::UnknownKind(task.kind.clone()));
            }
            Ok(())
        }
    }

    fn config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            dequeue_wait: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[test]
    fn ordering_lists_every_weighted_queue_once() {
        let weights = QueueWeights::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let mut order = weights.ordered(&mut rng);
            order.sort();
            assert_eq!(order, vec!["critical", "default", "low"]);
        }
    }

    #[test]
    fn heavier_queue_usually_comes_first() {
        let weights = QueueWeights::default();
        let mut rng = StdRng::seed_from_u64(42);
        let critical_first = (0..1000)
            .filter(|_| weights.ordered(&mut rng)[0] == "critical")
            .count();
        // expected share is 6/10
        assert!((500..700).contains(&critical_first), "{}", critical_first);
    }

    #[test]
    fn zero_weight_queue_is_skipped() {
        let weights = QueueWeights(vec![("default".to_string(), 1), ("off".to_string(), 0)]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(weights.ordered(&mut rng), vec!["default"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_processes_and_acks() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = Arc::new(Recorder::default());
        for kind in ["a", "b", "c"] {
            let task = TaskMessage::new(kind, &json!({})).unwrap();
            broker.enqueue(task, &EnqueueOptions::default()).await.unwrap();
        }
        let low = EnqueueOptions {
            queue: QUEUE_LOW.to_string(),
            ..Default::default()
        };
        broker
            .enqueue(TaskMessage::new("d", &json!({})).unwrap(), &low)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(broker.clone(), handler.clone(), config(2));
        let running = tokio::spawn(pool.run(shutdown.clone()));

        settle().await;
        shutdown.cancel();
        running.await.unwrap();

        let mut seen = handler.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
        assert_eq!(broker.pending(QUEUE_DEFAULT), 0);
        assert_eq!(broker.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_is_retried_then_dead_lettered() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = Arc::new(Recorder {
            failing: true,
            ..Default::default()
        });
        let task = TaskMessage::new("container:create", &json!({})).unwrap();
        broker.enqueue(task, &EnqueueOptions::default()).await.unwrap();

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(WorkerPool::new(broker.clone(), handler.clone(), config(1)).run(shutdown.clone()));

        settle().await;
        shutdown.cancel();
        running.await.unwrap();

        // one attempt plus one retry
        assert_eq!(handler.seen.lock().len(), 2);
        let dead = broker.dead();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retried, 1);
        assert!(dead[0].last_error.as_deref().unwrap().contains("container:create"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_pool_stops_on_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(
            WorkerPool::new(broker, Arc::new(Recorder::default()), config(4)).run(shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.cancel();
        running.await.unwrap();
    }
}
