use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";
pub const QUEUE_LOW: &str = "low";

/// A job as it travels through the broker. Retry bookkeeping lives next to
/// the payload, not inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub retried: u32,
    pub max_retry: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl TaskMessage {
    pub fn new<P: Serialize>(kind: &str, payload: &P) -> BrokerResult<Self> {
        Ok(TaskMessage {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
            queue: QUEUE_DEFAULT.to_string(),
            retried: 0,
            max_retry: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        })
    }

    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        P::deserialize(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: String,
    pub max_retry: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        EnqueueOptions {
            queue: QUEUE_DEFAULT.to_string(),
            max_retry: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: Uuid,
    pub kind: String,
    pub queue: String,
    pub max_retry: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retried,
    Dead,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("task serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker is closed")]
    Closed,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// At-least-once task queue. A dequeued task stays active until it is
/// completed or failed; a failed task is re-queued until its retries run
/// out and then dead-lettered.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, task: TaskMessage, options: &EnqueueOptions) -> BrokerResult<TaskInfo>;

    /// Pops from the first non-empty queue in `queues` order, waiting up to
    /// `wait` when all are empty.
    async fn dequeue(&self, queues: &[String], wait: Duration) -> BrokerResult<Option<TaskMessage>>;

    async fn complete(&self, task: &TaskMessage) -> BrokerResult<()>;

    async fn fail(&self, task: TaskMessage, error: String) -> BrokerResult<FailOutcome>;
}

pub(crate) fn prepare(mut task: TaskMessage, options: &EnqueueOptions) -> (TaskMessage, TaskInfo) {
    task.queue = options.queue.clone();
    task.max_retry = options.max_retry;
    task.retried = 0;
    task.enqueued_at = Utc::now();

    let info = TaskInfo {
        id: task.id,
        kind: task.kind.clone(),
        queue: task.queue.clone(),
        max_retry: task.max_retry,
    };
    (task, info)
}

pub(crate) fn retry_or_bury(mut task: TaskMessage, error: String) -> (TaskMessage, FailOutcome) {
    task.last_error = Some(error);
    if task.retried < task.max_retry {
        task.retried += 1;
        (task, FailOutcome::Retried)
    } else {
        (task, FailOutcome::Dead)
    }
}
