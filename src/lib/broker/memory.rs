use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tracing::debug;
use uuid::Uuid;

use super::types::{
    Broker, BrokerError, BrokerResult, EnqueueOptions, FailOutcome, TaskInfo, TaskMessage, prepare,
    retry_or_bury,
};

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<TaskMessage>>,
    active: HashMap<Uuid, TaskMessage>,
    dead: Vec<TaskMessage>,
    closed: bool,
}

/// Single-process broker used for development and tests.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn pending(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.state.lock().active.len()
    }

    #[cfg(test)]
    pub fn dead(&self) -> Vec<TaskMessage> {
        self.state.lock().dead.clone()
    }

    fn pop(&self, queues: &[String]) -> BrokerResult<Option<TaskMessage>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let popped = queues
            .iter()
            .find_map(|queue| state.queues.get_mut(queue).and_then(VecDeque::pop_front));
        if let Some(task) = &popped {
            state.active.insert(task.id, task.clone());
        }
        Ok(popped)
    }

    fn push(&self, task: TaskMessage) {
        self.state
            .lock()
            .queues
            .entry(task.queue.clone())
            .or_default()
            .push_back(task);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task: TaskMessage, options: &EnqueueOptions) -> BrokerResult<TaskInfo> {
        if self.state.lock().closed {
            return Err(BrokerError::Closed);
        }
        let (task, info) = prepare(task, options);
        debug!("enqueue {} ({}) on {}", info.id, info.kind, info.queue);
        self.push(task);
        Ok(info)
    }

    async fn dequeue(&self, queues: &[String], wait: Duration) -> BrokerResult<Option<TaskMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.pop(queues)? {
                return Ok(Some(task));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, task: &TaskMessage) -> BrokerResult<()> {
        self.state.lock().active.remove(&task.id);
        Ok(())
    }

    async fn fail(&self, task: TaskMessage, error: String) -> BrokerResult<FailOutcome> {
        self.state.lock().active.remove(&task.id);
        let (task, outcome) = retry_or_bury(task, error);
        match outcome {
            FailOutcome::Retried => self.push(task),
            FailOutcome::Dead => self.state.lock().dead.push(task),
        }
        Ok(outcome)
    }
}
