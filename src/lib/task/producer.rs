use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::types::{
    ContainerCreatePayload, ContainerExecPayload, TYPE_CONTAINER_CREATE, TYPE_CONTAINER_EXEC,
    TaskError, TaskResult, TimingConfig,
};
use crate::lib::{
    broker::types::{Broker, EnqueueOptions, TaskInfo, TaskMessage},
    channel::{
        registry::ChannelRegistry,
        types::{ChannelError, ChannelKey, OperationHandle, Status, StatusMessage},
    },
    model::types::ContainerTemplate,
};

/// Submits container jobs and opens the status channel a client will
/// follow while the job waits for a worker.
pub struct TaskProducer {
    broker: Arc<dyn Broker>,
    channels: Arc<ChannelRegistry>,
    timing: TimingConfig,
    create_options: EnqueueOptions,
    exec_options: EnqueueOptions,
}

impl TaskProducer {
    pub fn new(
        broker: Arc<dyn Broker>,
        channels: Arc<ChannelRegistry>,
        timing: TimingConfig,
        create_options: EnqueueOptions,
        exec_options: EnqueueOptions,
    ) -> Self {
        TaskProducer {
            broker,
            channels,
            timing,
            create_options,
            exec_options,
        }
    }

    /// Reserves the `{user}:{template}:create` channel, submits the job and
    /// starts the pending heartbeat. The reservation comes first so a second
    /// concurrent call fails with `AlreadyPending` before anything reaches
    /// the broker; a broker failure releases it again.
    pub async fn enqueue_container_create(
        &self,
        user_id: u64,
        template: ContainerTemplate,
    ) -> TaskResult<TaskInfo> {
        let key = ChannelKey::create(user_id, template.id);
        let handle = self.reserve(&key)?;
        let _ = self
            .channels
            .try_send(&key, StatusMessage::new(Status::Pending).encode());

        let payload = ContainerCreatePayload { template, user_id };
        let info = self
            .submit(&handle, TYPE_CONTAINER_CREATE, &payload, &self.create_options)
            .await?;

        tokio::spawn(heartbeat(
            self.channels.clone(),
            handle,
            self.timing.heartbeat_interval,
            self.timing.heartbeat_deadline,
            Some(StatusMessage::new(Status::Pending).encode()),
        ));
        info!("container create {} queued for {}", info.id, key);
        Ok(info)
    }

    /// Reserves the `{user}:{template}:exec` channel and submits the job.
    /// The channel stays silent until the worker publishes verdicts, and is
    /// dropped at the heartbeat deadline if no worker claims it.
    pub async fn enqueue_container_exec(&self, payload: ContainerExecPayload) -> TaskResult<TaskInfo> {
        let key = ChannelKey::exec(payload.user_id, payload.template_id);
        let handle = self.reserve(&key)?;
        let info = self
            .submit(&handle, TYPE_CONTAINER_EXEC, &payload, &self.exec_options)
            .await?;

        tokio::spawn(heartbeat(
            self.channels.clone(),
            handle,
            self.timing.heartbeat_interval,
            self.timing.heartbeat_deadline,
            None,
        ));
        info!(
            "container exec {} queued for {} ({} scripts)",
            info.id,
            key,
            payload.scripts.len()
        );
        Ok(info)
    }

    fn reserve(&self, key: &ChannelKey) -> TaskResult<OperationHandle> {
        self.channels.create(key).map_err(|e| match e {
            ChannelError::AlreadyExists(key) => TaskError::AlreadyPending(key),
            other => TaskError::Channel(other),
        })
    }

    /// Enqueues `payload`; on failure the reservation behind `handle` is
    /// released so the pair can be retried.
    async fn submit<P: Serialize>(
        &self,
        handle: &OperationHandle,
        kind: &str,
        payload: &P,
        options: &EnqueueOptions,
    ) -> TaskResult<TaskInfo> {
        let submitted = match TaskMessage::new(kind, payload) {
            Ok(message) => self.broker.enqueue(message, options).await,
            Err(e) => Err(e),
        };
        submitted.map_err(|e| {
            let _ = self.channels.release(handle);
            warn!("enqueue {} failed, channel released: {}", handle.key, e);
            TaskError::Broker(e)
        })
    }
}

/// Emits `message` every `interval` until cancelled. At `deadline` an
/// unclaimed channel is released; a claimed one is left to its consumer.
async fn heartbeat(
    channels: Arc<ChannelRegistry>,
    handle: OperationHandle,
    interval: Duration,
    deadline: Duration,
    message: Option<String>,
) {
    let deadline = tokio::time::sleep(deadline);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = handle.heartbeat.cancelled() => {
                debug!("heartbeat for {} cancelled", handle.key);
                return;
            }
            _ = &mut deadline => {
                if channels.expire(&handle) {
                    warn!("no worker picked up {} before the heartbeat deadline", handle.key);
                }
                return;
            }
            _ = ticker.tick(), if message.is_some() => {
                let Some(message) = &message else { continue };
                match channels.try_send(&handle.key, message.clone()) {
                    Ok(true) => {}
                    Ok(false) => debug!("channel {} full, heartbeat dropped", handle.key),
                    Err(_) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::broker::{
        memory::MemoryBroker,
        types::{BrokerError, BrokerResult, FailOutcome},
    };
    use async_trait::async_trait;

    struct DownBroker;

    #[async_trait]
    impl Broker for DownBroker {
        async fn enqueue(&self, _: TaskMessage, _: &EnqueueOptions) -> BrokerResult<TaskInfo> {
            Err(BrokerError::Closed)
        }
        async fn dequeue(&self, _: &[String], _: Duration) -> BrokerResult<Option<TaskMessage>> {
            Err(BrokerError::Closed)
        }
        async fn complete(&self, _: &TaskMessage) -> BrokerResult<()> {
            Err(BrokerError::Closed)
        }
        async fn fail(&self, _: TaskMessage, _: String) -> BrokerResult<FailOutcome> {
            Err(BrokerError::Closed)
        }
    }

    fn template(id: u64) -> ContainerTemplate {
        ContainerTemplate {
            id,
            name: "test-container".to_string(),
            image: "os:test".to_string(),
            ..Default::default()
        }
    }

    fn producer(broker: Arc<dyn Broker>, channels: Arc<ChannelRegistry>) -> TaskProducer {
        TaskProducer::new(
            broker,
            channels,
            TimingConfig::default(),
            EnqueueOptions::default(),
            EnqueueOptions::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn create_enqueues_and_emits_pending() {
        let broker = Arc::new(MemoryBroker::new());
        let channels = Arc::new(ChannelRegistry::default());
        let producer = producer(broker.clone(), channels.clone());

        let info = producer.enqueue_container_create(1, template(1)).await.unwrap();
        assert_eq!(info.kind, TYPE_CONTAINER_CREATE);
        assert_eq!(info.max_retry, 1);
        assert_eq!(broker.pending("default"), 1);

        let mut subscription = channels.get(&ChannelKey::create(1, 1)).unwrap();
        assert_eq!(subscription.recv().await.unwrap(), r#"{"status":"Pending"}"#);
        // next one comes from the heartbeat tick
        assert_eq!(subscription.recv().await.unwrap(), r#"{"status":"Pending"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn payload_uses_wire_field_names() {
        let broker = Arc::new(MemoryBroker::new());
        let producer = producer(broker.clone(), Arc::new(ChannelRegistry::default()));
        producer.enqueue_container_create(3, template(8)).await.unwrap();

        let task = broker
            .dequeue(&["default".to_string()], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.payload["UserID"], 3);
        assert_eq!(task.payload["Template"]["id"], 8);
        let payload: ContainerCreatePayload = task.decode().unwrap();
        assert_eq!(payload.template.image, "os:test");
    }

    #[tokio::test(start_paused = true)]
    async fn second_create_is_already_pending() {
        let broker = Arc::new(MemoryBroker::new());
        let producer = producer(broker.clone(), Arc::new(ChannelRegistry::default()));

        producer.enqueue_container_create(1, template(1)).await.unwrap();
        let err = producer.enqueue_container_create(1, template(1)).await.unwrap_err();

        assert!(matches!(err, TaskError::AlreadyPending(ref key) if key == "1:1:create"));
        assert_eq!(broker.pending("default"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_creates_enqueue_once() {
        let broker = Arc::new(MemoryBroker::new());
        let producer = Arc::new(producer(broker.clone(), Arc::new(ChannelRegistry::default())));

        let (a, b) = tokio::join!(
            producer.enqueue_container_create(5, template(2)),
            producer.enqueue_container_create(5, template(2)),
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(a.err().or(b.err()), Some(TaskError::AlreadyPending(_))));
        assert_eq!(broker.pending("default"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_failure_leaves_no_channel() {
        let channels = Arc::new(ChannelRegistry::default());
        let producer = producer(Arc::new(DownBroker), channels.clone());

        let err = producer.enqueue_container_create(1, template(1)).await.unwrap_err();
        assert!(matches!(err, TaskError::Broker(_)));
        assert!(channels.is_empty());

        // and the pair is free to try again
        let producer = TaskProducer::new(
            Arc::new(MemoryBroker::new()),
            channels.clone(),
            TimingConfig::default(),
            EnqueueOptions::default(),
            EnqueueOptions::default(),
        );
        assert!(producer.enqueue_container_create(1, template(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_channel_closes_at_heartbeat_deadline() {
        let channels = Arc::new(ChannelRegistry::default());
        let producer = producer(Arc::new(MemoryBroker::new()), channels.clone());
        producer.enqueue_container_create(1, template(1)).await.unwrap();
        let mut subscription = channels.get(&ChannelKey::create(1, 1)).unwrap();

        let started = Instant::now();
        let mut pending = 0;
        while let Some(message) = subscription.recv().await {
            assert_eq!(message, r#"{"status":"Pending"}"#);
            pending += 1;
        }

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(pending > 100);
        assert!(channels.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_channel_outlives_heartbeat_deadline() {
        let channels = Arc::new(ChannelRegistry::default());
        let producer = producer(Arc::new(MemoryBroker::new()), channels.clone());
        producer.enqueue_container_create(1, template(1)).await.unwrap();

        let key = ChannelKey::create(1, 1);
        channels.claim(&key).unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(channels.contains(&key));
    }

    fn exec_payload() -> ContainerExecPayload {
        ContainerExecPayload {
            instance: crate::lib::model::types::ContainerInstance::pending(
                2,
                "cid".to_string(),
                "lab".to_string(),
                "tok".to_string(),
            ),
            scripts: Vec::new(),
            user_id: 1,
            template_id: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exec_reserves_a_silent_channel() {
        let broker = Arc::new(MemoryBroker::new());
        let channels = Arc::new(ChannelRegistry::default());
        let producer = producer(broker.clone(), channels.clone());

        let info = producer.enqueue_container_exec(exec_payload()).await.unwrap();
        assert_eq!(info.kind, TYPE_CONTAINER_EXEC);
        assert_eq!(broker.pending("default"), 1);

        let key = ChannelKey::exec(1, 2);
        assert!(channels.contains(&key));
        let mut subscription = channels.get(&key).unwrap();
        // no heartbeat messages on an exec channel; it closes unclaimed at the deadline
        let started = Instant::now();
        assert_eq!(subscription.recv().await, None);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(channels.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_exec_while_first_is_live_is_already_pending() {
        let broker = Arc::new(MemoryBroker::new());
        let producer = producer(broker.clone(), Arc::new(ChannelRegistry::default()));

        producer.enqueue_container_exec(exec_payload()).await.unwrap();
        let err = producer.enqueue_container_exec(exec_payload()).await.unwrap_err();

        assert!(matches!(err, TaskError::AlreadyPending(ref key) if key == "1:2:exec"));
        assert_eq!(broker.pending("default"), 1);
    }

    #[tokio::test]
    async fn exec_broker_failure_leaves_no_channel() {
        let channels = Arc::new(ChannelRegistry::default());
        let producer = producer(Arc::new(DownBroker), channels.clone());

        let err = producer.enqueue_container_exec(exec_payload()).await.unwrap_err();
        assert!(matches!(err, TaskError::Broker(_)));
        assert!(channels.is_empty());
    }
}
