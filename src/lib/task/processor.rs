use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::types::{
    ContainerCreatePayload, ContainerExecPayload, TYPE_CONTAINER_CREATE, TYPE_CONTAINER_EXEC,
    TaskError, TaskResult, TimingConfig,
};
use crate::lib::{
    broker::types::TaskMessage,
    channel::{
        registry::ChannelRegistry,
        types::{ChannelError, ChannelKey, OperationHandle, Status, StatusMessage},
    },
    engine::types::ContainerEngine,
    repository::types::InstanceRepository,
    worker::types::TaskHandler,
};

/// Consumes container jobs: drives the engine, persists the instance and
/// reports progress on the job's status channel.
pub struct ContainerProcessor {
    engine: Arc<dyn ContainerEngine>,
    channels: Arc<ChannelRegistry>,
    instances: Arc<dyn InstanceRepository>,
    timing: TimingConfig,
}

/// Releases the channel generation it holds when dropped, whichever way
/// the handler exits.
struct ChannelLease {
    channels: Arc<ChannelRegistry>,
    handle: OperationHandle,
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Err(e) = self.channels.release(&self.handle) {
            debug!("release on exit: {}", e);
        }
    }
}

impl ContainerProcessor {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        channels: Arc<ChannelRegistry>,
        instances: Arc<dyn InstanceRepository>,
        timing: TimingConfig,
    ) -> Self {
        ContainerProcessor {
            engine,
            channels,
            instances,
            timing,
        }
    }

    pub async fn handle_container_create(&self, payload: ContainerCreatePayload) -> TaskResult<()> {
        let key = ChannelKey::create(payload.user_id, payload.template.id);
        let lease = match self.channels.claim(&key) {
            Ok(handle) => Some(ChannelLease {
                channels: self.channels.clone(),
                handle,
            }),
            Err(e) => {
                warn!("{}; provisioning without a status channel", e);
                None
            }
        };

        let mut instance = self
            .engine
            .create_container(&payload.template)
            .await
            .map_err(|source| {
                warn!("create stage failed for {}: {}", key, source);
                TaskError::Engine { stage: "create", source }
            })?;

        if let Err(source) = self.engine.start_container(&mut instance).await {
            warn!("start stage failed for {} ({}): {}", key, instance.name, source);
            if let Err(e) = self.engine.remove_container(&mut instance).await {
                warn!("cleanup of unstarted container {} failed: {}", instance.name, e);
            }
            return Err(TaskError::Engine { stage: "start", source });
        }

        instance.user_id = payload.user_id;
        instance.template_id = payload.template.id;
        let container_id = instance.container_id.clone();
        let instance = self.instances.create_instance(instance).await.map_err(|source| {
            error!(
                "persist stage failed for {}: container {} is running without a record: {}",
                key, container_id, source
            );
            TaskError::Persistence {
                container_id: container_id.clone(),
                source,
            }
        })?;
        info!(
            "instance {} ({}) running for user {} at {}",
            instance.id, instance.name, instance.user_id, instance.ip_address
        );

        if let Some(lease) = &lease {
            lease.handle.heartbeat.cancel();
            self.running_burst(&lease.handle.key).await;
        }
        Ok(())
    }

    /// Repeats `Running` for the burst window so a late subscriber still
    /// sees it. The first message waits for buffer room, repeats do not.
    async fn running_burst(&self, key: &ChannelKey) {
        let message = StatusMessage::new(Status::Running).encode();
        let deadline = Instant::now() + self.timing.running_burst;

        match tokio::time::timeout_at(deadline, self.channels.send(key, message.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("running status not delivered: {}", e);
                return;
            }
            Err(_) => {
                warn!("channel {} stayed full, running status not delivered", key);
                return;
            }
        }

        let interval = self.timing.running_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => return,
                _ = ticker.tick() => {
                    if self.channels.try_send(key, message.clone()).is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Runs every script in order and reports one verdict per script. A
    /// failing or erroring script does not stop the ones after it.
    pub async fn handle_container_exec(&self, payload: ContainerExecPayload) -> TaskResult<()> {
        let key = ChannelKey::exec(payload.user_id, payload.template_id);
        let handle = match self.channels.claim(&key) {
            Ok(handle) => handle,
            Err(ChannelError::NotFound(_)) => {
                debug!("no reserved channel for {}, opening one", key);
                self.channels.create(&key)?
            }
            Err(e) => return Err(e.into()),
        };
        handle.heartbeat.cancel();
        let _lease = ChannelLease {
            channels: self.channels.clone(),
            handle,
        };

        let mut publishing = true;
        let mut passed = 0;
        for (order, script) in payload.scripts.iter().enumerate() {
            let status = match self.engine.exec_command(&payload.instance, script).await {
                Ok(outcome) if outcome.passed() => {
                    passed += 1;
                    Status::Pass
                }
                Ok(outcome) => {
                    debug!("script {} on {}: {:?}", order, key, outcome);
                    Status::Fail
                }
                Err(e) if e.is_timeout() => {
                    warn!("script {} on {} timed out: {}", order, key, e);
                    Status::Fail
                }
                Err(e) => {
                    warn!("script {} on {} could not finish: {}", order, key, e);
                    Status::Fail
                }
            };

            if publishing {
                publishing = self.publish_verdict(&key, order, status).await;
            }
        }

        info!("{}: {}/{} scripts passed", key, passed, payload.scripts.len());
        Ok(())
    }

    /// Waits up to the verdict timeout for buffer room. Returns whether
    /// later verdicts are still worth sending.
    async fn publish_verdict(&self, key: &ChannelKey, order: usize, status: Status) -> bool {
        let message = StatusMessage::new(status).encode();
        match tokio::time::timeout(self.timing.verdict_timeout, self.channels.send(key, message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("verdict for script {} on {} not delivered: {}", order, key, e);
                false
            }
            Err(_) => {
                warn!("nobody is reading {}, dropping remaining verdicts", key);
                false
            }
        }
    }
}

#[async_trait]
impl TaskHandler for ContainerProcessor {
    async fn process(&self, task: &TaskMessage) -> TaskResult<()> {
        match task.kind.as_str() {
            TYPE_CONTAINER_CREATE => self.handle_container_create(task.decode()?).await,
            TYPE_CONTAINER_EXEC => self.handle_container_exec(task.decode()?).await,
            other => Err(TaskError::UnknownKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::{
        engine::fake::FakeEngine,
        model::types::{ContainerInstance, ContainerScript, ContainerTemplate, InstanceStatus},
        repository::{
            memory::MemoryRepository,
            types::{RepositoryError, RepositoryResult},
        },
    };
    use std::time::Duration;

    struct BrokenStore;

    #[async_trait]
    impl InstanceRepository for BrokenStore {
        async fn create_instance(&self, _: ContainerInstance) -> RepositoryResult<ContainerInstance> {
            Err(RepositoryError::Storage("disk full".to_string()))
        }
        async fn get_by_user_and_template(&self, _: u64, _: u64) -> RepositoryResult<ContainerInstance> {
            Err(RepositoryError::Storage("disk full".to_string()))
        }
    }

    fn template() -> ContainerTemplate {
        ContainerTemplate {
            id: 1,
            name: "test-container".to_string(),
            image: "os:test".to_string(),
            ..Default::default()
        }
    }

    fn processor(
        engine: Arc<FakeEngine>,
        instances: Arc<dyn InstanceRepository>,
    ) -> (ContainerProcessor, Arc<ChannelRegistry>) {
        let channels = Arc::new(ChannelRegistry::default());
        let processor = ContainerProcessor::new(engine, channels.clone(), instances, TimingConfig::default());
        (processor, channels)
    }

    fn create_payload() -> ContainerCreatePayload {
        ContainerCreatePayload {
            template: template(),
            user_id: 1,
        }
    }

    async fn drain(mut subscription: crate::lib::channel::types::Subscription) -> Vec<String> {
        let mut messages = Vec::new();
        while let Some(message) = subscription.recv().await {
            messages.push(message);
        }
        messages
    }

    #[tokio::test(start_paused = true)]
    async fn create_persists_running_instance_and_closes_channel() {
        let repo = Arc::new(MemoryRepository::default());
        let (processor, channels) = processor(Arc::new(FakeEngine::default()), repo.clone());
        let key = ChannelKey::create(1, 1);
        let handle = channels.create(&key).unwrap();
        let subscription = channels.get(&key).unwrap();

        let started = Instant::now();
        processor.handle_container_create(create_payload()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(handle.heartbeat.is_cancelled());
        assert!(!channels.contains(&key));

        let messages = drain(subscription).await;
        assert!(!messages.is_empty());
        assert!(messages.iter().all(|m| m == r#"{"status":"Running"}"#));

        let stored = repo.get_by_user_and_template(1, 1).await.unwrap();
        assert_eq!(stored.status, InstanceStatus::Running);
        assert_eq!(stored.template_id, 1);
        assert!(!stored.token.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn create_without_channel_still_provisions() {
        let repo = Arc::new(MemoryRepository::default());
        let (processor, channels) = processor(Arc::new(FakeEngine::default()), repo.clone());

        processor.handle_container_create(create_payload()).await.unwrap();

        assert!(channels.is_empty());
        assert_eq!(repo.instances().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_failure_still_cleans_up_channel() {
        let engine = Arc::new(FakeEngine {
            fail_start: true,
            ..Default::default()
        });
        let repo = Arc::new(MemoryRepository::default());
        let (processor, channels) = processor(engine.clone(), repo.clone());
        let key = ChannelKey::create(1, 1);
        let handle = channels.create(&key).unwrap();

        let err = processor.handle_container_create(create_payload()).await.unwrap_err();

        assert!(matches!(err, TaskError::Engine { stage: "start", .. }));
        assert!(handle.heartbeat.is_cancelled());
        assert!(!channels.contains(&key));
        assert!(repo.instances().is_empty());
        assert!(engine.containers.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_is_reported() {
        let engine = Arc::new(FakeEngine::default());
        let (processor, channels) = processor(engine.clone(), Arc::new(BrokenStore));
        channels.create(&ChannelKey::create(1, 1)).unwrap();

        let err = processor.handle_container_create(create_payload()).await.unwrap_err();

        assert!(matches!(err, TaskError::Persistence { .. }));
        assert!(channels.is_empty());
        // the running container is left behind for an operator
        assert_eq!(engine.containers.lock().len(), 1);
    }

    fn exec_payload(contents: &[&str]) -> ContainerExecPayload {
        let mut instance =
            ContainerInstance::pending(1, "fake-lab".to_string(), "lab".to_string(), "tok".to_string());
        instance.status = InstanceStatus::Running;
        ContainerExecPayload {
            instance,
            scripts: contents
                .iter()
                .enumerate()
                .map(|(order, content)| ContainerScript {
                    content: content.to_string(),
                    order: order as u32,
                    timeout_secs: 1,
                    ..Default::default()
                })
                .collect(),
            user_id: 1,
            template_id: 1,
        }
    }

    fn slow_engine() -> Arc<FakeEngine> {
        Arc::new(FakeEngine {
            exec_delay: Duration::from_millis(10),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn exec_runs_every_script_in_order() {
        let engine = slow_engine();
        let (processor, channels) = processor(engine.clone(), Arc::new(MemoryRepository::default()));
        let key = ChannelKey::exec(1, 1);

        let reader = {
            let channels = channels.clone();
            let key = key.clone();
            tokio::spawn(async move {
                loop {
                    if let Ok(subscription) = channels.get(&key) {
                        return drain(subscription).await;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        processor
            .handle_container_exec(exec_payload(&["exit 0", "exit 0", "exit 1", "exit 0"]))
            .await
            .unwrap();

        assert_eq!(engine.executed(), vec!["exit 0", "exit 0", "exit 1", "exit 0"]);
        assert_eq!(
            reader.await.unwrap(),
            vec![
                r#"{"status":"Pass"}"#,
                r#"{"status":"Pass"}"#,
                r#"{"status":"Fail"}"#,
                r#"{"status":"Pass"}"#,
            ]
        );
        assert!(!channels.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_script_counts_as_fail_and_execution_continues() {
        let engine = slow_engine();
        let (processor, channels) = processor(engine.clone(), Arc::new(MemoryRepository::default()));

        let started = Instant::now();
        let run = processor.handle_container_exec(exec_payload(&["sleep 5", "echo ok"]));
        let key = ChannelKey::exec(1, 1);
        let (result, messages) = tokio::join!(run, async {
            loop {
                if let Ok(subscription) = channels.get(&key) {
                    return drain(subscription).await;
                }
                tokio::task::yield_now().await;
            }
        });

        result.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(messages, vec![r#"{"status":"Fail"}"#, r#"{"status":"Pass"}"#]);
        assert_eq!(engine.executed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exec_claims_the_reserved_channel() {
        let (processor, channels) = processor(slow_engine(), Arc::new(MemoryRepository::default()));
        let key = ChannelKey::exec(1, 1);
        let reserved = channels.create(&key).unwrap();
        let subscription = channels.get(&key).unwrap();

        let (result, messages) = tokio::join!(
            processor.handle_container_exec(exec_payload(&["exit 0", "exit 3"])),
            drain(subscription),
        );

        result.unwrap();
        assert_eq!(messages, vec![r#"{"status":"Pass"}"#, r#"{"status":"Fail"}"#]);
        assert!(reserved.heartbeat.is_cancelled());
        assert!(!channels.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn unread_verdicts_do_not_block_the_worker() {
        let engine = Arc::new(FakeEngine::default());
        let channels = Arc::new(ChannelRegistry::new(1));
        let processor = ContainerProcessor::new(
            engine.clone(),
            channels.clone(),
            Arc::new(MemoryRepository::default()),
            TimingConfig::default(),
        );

        let started = Instant::now();
        processor
            .handle_container_exec(exec_payload(&["exit 0", "exit 0", "exit 0", "exit 0"]))
            .await
            .unwrap();

        // one verdict fits, the next waits out the timeout, the rest are skipped
        let verdict_timeout = TimingConfig::default().verdict_timeout;
        assert!(started.elapsed() >= verdict_timeout);
        assert!(started.elapsed() < verdict_timeout * 2);
        assert_eq!(engine.executed().len(), 4);
        assert!(channels.is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let (processor, _) =
            processor(Arc::new(FakeEngine::default()), Arc::new(MemoryRepository::default()));
        let task = TaskMessage::new("experiment:exec", &serde_json::json!({})).unwrap();
        assert!(matches!(
            processor.process(&task).await,
            Err(TaskError::UnknownKind(kind)) if kind == "experiment:exec"
        ));
    }
}
