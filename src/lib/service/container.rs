use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use super::types::{ContainerService, CreationStatus, ServiceConfig, ServiceError, ServiceResult};
use crate::lib::{
    broker::types::TaskInfo,
    channel::{
        registry::ChannelRegistry,
        types::{ChannelError, ChannelKey, ChannelKind, Subscription},
    },
    model::types::ContainerInstance,
    repository::types::{InstanceRepository, RepositoryError, ScriptRepository, TemplateRepository},
    task::{producer::TaskProducer, types::ContainerExecPayload},
};

impl ContainerService {
    pub fn new(
        producer: Arc<TaskProducer>,
        channels: Arc<ChannelRegistry>,
        templates: Arc<dyn TemplateRepository>,
        scripts: Arc<dyn ScriptRepository>,
        instances: Arc<dyn InstanceRepository>,
        config: ServiceConfig,
    ) -> Self {
        ContainerService {
            producer,
            channels,
            templates,
            scripts,
            instances,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub async fn create_container(&self, user_id: u64, template_id: u64) -> ServiceResult<TaskInfo> {
        let template = self.templates.get_template(template_id).await?;
        let info = self.producer.enqueue_container_create(user_id, template).await?;
        info!("user {} requested template {} (task {})", user_id, template_id, info.id);
        Ok(info)
    }

    pub async fn get_container(&self, user_id: u64, template_id: u64) -> ServiceResult<ContainerInstance> {
        Ok(self.instances.get_by_user_and_template(user_id, template_id).await?)
    }

    pub fn access_url(&self, instance: &ContainerInstance) -> String {
        format!(
            "http://{}:{}/?tkn={}",
            instance.ip_address, self.config.access_port, instance.token
        )
    }

    /// Queues the template's scripts against the user's instance and
    /// attaches to the exec channel the producer reserved for them.
    pub async fn check_container(&self, user_id: u64, template_id: u64) -> ServiceResult<Subscription> {
        let instance = self.instances.get_by_user_and_template(user_id, template_id).await?;
        let mut scripts = self.scripts.get_scripts_by_template(template_id).await?;
        scripts.sort_by_key(|script| script.order);

        let payload = ContainerExecPayload {
            instance,
            scripts,
            user_id,
            template_id,
        };
        self.producer.enqueue_container_exec(payload).await?;

        self.acquire(&ChannelKey::exec(user_id, template_id)).await
    }

    /// Tries `key` now and then every acquire interval until the acquire
    /// window runs out. Only a missing channel is retried.
    pub async fn acquire(&self, key: &ChannelKey) -> ServiceResult<Subscription> {
        let deadline = Instant::now() + self.config.acquire_window;
        loop {
            match self.channels.get(key) {
                Ok(subscription) => return Ok(subscription),
                Err(ChannelError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() + self.config.acquire_interval > deadline {
                debug!("gave up waiting for channel {}", key);
                return Err(ServiceError::AcquireTimeout);
            }
            tokio::time::sleep(self.config.acquire_interval).await;
        }
    }

    pub fn subscribe(&self, user_id: u64, template_id: u64, kind: ChannelKind) -> ServiceResult<Subscription> {
        Ok(self.channels.get(&ChannelKey::new(user_id, template_id, kind))?)
    }

    /// Live create channel if there is one, otherwise the persisted
    /// instance. Neither means the creation never started.
    pub async fn creation_status(&self, user_id: u64, template_id: u64) -> ServiceResult<CreationStatus> {
        match self.subscribe(user_id, template_id, ChannelKind::Create) {
            Ok(subscription) => Ok(CreationStatus::Live(subscription)),
            Err(ServiceError::NoChannel(key)) => {
                match self.instances.get_by_user_and_template(user_id, template_id).await {
                    Ok(instance) => Ok(CreationStatus::Settled(instance)),
                    Err(RepositoryError::NotFound { .. }) => {
                        Err(ServiceError::NotFound(format!("no container creation for {}", key)))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e),
        }
    }
}
