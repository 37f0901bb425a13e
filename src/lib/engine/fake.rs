use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    config::{generate_name, generate_token, new_config},
    types::{ContainerEngine, EngineError, EngineResult, ExecOutcome},
};
use crate::lib::model::types::{ContainerInstance, ContainerScript, ContainerTemplate, InstanceStatus};

/// In-process engine for tests. Script content of the form `exit N` exits
/// with `N`, `sleep N` exceeds any timeout shorter than `N` seconds, and
/// anything else passes.
#[derive(Default)]
pub struct FakeEngine {
    pub containers: Mutex<HashMap<String, InstanceStatus>>,
    pub executed: Mutex<Vec<String>>,
    pub fail_create: bool,
    pub fail_start: bool,
    pub create_delay: Duration,
    pub exec_delay: Duration,
}

impl FakeEngine {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

fn refused() -> EngineError {
    EngineError::MissingContainer("refused by fake engine".to_string())
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_container(&self, template: &ContainerTemplate) -> EngineResult<ContainerInstance> {
        tokio::time::sleep(self.create_delay).await;
        if self.fail_create {
            return Err(refused());
        }
        let name = generate_name(&template.name);
        let token = generate_token();
        new_config(template, name.clone(), &token, "123456")?;

        let id = format!("fake-{}", name);
        self.containers.lock().insert(id.clone(), InstanceStatus::Pending);
        Ok(ContainerInstance::pending(template.id, id, name, token))
    }

    async fn start_container(&self, instance: &mut ContainerInstance) -> EngineResult<()> {
        if self.fail_start {
            return Err(refused());
        }
        self.containers
            .lock()
            .insert(instance.container_id.clone(), InstanceStatus::Running);
        instance.status = InstanceStatus::Running;
        instance.ip_address = "172.17.0.2".to_string();
        Ok(())
    }

    async fn stop_container(&self, instance: &mut ContainerInstance) -> EngineResult<()> {
        self.containers
            .lock()
            .insert(instance.container_id.clone(), InstanceStatus::Stopped);
        instance.status = InstanceStatus::Stopped;
        Ok(())
    }

    async fn remove_container(&self, instance: &mut ContainerInstance) -> EngineResult<()> {
        self.containers.lock().remove(&instance.container_id);
        instance.status = InstanceStatus::Removed;
        Ok(())
    }

    async fn exists(&self, name: &str) -> EngineResult<bool> {
        Ok(self.containers.lock().keys().any(|id| id.ends_with(name)))
    }

    async fn exec_command(
        &self,
        _instance: &ContainerInstance,
        script: &ContainerScript,
    ) -> EngineResult<ExecOutcome> {
        tokio::time::sleep(self.exec_delay).await;
        self.executed.lock().push(script.content.clone());

        let mut words = script.content.split_whitespace();
        match (words.next(), words.next().and_then(|n| n.parse::<i64>().ok())) {
            (Some("exit"), Some(code)) => Ok(ExecOutcome::from_exit_code(code)),
            (Some("sleep"), Some(secs)) if secs as u64 > script.timeout_secs => {
                let timeout = Duration::from_secs(script.timeout_secs);
                tokio::time::sleep(timeout).await;
                Err(EngineError::ExecTimeout(timeout))
            }
            _ => Ok(ExecOutcome::Passed),
        }
    }
}
