use async_trait::async_trait;
use parking_lot::RwLock;

use super::types::{
    InstanceRepository, RepositoryError, RepositoryResult, ScriptRepository, TemplateRepository,
};
use crate::lib::model::types::{ContainerInstance, ContainerScript, ContainerTemplate};

/// Process-local stand-in for the catalog and instance tables.
#[derive(Default)]
pub struct MemoryRepository {
    templates: RwLock<Vec<ContainerTemplate>>,
    scripts: RwLock<Vec<ContainerScript>>,
    instances: RwLock<Vec<ContainerInstance>>,
}

impl MemoryRepository {
    pub fn new(templates: Vec<ContainerTemplate>, scripts: Vec<ContainerScript>) -> Self {
        MemoryRepository {
            templates: RwLock::new(templates),
            scripts: RwLock::new(scripts),
            instances: RwLock::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub fn add_script(&self, script: ContainerScript) {
        self.scripts.write().push(script);
    }

    #[cfg(test)]
    pub fn instances(&self) -> Vec<ContainerInstance> {
        self.instances.read().clone()
    }
}

#[async_trait]
impl InstanceRepository for MemoryRepository {
    async fn create_instance(&self, mut instance: ContainerInstance) -> RepositoryResult<ContainerInstance> {
        let mut instances = self.instances.write();
        instance.id = instances.len() as u64 + 1;
        instances.push(instance.clone());
        Ok(instance)
    }

    async fn get_by_user_and_template(
        &self,
        user_id: u64,
        template_id: u64,
    ) -> RepositoryResult<ContainerInstance> {
        self.instances
            .read()
            .iter()
            .rev()
            .find(|instance| instance.user_id == user_id && instance.template_id == template_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "container instance",
                id: format!("user {} template {}", user_id, template_id),
            })
    }
}

#[async_trait]
impl TemplateRepository for MemoryRepository {
    async fn get_template(&self, template_id: u64) -> RepositoryResult<ContainerTemplate> {
        self.templates
            .read()
            .iter()
            .find(|template| template.id == template_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "container template",
                id: template_id.to_string(),
            })
    }
}

#[async_trait]
impl ScriptRepository for MemoryRepository {
    async fn get_scripts_by_template(&self, template_id: u64) -> RepositoryResult<Vec<ContainerScript>> {
        let mut scripts: Vec<_> = self
            .scripts
            .read()
            .iter()
            .filter(|script| script.template_id == template_id)
            .cloned()
            .collect();
        scripts.sort_by_key(|script| script.order);
        Ok(scripts)
    }
}
