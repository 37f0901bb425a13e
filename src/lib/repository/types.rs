use async_trait::async_trait;

use crate::lib::model::types::{ContainerInstance, ContainerScript, ContainerTemplate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Stores a new instance row and returns it with its assigned id.
    async fn create_instance(&self, instance: ContainerInstance) -> RepositoryResult<ContainerInstance>;

    /// Latest instance created for the (user, template) pair.
    async fn get_by_user_and_template(
        &self,
        user_id: u64,
        template_id: u64,
    ) -> RepositoryResult<ContainerInstance>;
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get_template(&self, template_id: u64) -> RepositoryResult<ContainerTemplate>;
}

#[async_trait]
pub trait ScriptRepository: Send + Sync {
    /// Scripts bound to a template, sorted by their declared order.
    async fn get_scripts_by_template(&self, template_id: u64) -> RepositoryResult<Vec<ContainerScript>>;
}
