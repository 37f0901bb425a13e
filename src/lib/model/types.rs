use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Error,
    Removed,
}

/// Catalog entry describing how to build a sandbox.
///
/// `volumes`, `ports` and `envs` are `;`-separated lists of `key:value`
/// pairs, e.g. `"3001:3000;8081:8080"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerTemplate {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub image: String,
    pub default_cmd: String,
    pub volumes: String,
    pub ports: String,
    pub envs: String,
    pub sudo_pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub id: u64,
    pub user_id: u64,
    pub section_id: u64,
    pub template_id: u64,
    pub container_id: String,
    pub status: InstanceStatus,
    pub name: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub ip_address: String,
    pub token: String,
}

impl ContainerInstance {
    pub fn pending(template_id: u64, container_id: String, name: String, token: String) -> Self {
        ContainerInstance {
            id: 0,
            user_id: 0,
            section_id: 0,
            template_id,
            container_id,
            status: InstanceStatus::Pending,
            name,
            start_at: Utc::now(),
            end_at: None,
            ip_address: String::new(),
            token,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    #[default]
    Contains,
    Equals,
    Regex,
}

/// One verification step run inside an instance. `expected_output` and
/// `match_type` are carried but grading only looks at the exit code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerScript {
    pub id: u64,
    pub template_id: u64,
    pub section_id: u64,
    pub content: String,
    pub expected_output: String,
    pub match_type: MatchType,
    pub timeout_secs: u64,
    pub order: u32,
    pub description: String,
}

impl Default for ContainerScript {
    fn default() -> Self {
        ContainerScript {
            id: 0,
            template_id: 0,
            section_id: 0,
            content: String::new(),
            expected_output: String::new(),
            match_type: MatchType::default(),
            timeout_secs: DEFAULT_SCRIPT_TIMEOUT_SECS,
            order: 0,
            description: String::new(),
        }
    }
}
