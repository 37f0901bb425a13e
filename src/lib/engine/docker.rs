use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions},
    models::{ContainerInspectResponse, HostConfig, Mount, MountTypeEnum, PortBinding},
};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    config::{generate_name, generate_token, new_config},
    exec::{exec_marker, kill_command, poll_exec},
    types::{
        ContainerConfig, ContainerEngine, DockerEngine, EngineConfig, EngineError, EngineResult,
        ExecOutcome, ExecProgress,
    },
};
use crate::lib::model::{
    state::valid_status_transition,
    types::{ContainerInstance, ContainerScript, ContainerTemplate, InstanceStatus},
};

impl DockerEngine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(DockerEngine { client, config })
    }

    async fn ip_address(&self, container_id: &str) -> EngineResult<String> {
        let info = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        Ok(ip_address_of(&info))
    }

    fn ensure_transition(instance: &ContainerInstance, to: InstanceStatus) -> EngineResult<()> {
        if valid_status_transition(instance.status, to) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                name: instance.name.clone(),
                from: instance.status,
                to,
            })
        }
    }
}

fn ip_address_of(info: &ContainerInspectResponse) -> String {
    info.network_settings
        .as_ref()
        .and_then(|settings| settings.networks.as_ref())
        .and_then(|networks| {
            networks
                .values()
                .filter_map(|endpoint| endpoint.ip_address.clone())
                .find(|ip| !ip.is_empty())
        })
        .unwrap_or_default()
}

fn container_id(instance: &ContainerInstance) -> EngineResult<&str> {
    if instance.container_id.is_empty() {
        return Err(EngineError::MissingContainer(instance.name.clone()));
    }
    Ok(&instance.container_id)
}

fn docker_config(config: &ContainerConfig) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &config.ports {
        exposed_ports.insert(port.container_port.clone(), HashMap::new());
        port_bindings.insert(
            port.container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.host_port.clone()),
            }]),
        );
    }

    let mounts = config
        .mounts
        .iter()
        .map(|mount| Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(mount.source.clone()),
            target: Some(mount.target.clone()),
            ..Default::default()
        })
        .collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        mounts: Some(mounts),
        ..Default::default()
    };

    Config {
        image: Some(config.image.clone()),
        cmd: config.cmd.clone(),
        env: Some(config.env.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_container(&self, template: &ContainerTemplate) -> EngineResult<ContainerInstance> {
        let name = generate_name(&template.name);
        let token = generate_token();
        let config = new_config(template, name.clone(), &token, &self.config.sudo_password)?;

        let options = Some(CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        });
        let response = self
            .client
            .create_container(options, docker_config(&config))
            .await?;
        for warning in &response.warnings {
            warn!("create {}: {}", name, warning);
        }
        info!("container {} created from {} ({})", name, template.image, response.id);

        let mut instance = ContainerInstance::pending(template.id, response.id, name, token);
        match self.ip_address(&instance.container_id).await {
            Ok(ip) => instance.ip_address = ip,
            Err(e) => warn!("failed to inspect container {}: {}", instance.name, e),
        }

        Ok(instance)
    }

    async fn start_container(&self, instance: &mut ContainerInstance) -> EngineResult<()> {
        let id = container_id(instance)?.to_string();
        Self::ensure_transition(instance, InstanceStatus::Running)?;

        self.client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await?;
        instance.status = InstanceStatus::Running;
        info!("container {} started", instance.name);

        match self.ip_address(&id).await {
            Ok(ip) => instance.ip_address = ip,
            Err(e) => warn!("failed to inspect container {}: {}", instance.name, e),
        }
        Ok(())
    }

    async fn stop_container(&self, instance: &mut ContainerInstance) -> EngineResult<()> {
        let id = container_id(instance)?.to_string();
        Self::ensure_transition(instance, InstanceStatus::Stopped)?;

        let options = StopContainerOptions {
            t: self.config.stop_timeout.as_secs() as i64,
        };
        self.client.stop_container(&id, Some(options)).await?;

        instance.status = InstanceStatus::Stopped;
        instance.end_at = Some(Utc::now());
        info!("container {} stopped", instance.name);
        Ok(())
    }

    async fn remove_container(&self, instance: &mut ContainerInstance) -> EngineResult<()> {
        let id = container_id(instance)?.to_string();
        Self::ensure_transition(instance, InstanceStatus::Removed)?;

        if instance.status == InstanceStatus::Running {
            if let Err(e) = self.stop_container(instance).await {
                warn!("graceful stop of {} failed, forcing removal: {}", instance.name, e);
            }
        }

        let options = RemoveContainerOptions {
            v: true,
            force: true,
            ..Default::default()
        };
        self.client.remove_container(&id, Some(options)).await?;

        instance.status = InstanceStatus::Removed;
        instance.end_at = Some(Utc::now());
        info!("container {} removed", instance.name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> EngineResult<bool> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(!containers.is_empty())
    }

    async fn exec_command(
        &self,
        instance: &ContainerInstance,
        script: &ContainerScript,
    ) -> EngineResult<ExecOutcome> {
        let id = container_id(instance)?;
        let marker = exec_marker(&Uuid::new_v4().simple().to_string());

        let exec = self
            .client
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        script.content.clone(),
                    ]),
                    env: Some(vec![marker.clone()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        self.client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        debug!("exec {} started in {}", exec.id, instance.name);

        let timeout = match script.timeout_secs {
            0 => self.config.default_script_timeout,
            secs => std::time::Duration::from_secs(secs),
        };

        let client = &self.client;
        let exec_id = exec.id.as_str();
        let result = poll_exec(self.config.exec_poll_interval, timeout, move || async move {
            let inspect = client.inspect_exec(exec_id).await?;
            Ok::<_, EngineError>(match inspect.running {
                Some(true) => ExecProgress::Running,
                _ => ExecProgress::Exited(inspect.exit_code.unwrap_or(-1)),
            })
        })
        .await;

        if matches!(&result, Err(e) if e.is_timeout()) {
            if let Err(e) = self.kill_exec(id, &marker).await {
                warn!("could not kill timed out exec {} in {}: {}", exec.id, instance.name, e);
            }
        }
        result
    }
}

impl DockerEngine {
    /// Fires a detached exec that kills every process tagged with `marker`.
    async fn kill_exec(&self, container_id: &str, marker: &str) -> EngineResult<()> {
        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(kill_command(marker)),
                    ..Default::default()
                },
            )
            .await?;
        self.client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        debug!("kill exec {} sent to {}", exec.id, container_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::engine::types::{BindMount, PortMapping};
    use std::time::{Duration, Instant};

    #[test]
    fn docker_config_binds_ports_and_mounts() {
        let config = ContainerConfig {
            name: "lab-abc".to_string(),
            image: "os:test".to_string(),
            cmd: None,
            env: vec!["CONNECTION_TOKEN=t".to_string()],
            ports: vec![PortMapping {
                host_port: "3001".to_string(),
                container_port: "3000/tcp".to_string(),
            }],
            mounts: vec![BindMount {
                source: "/srv/course".to_string(),
                target: "/course".to_string(),
            }],
        };

        let docker = docker_config(&config);
        assert_eq!(docker.image.as_deref(), Some("os:test"));
        assert!(docker.exposed_ports.unwrap().contains_key("3000/tcp"));

        let host = docker.host_config.unwrap();
        let binding = &host.port_bindings.unwrap()["3000/tcp"];
        assert_eq!(
            binding.as_ref().unwrap()[0].host_port.as_deref(),
            Some("3001")
        );
        let mount = &host.mounts.unwrap()[0];
        assert_eq!(mount.typ, Some(MountTypeEnum::BIND));
        assert_eq!(mount.target.as_deref(), Some("/course"));
    }

    #[test]
    fn missing_container_id_is_rejected() {
        let instance = ContainerInstance::pending(1, String::new(), "n".to_string(), "t".to_string());
        assert!(matches!(container_id(&instance), Err(EngineError::MissingContainer(_))));
    }

    fn live_template() -> ContainerTemplate {
        ContainerTemplate {
            id: 1,
            name: "sandboxd-test".to_string(),
            image: std::env::var("SANDBOXD_TEST_IMAGE").unwrap_or_else(|_| "alpine:3.20".to_string()),
            default_cmd: "sleep 300".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "needs a docker daemon"]
    async fn live_container_lifecycle_and_exec() {
        let engine = DockerEngine::new(EngineConfig::default()).unwrap();
        let mut instance = engine.create_container(&live_template()).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert!(engine.exists(&instance.name).await.unwrap());

        engine.start_container(&mut instance).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);

        let ok = ContainerScript {
            content: "echo hello".to_string(),
            ..Default::default()
        };
        assert!(engine.exec_command(&instance, &ok).await.unwrap().passed());

        let failing = ContainerScript {
            content: "exit 1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            engine.exec_command(&instance, &failing).await.unwrap(),
            ExecOutcome::Failed { exit_code: 1 }
        );

        let slow = ContainerScript {
            content: "sleep 30".to_string(),
            timeout_secs: 1,
            ..Default::default()
        };
        let started = Instant::now();
        let err = engine.exec_command(&instance, &slow).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(3));

        // the timed out script does not linger in the sandbox
        tokio::time::sleep(Duration::from_millis(500)).await;
        let gone = ContainerScript {
            content: "! ps | grep -q '[s]leep 30'".to_string(),
            ..Default::default()
        };
        assert!(engine.exec_command(&instance, &gone).await.unwrap().passed());

        engine.remove_container(&mut instance).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Removed);
        assert!(instance.end_at.is_some());
        assert!(!engine.exists(&instance.name).await.unwrap());
    }
}
