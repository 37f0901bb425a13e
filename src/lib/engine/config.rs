use rand::{Rng, distributions::Alphanumeric};

use super::types::{
    BindMount, CONNECTION_TOKEN_ENV, ContainerConfig, EngineError, EngineResult, PortMapping,
    SUDO_PASSWORD_ENV,
};
use crate::lib::model::types::ContainerTemplate;

const NAME_SUFFIX_LEN: usize = 8;
const TOKEN_LEN: usize = 32;

/// Builds the runtime configuration for a template. Malformed entries in
/// the delimited env/port/volume strings are rejected, empty segments are
/// ignored.
pub fn new_config(
    template: &ContainerTemplate,
    name: String,
    token: &str,
    default_sudo_password: &str,
) -> EngineResult<ContainerConfig> {
    if template.image.trim().is_empty() {
        return Err(EngineError::InvalidSpec {
            field: "image",
            entry: template.image.clone(),
            reason: "template has no image".to_string(),
        });
    }

    let mut env = parse_envs(&template.envs)?;
    let sudo_password = template
        .sudo_pass
        .as_deref()
        .filter(|pass| !pass.is_empty())
        .unwrap_or(default_sudo_password);
    env.push(format!("{}={}", SUDO_PASSWORD_ENV, sudo_password));
    env.push(format!("{}={}", CONNECTION_TOKEN_ENV, token));

    let cmd = match template.default_cmd.trim() {
        "" => None,
        cmd => Some(vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()]),
    };

    Ok(ContainerConfig {
        name,
        image: template.image.clone(),
        cmd,
        env,
        ports: parse_ports(&template.ports)?,
        mounts: parse_volumes(&template.volumes)?,
    })
}

fn entries(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';').map(str::trim).filter(|entry| !entry.is_empty())
}

fn split_pair<'a>(field: &'static str, entry: &'a str) -> EngineResult<(&'a str, &'a str)> {
    let invalid = |reason: &str| EngineError::InvalidSpec {
        field,
        entry: entry.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = entry.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(value), None) => {
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                Err(invalid("both sides of ':' must be set"))
            } else {
                Ok((key, value))
            }
        }
        _ => Err(invalid("expected exactly one ':'")),
    }
}

/// `KEY=VALUE` or `KEY:VALUE` entries, returned as `KEY=VALUE`.
pub fn parse_envs(raw: &str) -> EngineResult<Vec<String>> {
    entries(raw)
        .map(|entry| {
            let (key, value) = match entry.split_once('=') {
                Some(pair) => pair,
                None => entry.split_once(':').ok_or_else(|| EngineError::InvalidSpec {
                    field: "env",
                    entry: entry.to_string(),
                    reason: "expected KEY=VALUE or KEY:VALUE".to_string(),
                })?,
            };
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(EngineError::InvalidSpec {
                    field: "env",
                    entry: entry.to_string(),
                    reason: "invalid variable name".to_string(),
                });
            }
            Ok(format!("{}={}", key, value.trim()))
        })
        .collect()
}

/// `host:container` pairs; the container side may carry a `/tcp` or
/// `/udp` suffix and defaults to tcp.
pub fn parse_ports(raw: &str) -> EngineResult<Vec<PortMapping>> {
    entries(raw)
        .map(|entry| {
            let (host, container) = split_pair("port", entry)?;
            let (container, proto) = container.split_once('/').unwrap_or((container, "tcp"));

            let invalid = |reason: &str| EngineError::InvalidSpec {
                field: "port",
                entry: entry.to_string(),
                reason: reason.to_string(),
            };
            if host.parse::<u16>().is_err() || container.parse::<u16>().is_err() {
                return Err(invalid("ports must be numbers in 0-65535"));
            }
            if proto != "tcp" && proto != "udp" {
                return Err(invalid("protocol must be tcp or udp"));
            }

            Ok(PortMapping {
                host_port: host.to_string(),
                container_port: format!("{}/{}", container, proto),
            })
        })
        .collect()
}

/// `host_path:container_path` bind mounts.
pub fn parse_volumes(raw: &str) -> EngineResult<Vec<BindMount>> {
    entries(raw)
        .map(|entry| {
            let (source, target) = split_pair("volume", entry)?;
            if !target.starts_with('/') {
                return Err(EngineError::InvalidSpec {
                    field: "volume",
                    entry: entry.to_string(),
                    reason: "container path must be absolute".to_string(),
                });
            }
            Ok(BindMount {
                source: source.to_string(),
                target: target.to_string(),
            })
        })
        .collect()
}

pub fn generate_name(template_name: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();

    // docker names must start with an alphanumeric
    let sanitized: String = template_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '-' })
        .collect();
    let base = match sanitized.trim_start_matches(|c: char| !c.is_ascii_alphanumeric()) {
        "" => "sandbox",
        name => name,
    };
    format!("{}-{}", base, suffix)
}

pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
