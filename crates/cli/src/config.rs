use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hcp_core::error::{HcpError, Result};
use hcp_core::state::expand_path;
use hcp_core::{OrchestratorConfig, PollPolicy, SshConfig};
use hcp_openstack::NovaConfig;
use humantime::parse_duration;
use serde::Deserialize;

const CONFIG_PATH: &str = "~/.hcp/config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub compute: ComputeConfig,
    pub ssh: SshSection,
    pub provisioning: ProvisioningSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ComputeConfig {
    pub compute_url: Option<String>,
    pub identity_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant_name: Option<String>,
    /// Tenant new templates and clusters belong to unless `--tenant` is given.
    pub tenant_id: Option<String>,
    pub token: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SshSection {
    pub user: Option<String>,
    pub identity_file: Option<String>,
    pub connect_timeout: Option<String>,
    pub ssh_binary: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProvisioningSection {
    pub poll_interval: Option<String>,
    pub max_poll_interval: Option<String>,
    pub ready_timeout: Option<String>,
    pub probe_command: Option<String>,
    pub start_command: Option<String>,
    pub terminate_on_failure: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
}

impl Config {
    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or("info")
    }

    /// `--tenant` wins over `tenant-id` from the config file.
    pub fn tenant(&self, flag: Option<String>) -> Result<String> {
        flag.or_else(|| self.compute.tenant_id.clone()).ok_or_else(|| {
            HcpError::Config("no tenant given, pass --tenant or set tenant-id under [compute]".into())
        })
    }

    pub fn nova(&self) -> NovaConfig {
        let c = &self.compute;
        NovaConfig {
            compute_url: c.compute_url.clone(),
            identity_url: c.identity_url.clone(),
            username: c.username.clone(),
            password: c.password.clone(),
            tenant_name: c.tenant_name.clone(),
            token: c.token.clone(),
            region: c.region.clone(),
        }
    }

    pub fn ssh(&self) -> Result<SshConfig> {
        let defaults = SshConfig::default();
        let identity_file = match &self.ssh.identity_file {
            Some(path) => Some(expand_path(path)?),
            None => None,
        };
        Ok(SshConfig {
            user: self.ssh.user.clone().unwrap_or(defaults.user),
            identity_file,
            connect_timeout: duration(
                "ssh.connect-timeout",
                &self.ssh.connect_timeout,
                defaults.connect_timeout,
            )?,
            ssh_binary: self.ssh.ssh_binary.clone().unwrap_or(defaults.ssh_binary),
        })
    }

    pub fn orchestrator(&self) -> Result<OrchestratorConfig> {
        let defaults = OrchestratorConfig::default();
        let p = &self.provisioning;
        let poll = PollPolicy {
            interval: duration("provisioning.poll-interval", &p.poll_interval, defaults.poll.interval)?,
            max_interval: duration(
                "provisioning.max-poll-interval",
                &p.max_poll_interval,
                defaults.poll.max_interval,
            )?,
            timeout: duration("provisioning.ready-timeout", &p.ready_timeout, defaults.poll.timeout)?,
            ..defaults.poll
        };
        poll.validate()?;
        Ok(OrchestratorConfig {
            poll,
            probe_command: p.probe_command.clone().unwrap_or(defaults.probe_command),
            start_command: p.start_command.clone().unwrap_or(defaults.start_command),
            terminate_on_failure: p.terminate_on_failure.unwrap_or(defaults.terminate_on_failure),
            ..defaults
        })
    }
}

fn duration(field: &str, value: &Option<String>, default: Duration) -> Result<Duration> {
    match value {
        Some(text) => parse_duration(text).map_err(|e| {
            HcpError::Config(format!(
                "invalid duration '{}' for {}: {}. Use formats like '5s', '2m', '1h30m'",
                text, field, e
            ))
        }),
        None => Ok(default),
    }
}

pub fn config_path() -> Result<PathBuf> {
    expand_path(CONFIG_PATH)
}

/// Reads `~/.hcp/config.toml`; a missing file means all defaults.
pub fn parse_config() -> Result<Config> {
    parse_config_from(&config_path()?)
}

pub fn parse_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| HcpError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| HcpError::Config(format!("Failed to parse {}: {}", path.display(), e)))
}
