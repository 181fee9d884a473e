use anyhow::{bail, Result};
use tracing::warn;

use super::{AppConfig, PortRangeConfig, ProxyConfig, SessionConfig, TopologyConfig};
use crate::topology::TagSelector;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口范围
    pub fn validate_port_range(config: &PortRangeConfig) -> Result<()> {
        if config.start == 0 {
            bail!("ports.start cannot be 0");
        }
        if config.start > config.end {
            bail!(
                "ports.start ({}) must not be greater than ports.end ({})",
                config.start,
                config.end
            );
        }
        if config.max_attempts == 0 {
            bail!("ports.max_attempts must be greater than 0");
        }
        if config.start < 1024 {
            warn!(
                "ports.start ({}) is in the privileged range, binding may fail",
                config.start
            );
        }
        Ok(())
    }

    /// 验证子进程配置
    pub fn validate_session_config(config: &SessionConfig) -> Result<()> {
        if config.start_timeout_secs == 0 {
            bail!("session.start_timeout_secs must be greater than 0");
        }
        if config.settle_ms >= config.start_timeout_secs * 1000 {
            bail!(
                "session.settle_ms ({}) must be shorter than session.start_timeout_secs ({}s)",
                config.settle_ms,
                config.start_timeout_secs
            );
        }
        if config.output_buffer_bytes == 0 {
            bail!("session.output_buffer_bytes must be greater than 0");
        }
        if config.ready_line.trim().is_empty() {
            bail!("session.ready_line cannot be empty");
        }
        Ok(())
    }

    /// 验证代理配置
    pub fn validate_proxy_config(config: &ProxyConfig) -> Result<()> {
        if config.request_timeout_secs == 0 {
            bail!("proxy.request_timeout_secs must be greater than 0");
        }
        for host in config.upstream_overrides.keys() {
            if host.trim().is_empty() {
                bail!("proxy.upstream_overrides: host cannot be empty");
            }
        }
        if let Some(ref path) = config.ca_bundle {
            if !path.exists() {
                warn!("proxy.ca_bundle {:?} does not exist", path);
            }
        }
        Ok(())
    }

    /// 验证拓扑默认值
    pub fn validate_topology_config(config: &TopologyConfig) -> Result<()> {
        if let Some(ref selector) = config.jump_host_tag {
            TagSelector::parse(selector)?;
        }
        for tag in &config.candidate_tags {
            TagSelector::parse(tag)?;
        }
        for name in &config.candidate_names {
            if name.trim().is_empty() {
                bail!("topology.candidate_names cannot contain empty names");
            }
        }
        if let Some(ref id) = config.vpc_endpoint_id {
            if !id.starts_with("vpce-") {
                bail!("topology.vpc_endpoint_id '{}' is not a VPC endpoint id", id);
            }
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_app_config(config: &AppConfig) -> Result<()> {
        if config.aws.cli_path.trim().is_empty() {
            bail!("aws.cli_path cannot be empty");
        }
        Self::validate_port_range(&config.ports)?;
        Self::validate_session_config(&config.session)?;
        Self::validate_proxy_config(&config.proxy)?;
        Self::validate_topology_config(&config.topology)?;
        if config.shutdown_timeout_secs == 0 {
            bail!("shutdown_timeout_secs must be greater than 0");
        }
        Ok(())
    }
}
