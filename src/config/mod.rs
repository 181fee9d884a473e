// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 环境变量前缀
const ENV_PREFIX: &str = "SSM_TUNNEL_";

/// 默认配置文件位置
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/ssm-tunnel/config.toml";

/// AWS 账户/CLI 相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    /// 命名 profile（为空时使用 AWS_PROFILE 或默认凭证链）
    #[serde(default)]
    pub profile: Option<String>,
    /// 区域（为空时使用 AWS_REGION / AWS_DEFAULT_REGION）
    #[serde(default)]
    pub region: Option<String>,
    /// aws CLI 可执行文件路径
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
}

fn default_cli_path() -> String {
    "aws".to_string()
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            profile: None,
            region: None,
            cli_path: default_cli_path(),
        }
    }
}

/// 本地端口分配范围
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRangeConfig {
    /// 范围起始端口（含）
    #[serde(default = "default_port_start")]
    pub start: u16,
    /// 范围结束端口（含）
    #[serde(default = "default_port_end")]
    pub end: u16,
    /// 自动分配时的最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_port_start() -> u16 {
    10000
}

fn default_port_end() -> u16 {
    60000
}

fn default_max_attempts() -> u32 {
    100
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// session-manager 子进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 子进程最短存活时间（毫秒），之后才允许判定为就绪
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// 就绪超时（秒）
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// SIGTERM 之后等待的时间（秒），超时发送 SIGKILL
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// 插件输出中表示端口已就绪的文本
    #[serde(default = "default_ready_line")]
    pub ready_line: String,
    /// stdout/stderr 环形缓冲区大小（字节）
    #[serde(default = "default_output_buffer_bytes")]
    pub output_buffer_bytes: usize,
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_start_timeout_secs() -> u64 {
    15
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_ready_line() -> String {
    "Waiting for connections".to_string()
}

fn default_output_buffer_bytes() -> usize {
    64 * 1024
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            start_timeout_secs: default_start_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            ready_line: default_ready_line(),
            output_buffer_bytes: default_output_buffer_bytes(),
        }
    }
}

impl SessionConfig {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// 签名代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 单个请求的超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 上游空闲连接保持时间（秒）
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    /// 每个上游主机的最大空闲连接数
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,
    /// 额外信任的 CA 证书（PEM，可包含多张）
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
    /// 上游主机名到地址的静态覆盖（类似 curl --connect-to）
    #[serde(default)]
    pub upstream_overrides: HashMap<String, SocketAddr>,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_pool_idle_timeout_secs() -> u64 {
    90
}

fn default_pool_max_idle() -> usize {
    10
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            pool_max_idle: default_pool_max_idle(),
            ca_bundle: None,
            upstream_overrides: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

/// 私有网关拓扑发现的默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// 固定使用的跳板机实例 ID
    #[serde(default)]
    pub jump_host_id: Option<String>,
    /// 跳板机标签选择器（Key=Value）
    #[serde(default)]
    pub jump_host_tag: Option<String>,
    /// 候选跳板机标签（任意一个匹配即可）
    #[serde(default = "default_candidate_tags")]
    pub candidate_tags: Vec<String>,
    /// 候选跳板机名称片段（匹配 Name 标签，不区分大小写）
    #[serde(default = "default_candidate_names")]
    pub candidate_names: Vec<String>,
    /// 跨账户场景下使用的 execute-api VPC endpoint ID
    #[serde(default)]
    pub vpc_endpoint_id: Option<String>,
}

fn default_candidate_tags() -> Vec<String> {
    vec!["Role=bastion".to_string(), "Role=jump-host".to_string()]
}

fn default_candidate_names() -> Vec<String> {
    vec!["bastion".to_string(), "jump".to_string()]
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            jump_host_id: None,
            jump_host_tag: None,
            candidate_tags: default_candidate_tags(),
            candidate_names: default_candidate_names(),
            vpc_endpoint_id: None,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub ports: PortRangeConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    /// 退出时等待所有隧道关闭的最长时间（秒）
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            aws: AwsConfig::default(),
            ports: PortRangeConfig::default(),
            session: SessionConfig::default(),
            proxy: ProxyConfig::default(),
            topology: TopologyConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        Self::from_toml(&content)
    }

    /// 从 TOML 字符串解析并验证
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 加载配置：显式路径必须存在；默认路径不存在时使用默认值
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(&expand_path(p)?)?,
            None => {
                let default_path = expand_path(DEFAULT_CONFIG_PATH)?;
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    debug!("No configuration at {:?}, using defaults", default_path);
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 环境变量覆盖（SSM_TUNNEL_*）
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_value::<u64>("START_TIMEOUT_SECS") {
            self.session.start_timeout_secs = v;
        }
        if let Some(v) = env_value::<u64>("SETTLE_MS") {
            self.session.settle_ms = v;
        }
        if let Some(v) = env_value::<String>("AWS_CLI") {
            self.aws.cli_path = v;
        }
        if let Some(v) = env_value::<u64>("REQUEST_TIMEOUT_SECS") {
            self.proxy.request_timeout_secs = v;
        }
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_app_config(self)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .and_then(|v| v.parse().ok())
}

pub fn expand_path(path: &str) -> anyhow::Result<PathBuf> {
    let expanded = shellexpand::full(path)
        .with_context(|| format!("Failed to expand configuration path '{}'", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
