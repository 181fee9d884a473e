/// 云服务接口
///
/// 隧道子系统只依赖这里定义的少量调用：列出 execute-api VPC endpoint、
/// 列出 SSM 托管实例、查询单个 endpoint 以及获取凭证。默认实现
/// [`AwsCli`] 通过 `aws` 命令行完成这些调用。
mod aws_cli;

pub use aws_cli::AwsCli;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// 当前使用的 profile 与区域
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsProfile {
    pub name: Option<String>,
    pub region: String,
}

impl AwsProfile {
    pub fn new(name: Option<String>, region: impl Into<String>) -> Self {
        Self {
            name,
            region: region.into(),
        }
    }

    /// 显示名称（未设置时为 "default"）
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("default")
    }
}

/// 临时或长期凭证，Debug 输出不包含密钥
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "SessionToken", default)]
    pub session_token: Option<String>,
    #[serde(rename = "Expiration", default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// 在 `margin` 之内即将过期也视为过期
    pub fn is_expired(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match self.expires_at {
            Some(exp) => exp - margin <= now,
            None => false,
        }
    }

    /// 传给子进程的环境变量
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("AWS_ACCESS_KEY_ID", self.access_key_id.clone()),
            ("AWS_SECRET_ACCESS_KEY", self.secret_access_key.clone()),
        ];
        if let Some(ref token) = self.session_token {
            vars.push(("AWS_SESSION_TOKEN", token.clone()));
        }
        vars
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// EC2 实例状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Other(String),
}

impl InstanceState {
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }

    /// 可以作为跳板机候选的状态
    pub fn is_usable(&self) -> bool {
        !matches!(
            self,
            Self::Stopping | Self::Stopped | Self::ShuttingDown | Self::Terminated
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

/// 可以通过 SSM 访问的实例
#[derive(Debug, Clone, PartialEq)]
pub struct JumpHost {
    pub instance_id: String,
    pub name: String,
    pub vpc_id: String,
    pub private_ip: Option<String>,
    pub ssm_managed: bool,
    pub state: InstanceState,
    pub tags: HashMap<String, String>,
}

impl JumpHost {
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.get(key).map(|v| v == value).unwrap_or(false)
    }
}

/// execute-api 接口型 VPC endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpcEndpoint {
    pub endpoint_id: String,
    pub service_name: String,
    pub vpc_id: String,
    /// DNS 名称（按 AWS 返回顺序，第一个为区域级名称）
    pub dns_entries: Vec<String>,
}

impl VpcEndpoint {
    pub fn primary_dns(&self) -> Option<&str> {
        self.dns_entries.first().map(String::as_str)
    }
}

/// 隧道子系统需要的云服务调用
#[async_trait]
pub trait CloudApi: Send + Sync {
    fn profile(&self) -> &AwsProfile;

    async fn list_execute_api_vpc_endpoints(&self) -> Result<Vec<VpcEndpoint>>;

    async fn list_ssm_managed_instances(&self) -> Result<Vec<JumpHost>>;

    async fn describe_vpc_endpoint(&self, endpoint_id: &str) -> Result<VpcEndpoint>;

    async fn credentials(&self) -> Result<Credentials>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = Credentials::new("AKIDEXAMPLE", "super-secret").with_session_token("tok");
        let out = format!("{:?}", creds);
        assert!(out.contains("AKIDEXAMPLE"));
        assert!(!out.contains("super-secret"));
        assert!(!out.contains("tok\""));
        assert!(out.contains("<redacted>"));
    }

    #[test]
    fn test_credentials_expiry() {
        let now = Utc::now();
        let mut creds = Credentials::new("a", "b");
        assert!(!creds.is_expired(now, chrono::Duration::minutes(5)));
        creds.expires_at = Some(now + chrono::Duration::minutes(3));
        assert!(creds.is_expired(now, chrono::Duration::minutes(5)));
        creds.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(!creds.is_expired(now, chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_credentials_env() {
        let creds = Credentials::new("a", "b");
        assert_eq!(creds.env_vars().len(), 2);
        let creds = creds.with_session_token("t");
        assert!(creds
            .env_vars()
            .contains(&("AWS_SESSION_TOKEN", "t".to_string())));
    }

    #[test]
    fn test_credential_process_json() {
        let json = r#"{"Version":1,"AccessKeyId":"AKID","SecretAccessKey":"s","SessionToken":"t","Expiration":"2030-01-01T00:00:00+00:00"}"#;
        let creds: Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.access_key_id, "AKID");
        assert_eq!(creds.session_token.as_deref(), Some("t"));
        assert!(creds.expires_at.is_some());
    }

    #[test]
    fn test_instance_state() {
        assert_eq!(InstanceState::parse("running"), InstanceState::Running);
        assert!(!InstanceState::parse("shutting-down").is_usable());
        assert!(!InstanceState::parse("stopping").is_usable());
        assert!(InstanceState::parse("pending").is_usable());
        assert_eq!(InstanceState::ShuttingDown.to_string(), "shutting-down");
    }
}
