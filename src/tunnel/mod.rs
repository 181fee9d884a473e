/// 隧道管理
///
/// 两个管理器（ECS 容器端口转发、API 网关签名代理）各自维护一张
/// id → 条目 的表，由单个 `parking_lot::RwLock` 保护，锁不会跨越 `.await`。
/// 每个存活隧道有一个后台 supervisor 任务，按 id 回写状态。
pub mod ecs;
pub mod gateway;
pub mod registry;
mod supervisor;
mod table;

pub use ecs::{EcsContainer, EcsRestartPlan, EcsService, EcsTask, EcsTunnel, EcsTunnelManager};
pub use gateway::{GatewayTunnel, GatewayTunnelKind, GatewayTunnelManager};
pub use registry::{RegistryView, TunnelSnapshot};

use crate::cloud::CloudApi;
use crate::config::{AppConfig, ProxyConfig, SessionConfig, TopologyConfig};
use crate::error::{Result, TunnelError};
use crate::port::PortAllocator;
use crate::session::SessionLauncher;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// 隧道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunnelStatus {
    Starting,
    Active,
    Error,
    Terminated,
}

impl TunnelStatus {
    /// Starting 与 Active 视为存活
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Error => "error",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// API 网关 endpoint 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointType {
    Regional,
    Edge,
    Private,
}

impl EndpointType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REGIONAL" => Some(Self::Regional),
            "EDGE" => Some(Self::Edge),
            "PRIVATE" => Some(Self::Private),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Regional => "REGIONAL",
            Self::Edge => "EDGE",
            Self::Private => "PRIVATE",
        };
        f.write_str(s)
    }
}

/// REST (v1) 或 HTTP (v2) API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApiKind {
    RestV1,
    HttpV2,
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestV1 => f.write_str("REST"),
            Self::HttpV2 => f.write_str("HTTP"),
        }
    }
}

/// 要代理的 API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiTarget {
    RestV1 {
        api_id: String,
        name: String,
        endpoint_type: EndpointType,
    },
    HttpV2 {
        api_id: String,
        name: String,
        api_endpoint: String,
    },
}

/// HTTP API 默认 stage，不需要路径前缀
pub const DEFAULT_HTTP_STAGE: &str = "$default";

impl ApiTarget {
    pub fn api_id(&self) -> &str {
        match self {
            Self::RestV1 { api_id, .. } | Self::HttpV2 { api_id, .. } => api_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::RestV1 { name, .. } | Self::HttpV2 { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ApiKind {
        match self {
            Self::RestV1 { .. } => ApiKind::RestV1,
            Self::HttpV2 { .. } => ApiKind::HttpV2,
        }
    }

    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            Self::RestV1 { endpoint_type, .. } => *endpoint_type,
            Self::HttpV2 { .. } => EndpointType::Regional,
        }
    }

    pub fn is_private(&self) -> bool {
        self.endpoint_type() == EndpointType::Private
    }

    /// 公网访问时的上游主机名
    pub fn upstream_host(&self, region: &str) -> Result<String> {
        match self {
            Self::RestV1 { api_id, .. } => {
                Ok(format!("{}.execute-api.{}.amazonaws.com", api_id, region))
            }
            Self::HttpV2 { api_endpoint, .. } => url::Url::parse(api_endpoint)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .ok_or_else(|| {
                    TunnelError::config_error(format!("Invalid API endpoint '{}'", api_endpoint))
                }),
        }
    }

    /// 路径前缀规则：REST API 总是加 stage；HTTP API 的 `$default` stage 不加
    pub fn stage_prefix(&self, stage: &str) -> Option<String> {
        let stage = stage.trim().trim_matches('/');
        if stage.is_empty() {
            return None;
        }
        match self {
            Self::RestV1 { .. } => Some(stage.to_string()),
            Self::HttpV2 { .. } if stage == DEFAULT_HTTP_STAGE => None,
            Self::HttpV2 { .. } => Some(stage.to_string()),
        }
    }
}

/// 两个管理器共享的依赖
pub struct TunnelContext {
    pub cloud: Arc<dyn CloudApi>,
    pub launcher: Arc<dyn SessionLauncher>,
    pub ports: Arc<PortAllocator>,
    pub session: SessionConfig,
    pub proxy: ProxyConfig,
    pub topology: TopologyConfig,
    pub extra_roots: Vec<reqwest::Certificate>,
}

impl TunnelContext {
    pub fn new(
        config: &AppConfig,
        cloud: Arc<dyn CloudApi>,
        launcher: Arc<dyn SessionLauncher>,
    ) -> Result<Arc<Self>> {
        let extra_roots = match config.proxy.ca_bundle {
            Some(ref path) => crate::tls::load_ca_bundle(path)
                .map_err(|e| TunnelError::config_error(format!("{:#}", e)))?,
            None => Vec::new(),
        };
        Ok(Arc::new(Self {
            cloud,
            launcher,
            ports: PortAllocator::new(config.ports),
            session: config.session.clone(),
            proxy: config.proxy.clone(),
            topology: config.topology.clone(),
            extra_roots,
        }))
    }

    pub fn region(&self) -> &str {
        &self.cloud.profile().region
    }

    pub fn profile_name(&self) -> Option<String> {
        self.cloud.profile().name.clone()
    }
}

/// 按 started_at 倒序（同一时刻按 id 倒序）
pub(crate) fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (chrono::DateTime<chrono::Utc>, &str)) {
    items.sort_by(|a, b| {
        let (ta, ia) = key(a);
        let (tb, ib) = key(b);
        tb.cmp(&ta).then_with(|| ib.cmp(ia))
    });
}
