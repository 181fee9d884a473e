use crate::config::ProxyConfig;
use crate::error::{Result, TunnelError};
use std::net::{Ipv4Addr, SocketAddr};

/// 上游目标
///
/// `host` 同时用于 Host 头、TLS SNI/证书校验与签名；`connect_addr` 为实际
/// 建立 TCP 连接的地址（私有网关时为本地 session-manager 端口）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub connect_addr: Option<SocketAddr>,
    /// 私有网关需要的 `x-apigw-api-id`
    pub api_id_header: Option<String>,
}

impl UpstreamTarget {
    /// 公网网关：直接连接 host:443（可被配置覆盖）
    pub fn public(host: impl Into<String>, config: &ProxyConfig) -> Self {
        let host = host.into();
        let connect_addr = config.upstream_overrides.get(&host).copied();
        Self {
            host,
            connect_addr,
            api_id_header: None,
        }
    }

    /// 私有网关：TCP 连到 127.0.0.1:forward_port，SNI 使用 endpoint 主机名
    pub fn via_forward(
        endpoint_host: impl Into<String>,
        forward_port: u16,
        api_id: impl Into<String>,
    ) -> Self {
        Self {
            host: endpoint_host.into(),
            connect_addr: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, forward_port))),
            api_id_header: Some(api_id.into()),
        }
    }

    /// 请求 URL 的前缀（端口必须写在 URL 中，DNS 覆盖会忽略端口）
    pub fn base_url(&self) -> String {
        match self.connect_addr {
            Some(addr) if addr.port() != 443 => format!("https://{}:{}", self.host, addr.port()),
            _ => format!("https://{}", self.host),
        }
    }
}

/// 为一个代理创建共享的上游客户端（带连接池）
pub fn build_client(
    config: &ProxyConfig,
    target: &UpstreamTarget,
    extra_roots: &[reqwest::Certificate],
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .http1_only()
        .pool_idle_timeout(config.pool_idle_timeout())
        .pool_max_idle_per_host(config.pool_max_idle)
        .timeout(config.request_timeout())
        .redirect(reqwest::redirect::Policy::none())
        .tcp_nodelay(true);

    if let Some(addr) = target.connect_addr {
        builder = builder.resolve(&target.host, addr);
    }
    for cert in extra_roots {
        builder = builder.add_root_certificate(cert.clone());
    }

    builder
        .build()
        .map_err(|e| TunnelError::UpstreamError(format!("Failed to build HTTP client: {}", e)))
}
