/// API 网关签名代理隧道
///
/// 公网网关：本地代理直接连到 `<host>:443`。
/// 私有网关：先通过跳板机建立到 VPC endpoint 的端口转发，再由本地代理经
/// 该转发端口连接，TLS SNI 与签名仍使用 endpoint 主机名。
use super::supervisor::{self, Exit, Launch, Readiness};
use super::table::{TunnelRecord, TunnelTable};
use super::{ApiKind, ApiTarget, EndpointType, TunnelContext, TunnelStatus};
use crate::cloud::{JumpHost, VpcEndpoint};
use crate::error::{Result, TunnelError};
use crate::port::PortLease;
use crate::proxy::{SigningProxy, UpstreamTarget};
use crate::session::{ChildSession, SessionSpec};
use crate::topology::{EndpointChoice, EndpointSource, TopologyRequest, TopologyResolver};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// VPC endpoint 的 HTTPS 端口
const ENDPOINT_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GatewayTunnelKind {
    PublicProxy,
    PrivateViaBastion,
}

impl fmt::Display for GatewayTunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicProxy => f.write_str("public"),
            Self::PrivateViaBastion => f.write_str("private"),
        }
    }
}

/// 网关隧道快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayTunnel {
    pub id: String,
    pub status: TunnelStatus,
    pub kind: GatewayTunnelKind,
    pub local_port: u16,
    pub api_id: String,
    pub api_name: String,
    pub stage_name: String,
    pub endpoint_type: EndpointType,
    pub api_kind: ApiKind,
    pub upstream_host: String,
    pub jump_host_id: Option<String>,
    pub vpc_endpoint_id: Option<String>,
    pub vpc_endpoint_dns: Option<String>,
    /// session-manager 的本地端口（仅私有网关）
    pub forward_port: Option<u16>,
    pub endpoint_source: Option<EndpointSource>,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// 非致命提示，例如跨账户 endpoint 回退
    pub notice: Option<String>,
    pub pid: Option<u32>,
}

impl TunnelRecord for GatewayTunnel {
    fn id(&self) -> &str {
        &self.id
    }
    fn status(&self) -> TunnelStatus {
        self.status
    }
    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
    fn set_status(&mut self, status: TunnelStatus) {
        self.status = status;
    }
    fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }
    fn set_last_error(&mut self, error: String) {
        self.last_error = Some(error);
    }
}

/// 私有网关最终使用的 endpoint
struct ChosenEndpoint {
    endpoint: VpcEndpoint,
    source: EndpointSource,
    notice: Option<String>,
}

/// 私有网关 supervisor 持有的资源
struct PrivateLaunch {
    launch: Launch,
    listener: TcpListener,
    proxy_lease: PortLease,
    api_id: String,
    dns: String,
    stage_prefix: Option<String>,
}

/// API 网关隧道管理器
pub struct GatewayTunnelManager {
    ctx: Arc<TunnelContext>,
    tunnels: TunnelTable<GatewayTunnel>,
    next_id: AtomicU64,
}

impl GatewayTunnelManager {
    pub fn new(ctx: Arc<TunnelContext>) -> Self {
        Self {
            ctx,
            tunnels: TunnelTable::new("API"),
            next_id: AtomicU64::new(1),
        }
    }

    fn generate_id(&self) -> String {
        format!("api-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn new_tunnel(
        &self,
        kind: GatewayTunnelKind,
        api: &ApiTarget,
        stage: &str,
        local_port: u16,
        upstream_host: String,
    ) -> GatewayTunnel {
        GatewayTunnel {
            id: self.generate_id(),
            status: TunnelStatus::Starting,
            kind,
            local_port,
            api_id: api.api_id().to_string(),
            api_name: api.name().to_string(),
            stage_name: stage.to_string(),
            endpoint_type: api.endpoint_type(),
            api_kind: api.kind(),
            upstream_host,
            jump_host_id: None,
            vpc_endpoint_id: None,
            vpc_endpoint_dns: None,
            forward_port: None,
            endpoint_source: None,
            started_at: Utc::now(),
            last_error: None,
            notice: None,
            pid: None,
        }
    }

    /// 分配端口并绑定监听器；自动分配的端口遇到绑定竞争时重试一次
    async fn bind_listener(&self, requested: Option<u16>) -> Result<(PortLease, TcpListener)> {
        let auto_port = matches!(requested, None | Some(0));
        let mut retried = false;
        loop {
            let lease = self.ctx.ports.allocate(requested)?;
            match TcpListener::bind(lease.addr()).await {
                Ok(listener) => return Ok((lease, listener)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    if !auto_port {
                        return Err(TunnelError::PortBusy(lease.port()));
                    }
                    if retried {
                        return Err(e.into());
                    }
                    retried = true;
                    warn!(
                        "Local port {} was taken before the proxy bound it, retrying once",
                        lease.port()
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 预先取一次凭证，使签名问题在启动时暴露
    async fn warm_credentials(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            c = self.ctx.cloud.credentials() => c.map(|_| ()),
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        }
    }

    /// 启动公网网关代理；监听成功后即为 Active
    pub async fn start_public_tunnel(
        &self,
        api: &ApiTarget,
        stage: &str,
        requested_local_port: Option<u16>,
        cancel: CancellationToken,
    ) -> Result<GatewayTunnel> {
        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        if api.is_private() {
            return Err(TunnelError::config_error(format!(
                "API {} is private and must be reached through a jump host",
                api.api_id()
            )));
        }
        let host = api.upstream_host(self.ctx.region())?;
        self.warm_credentials(&cancel).await?;

        let (lease, listener) = self.bind_listener(requested_local_port).await?;
        let proxy = SigningProxy::new(
            listener,
            UpstreamTarget::public(host.clone(), &self.ctx.proxy),
            api.stage_prefix(stage),
            self.ctx.cloud.clone(),
            &self.ctx.proxy,
            &self.ctx.extra_roots,
        )?;

        let mut tunnel = self.new_tunnel(
            GatewayTunnelKind::PublicProxy,
            api,
            stage,
            lease.port(),
            host,
        );
        tunnel.status = TunnelStatus::Active;
        let id = tunnel.id.clone();
        info!(
            "API tunnel {} active: 127.0.0.1:{} -> https://{} ({})",
            id,
            lease.port(),
            tunnel.upstream_host,
            api.name()
        );
        let stop = self.tunnels.insert(tunnel);

        let table = self.tunnels.clone();
        let task_id = id.clone();
        self.tunnels.spawn_supervisor(&id, async move {
            proxy.serve(stop).await;
            drop(lease);
            info!("API tunnel {} stopped", task_id);
            table.finish(&task_id, TunnelStatus::Terminated, None);
        })
    }

    /// 确定私有网关使用的 endpoint
    ///
    /// 与跳板机同 VPC 的 endpoint 优先；否则使用配置的 endpoint（跨账户），
    /// 两者都没有时返回 NoUsableEndpoint。
    async fn choose_endpoint(
        &self,
        jump_host: &JumpHost,
        vpc_endpoint: Option<&VpcEndpoint>,
        configured_endpoint_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChosenEndpoint> {
        if let Some(ep) = vpc_endpoint.filter(|ep| ep.vpc_id == jump_host.vpc_id) {
            return Ok(ChosenEndpoint {
                endpoint: ep.clone(),
                source: EndpointSource::Discovered,
                notice: None,
            });
        }
        let Some(configured) = configured_endpoint_id else {
            return Err(TunnelError::NoUsableEndpoint {
                vpc_id: jump_host.vpc_id.clone(),
            });
        };
        let endpoint = tokio::select! {
            ep = self.ctx.cloud.describe_vpc_endpoint(configured) => ep?,
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
        };
        let notice = format!(
            "Jump host {} is in {} which has no execute-api endpoint; using configured endpoint {} in {} (cross-account)",
            jump_host.instance_id, jump_host.vpc_id, endpoint.endpoint_id, endpoint.vpc_id
        );
        warn!("{}", notice);
        Ok(ChosenEndpoint {
            endpoint,
            source: EndpointSource::Configured,
            notice: Some(notice),
        })
    }

    /// 通过跳板机启动私有网关代理
    ///
    /// 返回时状态为 Starting；session-manager 就绪后代理开始服务并变为 Active。
    #[allow(clippy::too_many_arguments)]
    pub async fn start_private_tunnel(
        &self,
        api: &ApiTarget,
        stage: &str,
        jump_host: &JumpHost,
        vpc_endpoint: Option<&VpcEndpoint>,
        configured_endpoint_id: Option<&str>,
        requested_local_port: Option<u16>,
        cancel: CancellationToken,
    ) -> Result<GatewayTunnel> {
        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        let chosen = self
            .choose_endpoint(jump_host, vpc_endpoint, configured_endpoint_id, &cancel)
            .await?;
        let dns = chosen
            .endpoint
            .primary_dns()
            .map(str::to_string)
            .ok_or_else(|| {
                TunnelError::cloud(format!(
                    "VPC endpoint {} has no DNS entries",
                    chosen.endpoint.endpoint_id
                ))
            })?;

        let credentials = tokio::select! {
            c = self.ctx.cloud.credentials() => c?,
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
        };

        let (proxy_lease, listener) = self.bind_listener(requested_local_port).await?;
        let forward_lease = self.ctx.ports.allocate(None)?;

        let mut tunnel = self.new_tunnel(
            GatewayTunnelKind::PrivateViaBastion,
            api,
            stage,
            proxy_lease.port(),
            dns.clone(),
        );
        tunnel.jump_host_id = Some(jump_host.instance_id.clone());
        tunnel.vpc_endpoint_id = Some(chosen.endpoint.endpoint_id.clone());
        tunnel.vpc_endpoint_dns = Some(dns.clone());
        tunnel.forward_port = Some(forward_lease.port());
        tunnel.endpoint_source = Some(chosen.source);
        tunnel.notice = chosen.notice;
        let id = tunnel.id.clone();
        let stop = self.tunnels.insert(tunnel);

        let spec = SessionSpec::remote_host(
            &jump_host.instance_id,
            &dns,
            ENDPOINT_PORT,
            forward_lease.port(),
            self.ctx.region(),
        )
        .with_profile(self.ctx.profile_name())
        .with_credentials(credentials);

        let child = match ChildSession::spawn(self.ctx.launcher.as_ref(), &spec, &self.ctx.session).await {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start API tunnel {}: {}", id, e);
                drop(forward_lease);
                drop(listener);
                drop(proxy_lease);
                self.tunnels
                    .finish(&id, TunnelStatus::Error, Some(e.to_string()));
                return Err(e);
            }
        };
        let pid = child.pid();
        self.tunnels.update(&id, |t| t.pid = pid);

        info!(
            "API tunnel {} starting: 127.0.0.1:{} -> {} via {} (forward port {})",
            id,
            proxy_lease.port(),
            dns,
            jump_host.instance_id,
            forward_lease.port()
        );

        let private = PrivateLaunch {
            launch: Launch {
                child,
                lease: forward_lease,
                spec,
                auto_port: true,
            },
            listener,
            proxy_lease,
            api_id: api.api_id().to_string(),
            dns,
            stage_prefix: api.stage_prefix(stage),
        };
        self.tunnels.spawn_supervisor(
            &id,
            supervise_private(
                self.ctx.clone(),
                self.tunnels.clone(),
                id.clone(),
                private,
                stop,
                cancel,
            ),
        )
    }

    /// 先解析拓扑（跳板机与 endpoint），再启动私有网关代理
    pub async fn start_private_tunnel_auto(
        &self,
        api: &ApiTarget,
        stage: &str,
        request: &TopologyRequest,
        requested_local_port: Option<u16>,
        cancel: CancellationToken,
    ) -> Result<GatewayTunnel> {
        let resolver = TopologyResolver::new(self.ctx.cloud.clone(), self.ctx.topology.clone());
        let resolved = tokio::select! {
            r = resolver.resolve(request) => r?,
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
        };
        match resolved.endpoint {
            EndpointChoice::Discovered(ref ep) => {
                self.start_private_tunnel(
                    api,
                    stage,
                    &resolved.jump_host,
                    Some(ep),
                    None,
                    requested_local_port,
                    cancel,
                )
                .await
            }
            EndpointChoice::Configured(ref id) => {
                self.start_private_tunnel(
                    api,
                    stage,
                    &resolved.jump_host,
                    None,
                    Some(id),
                    requested_local_port,
                    cancel,
                )
                .await
            }
        }
    }

    /// 停止隧道；已结束的隧道直接返回 Ok
    pub fn stop_tunnel(&self, id: &str) -> Result<()> {
        self.tunnels.request_stop(id)
    }

    /// 移除已结束的隧道并返回其最后的快照，用于以相同参数重新启动
    pub fn prepare_restart(&self, id: &str) -> Result<GatewayTunnel> {
        self.tunnels.take_finished(id)
    }

    pub fn clear_terminated(&self) -> usize {
        self.tunnels.clear_finished()
    }

    pub fn get_tunnels(&self) -> Vec<GatewayTunnel> {
        self.tunnels.snapshot()
    }

    pub fn get_tunnel(&self, id: &str) -> Option<GatewayTunnel> {
        self.tunnels.get(id)
    }

    pub fn live_count(&self) -> usize {
        self.tunnels.live_count()
    }

    pub async fn stop_all(&self, deadline: Duration) -> bool {
        self.tunnels.stop_all(deadline).await
    }
}

async fn supervise_private(
    ctx: Arc<TunnelContext>,
    table: TunnelTable<GatewayTunnel>,
    id: String,
    private: PrivateLaunch,
    stop: CancellationToken,
    cancel: CancellationToken,
) {
    let PrivateLaunch {
        mut launch,
        listener,
        proxy_lease,
        api_id,
        dns,
        stage_prefix,
    } = private;

    let readiness = supervisor::wait_until_ready(&mut launch, &ctx, &stop, &cancel, |port, pid| {
        table.update(&id, |t| {
            t.forward_port = Some(port);
            t.pid = pid;
        })
    })
    .await;

    let failure = match readiness {
        Readiness::Ready => None,
        Readiness::Stopped => Some((TunnelStatus::Terminated, None)),
        Readiness::Cancelled => Some((
            TunnelStatus::Terminated,
            Some("start cancelled".to_string()),
        )),
        Readiness::Failed(e) => {
            error!("API tunnel {} failed to start: {}", id, e);
            Some((TunnelStatus::Error, Some(e.to_string())))
        }
    };
    if let Some((status, error)) = failure {
        drop(launch);
        drop(listener);
        drop(proxy_lease);
        table.finish(&id, status, error);
        return;
    }

    let target = UpstreamTarget::via_forward(dns, launch.lease.port(), api_id);
    let proxy = match SigningProxy::new(
        listener,
        target,
        stage_prefix,
        ctx.cloud.clone(),
        &ctx.proxy,
        &ctx.extra_roots,
    ) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("API tunnel {} failed to start proxy: {}", id, e);
            launch.child.stop(ctx.session.stop_grace()).await;
            drop(launch);
            drop(proxy_lease);
            table.finish(&id, TunnelStatus::Error, Some(e.to_string()));
            return;
        }
    };

    let proxy_stop = CancellationToken::new();
    let proxy_task = tokio::spawn(proxy.serve(proxy_stop.clone()));
    info!(
        "API tunnel {} active on 127.0.0.1:{} (forward port {})",
        id,
        proxy_lease.port(),
        launch.lease.port()
    );
    table.update(&id, |t| t.status = TunnelStatus::Active);

    let exit = supervisor::wait_for_exit(&mut launch, &ctx, &stop).await;
    proxy_stop.cancel();
    if let Err(e) = proxy_task.await {
        warn!("API tunnel {} proxy task failed: {}", id, e);
    }
    drop(launch);
    drop(proxy_lease);

    match exit {
        Exit::Exited(reason) => {
            warn!("API tunnel {} terminated unexpectedly: {}", id, reason);
            table.finish(&id, TunnelStatus::Terminated, Some(reason));
        }
        Exit::Stopped => {
            info!("API tunnel {} stopped", id);
            table.finish(&id, TunnelStatus::Terminated, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(GatewayTunnelKind::PublicProxy.to_string(), "public");
        assert_eq!(GatewayTunnelKind::PrivateViaBastion.to_string(), "private");
    }
}
