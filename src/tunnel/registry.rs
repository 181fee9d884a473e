use super::{newest_first, EcsTunnel, EcsTunnelManager, GatewayTunnel, GatewayTunnelManager, TunnelStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// 任一管理器中的隧道
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TunnelSnapshot {
    Ecs(EcsTunnel),
    Gateway(GatewayTunnel),
}

impl TunnelSnapshot {
    pub fn id(&self) -> &str {
        match self {
            Self::Ecs(t) => &t.id,
            Self::Gateway(t) => &t.id,
        }
    }

    pub fn status(&self) -> TunnelStatus {
        match self {
            Self::Ecs(t) => t.status,
            Self::Gateway(t) => t.status,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        match self {
            Self::Ecs(t) => t.started_at,
            Self::Gateway(t) => t.started_at,
        }
    }

    pub fn local_port(&self) -> u16 {
        match self {
            Self::Ecs(t) => t.local_port,
            Self::Gateway(t) => t.local_port,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::Ecs(t) => t.last_error.as_deref(),
            Self::Gateway(t) => t.last_error.as_deref(),
        }
    }
}

/// 两个管理器的只读合并视图
#[derive(Clone)]
pub struct RegistryView {
    ecs: Arc<EcsTunnelManager>,
    gateway: Arc<GatewayTunnelManager>,
}

impl RegistryView {
    pub fn new(ecs: Arc<EcsTunnelManager>, gateway: Arc<GatewayTunnelManager>) -> Self {
        Self { ecs, gateway }
    }

    pub fn ecs(&self) -> &Arc<EcsTunnelManager> {
        &self.ecs
    }

    pub fn gateway(&self) -> &Arc<GatewayTunnelManager> {
        &self.gateway
    }

    /// 所有隧道的值快照，按 started_at 倒序
    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let mut all: Vec<TunnelSnapshot> = self
            .ecs
            .get_tunnels()
            .into_iter()
            .map(TunnelSnapshot::Ecs)
            .chain(self.gateway.get_tunnels().into_iter().map(TunnelSnapshot::Gateway))
            .collect();
        newest_first(&mut all, |t| (t.started_at(), t.id()));
        all
    }

    pub fn live_count(&self) -> usize {
        self.ecs.live_count() + self.gateway.live_count()
    }

    pub fn find(&self, id: &str) -> Option<TunnelSnapshot> {
        if let Some(t) = self.ecs.get_tunnel(id) {
            return Some(TunnelSnapshot::Ecs(t));
        }
        self.gateway.get_tunnel(id).map(TunnelSnapshot::Gateway)
    }

    /// 把停止请求转给拥有该 id 的管理器
    pub fn stop_tunnel(&self, id: &str) -> crate::error::Result<()> {
        if self.ecs.get_tunnel(id).is_some() {
            self.ecs.stop_tunnel(id)
        } else {
            self.gateway.stop_tunnel(id)
        }
    }

    pub fn clear_terminated(&self) -> usize {
        self.ecs.clear_terminated() + self.gateway.clear_terminated()
    }

    /// 同时停止两个管理器的全部隧道
    pub async fn stop_all(&self, deadline: std::time::Duration) -> bool {
        let (ecs, gateway) = tokio::join!(self.ecs.stop_all(deadline), self.gateway.stop_all(deadline));
        ecs && gateway
    }
}
