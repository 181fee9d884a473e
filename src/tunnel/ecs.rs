/// ECS 容器端口转发隧道
use super::supervisor::{self, Exit, Launch, Readiness};
use super::table::{TunnelRecord, TunnelTable};
use super::{TunnelContext, TunnelStatus};
use crate::error::{Result, TunnelError};
use crate::session::{ChildSession, SessionSpec};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// ECS 服务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsService {
    pub service_name: String,
    pub cluster_arn: String,
    pub cluster_name: String,
}

/// ECS 任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsTask {
    pub task_id: String,
}

/// 任务中的容器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsContainer {
    pub name: String,
    pub runtime_id: String,
}

/// ECS 隧道快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EcsTunnel {
    pub id: String,
    pub status: TunnelStatus,
    pub local_port: u16,
    pub remote_port: u16,
    pub service_name: String,
    pub cluster_arn: String,
    pub cluster_name: String,
    pub task_id: String,
    pub container_name: String,
    pub container_runtime_id: String,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub pid: Option<u32>,
}

/// 重启所需的信息（条目已从表中移除）
#[derive(Debug, Clone)]
pub struct EcsRestartPlan {
    pub cluster_arn: String,
    pub cluster_name: String,
    pub service_name: String,
    pub container_name: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub previous: EcsTunnel,
}

impl EcsRestartPlan {
    pub fn service(&self) -> EcsService {
        EcsService {
            service_name: self.service_name.clone(),
            cluster_arn: self.cluster_arn.clone(),
            cluster_name: self.cluster_name.clone(),
        }
    }
}

impl TunnelRecord for EcsTunnel {
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

/// ECS 隧道管理器
pub struct EcsTunnelManager {
    ctx: Arc<TunnelContext>,
    tunnels: TunnelTable<EcsTunnel>,
    next_id: AtomicU64,
}

impl EcsTunnelManager {
    pub fn new(ctx: Arc<TunnelContext>) -> Self {
        Self {
            ctx,
            tunnels: TunnelTable::new("ECS"),
            next_id: AtomicU64::new(1),
        }
    }

    fn generate_id(&self) -> String {
        format!("ecs-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// 启动隧道；就绪检测在后台进行，返回时状态为 Starting
    pub async fn start_tunnel(
        &self,
        service: &EcsService,
        task: &EcsTask,
        container: &EcsContainer,
        remote_port: u16,
        requested_local_port: Option<u16>,
        cancel: CancellationToken,
    ) -> Result<EcsTunnel> {
        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        let auto_port = matches!(requested_local_port, None | Some(0));
        let lease = self.ctx.ports.allocate(requested_local_port)?;

        let credentials = tokio::select! {
            c = self.ctx.cloud.credentials() => c?,
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
        };

        let id = self.generate_id();
        let tunnel = EcsTunnel {
            id: id.clone(),
            status: TunnelStatus::Starting,
            local_port: lease.port(),
            remote_port,
            service_name: service.service_name.clone(),
            cluster_arn: service.cluster_arn.clone(),
            cluster_name: service.cluster_name.clone(),
            task_id: task.task_id.clone(),
            container_name: container.name.clone(),
            container_runtime_id: container.runtime_id.clone(),
            started_at: Utc::now(),
            last_error: None,
            pid: None,
        };
        let stop = self.tunnels.insert(tunnel);

        let spec = SessionSpec::ecs_container(
            &service.cluster_name,
            &task.task_id,
            &container.runtime_id,
            remote_port,
            lease.port(),
            self.ctx.region(),
        )
        .with_profile(self.ctx.profile_name())
        .with_credentials(credentials);

        let child = match ChildSession::spawn(self.ctx.launcher.as_ref(), &spec, &self.ctx.session).await {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start ECS tunnel {}: {}", id, e);
                drop(lease);
                self.tunnels
                    .finish(&id, TunnelStatus::Error, Some(e.to_string()));
                return Err(e);
            }
        };
        let pid = child.pid();
        self.tunnels.update(&id, |t| t.pid = pid);

        info!(
            "ECS tunnel {} starting: 127.0.0.1:{} -> {}/{}:{}",
            id,
            spec.local_port,
            service.service_name,
            container.name,
            remote_port
        );

        let launch = Launch {
            child,
            lease,
            spec,
            auto_port,
        };
        self.tunnels.spawn_supervisor(
            &id,
            supervise(
                self.ctx.clone(),
                self.tunnels.clone(),
                id.clone(),
                launch,
                stop,
                cancel,
            ),
        )
    }

    /// 停止隧道；已结束的隧道直接返回 Ok
    pub fn stop_tunnel(&self, id: &str) -> Result<()> {
        self.tunnels.request_stop(id)
    }

    /// 取出已结束隧道的重启信息，并从表中移除
    pub fn prepare_restart(&self, id: &str) -> Result<EcsRestartPlan> {
        let t = self.tunnels.take_finished(id)?;
        Ok(EcsRestartPlan {
            cluster_arn: t.cluster_arn.clone(),
            cluster_name: t.cluster_name.clone(),
            service_name: t.service_name.clone(),
            container_name: t.container_name.clone(),
            local_port: t.local_port,
            remote_port: t.remote_port,
            previous: t,
        })
    }

    /// 清除所有已结束（Terminated/Error）的隧道，返回清除数量
    pub fn clear_terminated(&self) -> usize {
        self.tunnels.clear_finished()
    }

    pub fn get_tunnels(&self) -> Vec<EcsTunnel> {
        self.tunnels.snapshot()
    }

    pub fn get_tunnel(&self, id: &str) -> Option<EcsTunnel> {
        self.tunnels.get(id)
    }

    pub fn live_count(&self) -> usize {
        self.tunnels.live_count()
    }

    /// 停止所有隧道并等待 supervisor 结束；超时返回 false
    pub async fn stop_all(&self, deadline: Duration) -> bool {
        self.tunnels.stop_all(deadline).await
    }
}

async fn supervise(
    ctx: Arc<TunnelContext>,
    table: TunnelTable<EcsTunnel>,
    id: String,
    mut launch: Launch,
    stop: CancellationToken,
    cancel: CancellationToken,
) {
    let readiness = supervisor::wait_until_ready(&mut launch, &ctx, &stop, &cancel, |port, pid| {
        table.update(&id, |t| {
            t.local_port = port;
            t.pid = pid;
        })
    })
    .await;

    match readiness {
        Readiness::Ready => {
            info!("ECS tunnel {} active on 127.0.0.1:{}", id, launch.lease.port());
            table.update(&id, |t| t.status = TunnelStatus::Active);
        }
        Readiness::Stopped => {
            finish(launch, &table, &id, TunnelStatus::Terminated, None);
            return;
        }
        Readiness::Cancelled => {
            finish(
                launch,
                &table,
                &id,
                TunnelStatus::Terminated,
                Some("start cancelled".to_string()),
            );
            return;
        }
        Readiness::Failed(e) => {
            error!("ECS tunnel {} failed to start: {}", id, e);
            finish(launch, &table, &id, TunnelStatus::Error, Some(e.to_string()));
            return;
        }
    }

    match supervisor::wait_for_exit(&mut launch, &ctx, &stop).await {
        Exit::Exited(reason) => {
            warn!("ECS tunnel {} terminated unexpectedly: {}", id, reason);
            finish(launch, &table, &id, TunnelStatus::Terminated, Some(reason));
        }
        Exit::Stopped => {
            info!("ECS tunnel {} stopped", id);
            finish(launch, &table, &id, TunnelStatus::Terminated, None);
        }
    }
}

/// 释放端口后再更新状态，保证状态可见时端口已可重新使用
fn finish(
    launch: Launch,
    table: &TunnelTable<EcsTunnel>,
    id: &str,
    status: TunnelStatus,
    error: Option<String>,
) {
    drop(launch);
    table.finish(id, status, error);
}
