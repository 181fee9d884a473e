use super::TunnelContext;
use crate::error::TunnelError;
use crate::port::PortLease;
use crate::session::{ChildSession, SessionSpec};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 一个 session-manager 子进程及其端口租约
pub(crate) struct Launch {
    pub child: ChildSession,
    pub lease: PortLease,
    pub spec: SessionSpec,
    /// 端口是否为自动分配（只有自动分配的端口才会在绑定竞争时重试）
    pub auto_port: bool,
}

/// 启动阶段的结果
pub(crate) enum Readiness {
    Ready,
    Stopped,
    Cancelled,
    Failed(TunnelError),
}

/// 子进程运行阶段的结果
pub(crate) enum Exit {
    /// 意外退出，附带原因
    Exited(String),
    Stopped,
}

fn is_addr_in_use(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("address already in use") || lower.contains("bind: address")
}

/// 等待子进程就绪
///
/// 自动分配的端口在子进程报告端口被占用时换一个端口重试一次，
/// `relaunched` 回调用于更新条目中的端口与 pid。失败、停止或取消时子进程
/// 已被回收。
pub(crate) async fn wait_until_ready(
    launch: &mut Launch,
    ctx: &TunnelContext,
    stop: &CancellationToken,
    cancel: &CancellationToken,
    mut relaunched: impl FnMut(u16, Option<u32>),
) -> Readiness {
    let mut retried = false;
    loop {
        let result = tokio::select! {
            r = launch.child.wait_ready(ctx.session.settle_interval(), ctx.session.start_timeout()) => r,
            _ = stop.cancelled() => {
                launch.child.stop(ctx.session.stop_grace()).await;
                return Readiness::Stopped;
            }
            _ = cancel.cancelled() => {
                launch.child.kill().await;
                return Readiness::Cancelled;
            }
        };

        match result {
            Ok(()) => return Readiness::Ready,
            Err(TunnelError::ChildExitedEarly(ref msg))
                if launch.auto_port && !retried && is_addr_in_use(msg) =>
            {
                retried = true;
                warn!(
                    "Local port {} was taken before the session manager bound it, retrying once",
                    launch.lease.port()
                );
                let lease = match ctx.ports.allocate(None) {
                    Ok(l) => l,
                    Err(e) => return Readiness::Failed(e),
                };
                let spec = launch.spec.clone().with_local_port(lease.port());
                let child = match ChildSession::spawn(ctx.launcher.as_ref(), &spec, &ctx.session).await {
                    Ok(c) => c,
                    Err(e) => return Readiness::Failed(e),
                };
                relaunched(lease.port(), child.pid());
                launch.child = child;
                launch.lease = lease;
                launch.spec = spec;
            }
            Err(e) => {
                launch.child.kill().await;
                return Readiness::Failed(e);
            }
        }
    }
}

/// 等待子进程退出或停止请求
pub(crate) async fn wait_for_exit(
    launch: &mut Launch,
    ctx: &TunnelContext,
    stop: &CancellationToken,
) -> Exit {
    tokio::select! {
        status = launch.child.wait() => {
            let reason = match status {
                Ok(status) => {
                    // 让输出抽取任务读完剩余数据
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    launch.child.exit_reason(status)
                }
                Err(e) => format!("Failed to wait for session manager: {}", e),
            };
            // 释放端口之前清理残留的 plugin 进程
            launch.child.reap_group();
            info!("Session manager for {} exited: {}", launch.spec.target, reason);
            Exit::Exited(reason)
        }
        _ = stop.cancelled() => {
            launch.child.stop(ctx.session.stop_grace()).await;
            Exit::Stopped
        }
    }
}
