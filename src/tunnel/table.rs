use super::{newest_first, TunnelStatus};
use crate::error::{Result, TunnelError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 等待启动中条目时的轮询间隔
const STARTING_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 表中记录需要提供的信息
pub(crate) trait TunnelRecord: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn status(&self) -> TunnelStatus;
    fn started_at(&self) -> DateTime<Utc>;
    fn set_status(&mut self, status: TunnelStatus);
    fn set_pid(&mut self, pid: Option<u32>);
    fn set_last_error(&mut self, error: String);
}

struct Entry<T> {
    tunnel: T,
    stop: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    supervised: bool,
}

/// id → 隧道条目 的表，由单个读写锁保护
///
/// 锁只在同步代码中持有；supervisor 只通过 id 访问条目。
pub(crate) struct TunnelTable<T> {
    kind: &'static str,
    inner: Arc<RwLock<HashMap<String, Entry<T>>>>,
}

impl<T> Clone for TunnelTable<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TunnelRecord> TunnelTable<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 插入新条目，返回其停止令牌
    pub fn insert(&self, tunnel: T) -> CancellationToken {
        let stop = CancellationToken::new();
        self.inner.write().insert(
            tunnel.id().to_string(),
            Entry {
                tunnel,
                stop: stop.clone(),
                supervisor: None,
                supervised: false,
            },
        );
        stop
    }

    /// 在持有写锁时启动 supervisor 并记录句柄，返回当前快照
    ///
    /// 条目已不存在时任务不会启动。
    pub fn spawn_supervisor<F>(&self, id: &str, task: F) -> Result<T>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut table = self.inner.write();
        let entry = table.get_mut(id).ok_or_else(|| TunnelError::not_found(id))?;
        entry.supervisor = Some(tokio::spawn(task));
        entry.supervised = true;
        Ok(entry.tunnel.clone())
    }

    /// 按 id 修改条目（条目可能已被移除）
    pub fn update(&self, id: &str, f: impl FnOnce(&mut T)) {
        if let Some(entry) = self.inner.write().get_mut(id) {
            f(&mut entry.tunnel);
        }
    }

    /// 写入最终状态并清空 pid
    pub fn finish(&self, id: &str, status: TunnelStatus, error: Option<String>) {
        self.update(id, |t| {
            t.set_status(status);
            t.set_pid(None);
            if let Some(e) = error {
                t.set_last_error(e);
            }
        });
    }

    pub fn request_stop(&self, id: &str) -> Result<()> {
        let table = self.inner.read();
        let entry = table.get(id).ok_or_else(|| TunnelError::not_found(id))?;
        if entry.tunnel.status().is_live() {
            info!("Stopping {} tunnel {}", self.kind, id);
            entry.stop.cancel();
        }
        Ok(())
    }

    /// 移除一个已结束的条目
    pub fn take_finished(&self, id: &str) -> Result<T> {
        let mut table = self.inner.write();
        let status = table
            .get(id)
            .map(|e| e.tunnel.status())
            .ok_or_else(|| TunnelError::not_found(id))?;
        if status.is_live() {
            return Err(TunnelError::invalid_state(
                id,
                status,
                "only terminated or failed tunnels can be restarted",
            ));
        }
        table
            .remove(id)
            .map(|e| e.tunnel)
            .ok_or_else(|| TunnelError::not_found(id))
    }

    /// 移除所有 Terminated 条目；Error 条目保留以便查看与重启
    pub fn clear_finished(&self) -> usize {
        let mut table = self.inner.write();
        let before = table.len();
        table.retain(|_, e| e.tunnel.status() != TunnelStatus::Terminated);
        before - table.len()
    }

    /// 值快照，按 started_at 倒序
    pub fn snapshot(&self) -> Vec<T> {
        let mut tunnels: Vec<T> = self
            .inner
            .read()
            .values()
            .map(|e| e.tunnel.clone())
            .collect();
        newest_first(&mut tunnels, |t| (t.started_at(), t.id()));
        tunnels
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.inner.read().get(id).map(|e| e.tunnel.clone())
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|e| e.tunnel.status().is_live())
            .count()
    }

    /// 停止全部并等待 supervisor 结束；超过 deadline 返回 false
    ///
    /// 仍在启动中（尚未登记 supervisor）的条目同样会被等待。
    pub async fn stop_all(&self, deadline: Duration) -> bool {
        match tokio::time::timeout(deadline, self.stop_and_join()).await {
            Ok(()) => true,
            Err(_) => {
                warn!("{} tunnels did not stop within {:?}", self.kind, deadline);
                false
            }
        }
    }

    async fn stop_and_join(&self) {
        loop {
            let (handles, starting) = {
                let mut table = self.inner.write();
                let mut starting = 0;
                let handles: Vec<JoinHandle<()>> = table
                    .values_mut()
                    .filter_map(|e| {
                        e.stop.cancel();
                        if !e.supervised && e.tunnel.status().is_live() {
                            starting += 1;
                        }
                        e.supervisor.take()
                    })
                    .collect();
                (handles, starting)
            };
            if handles.is_empty() && starting == 0 {
                return;
            }
            if !handles.is_empty() {
                info!("Stopping {} {} tunnel(s)", handles.len(), self.kind);
                futures::future::join_all(handles).await;
            } else {
                tokio::time::sleep(STARTING_POLL_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone)]
    struct Rec {
        id: String,
        status: TunnelStatus,
        started_at: DateTime<Utc>,
        pid: Option<u32>,
        last_error: Option<String>,
    }

    impl TunnelRecord for Rec {
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

    fn rec(id: &str, status: TunnelStatus, day: u32) -> Rec {
        Rec {
            id: id.to_string(),
            status,
            started_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            pid: Some(1),
            last_error: None,
        }
    }

    #[test]
    fn test_snapshot_order() {
        let table = TunnelTable::new("test");
        table.insert(rec("t-1", TunnelStatus::Active, 1));
        table.insert(rec("t-2", TunnelStatus::Active, 3));
        table.insert(rec("t-3", TunnelStatus::Active, 2));
        let ids: Vec<String> = table.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["t-2", "t-3", "t-1"]);
    }

    #[test]
    fn test_stop_requests() {
        let table = TunnelTable::new("test");
        let stop = table.insert(rec("t-1", TunnelStatus::Active, 1));
        table.insert(rec("t-2", TunnelStatus::Terminated, 1));

        assert!(table.request_stop("missing").unwrap_err().is_not_found());
        table.request_stop("t-2").unwrap();
        assert!(!stop.is_cancelled());
        table.request_stop("t-1").unwrap();
        table.request_stop("t-1").unwrap();
        assert!(stop.is_cancelled());
    }

    #[test]
    fn test_finish_and_take() {
        let table = TunnelTable::new("test");
        table.insert(rec("t-1", TunnelStatus::Active, 1));
        assert!(table.take_finished("t-1").unwrap_err().is_invalid_state());

        table.finish("t-1", TunnelStatus::Terminated, Some("boom".to_string()));
        let t = table.get("t-1").unwrap();
        assert_eq!(t.status, TunnelStatus::Terminated);
        assert_eq!(t.pid, None);
        assert_eq!(t.last_error.as_deref(), Some("boom"));

        let taken = table.take_finished("t-1").unwrap();
        assert_eq!(taken.id, "t-1");
        assert!(table.get("t-1").is_none());
        assert!(table.take_finished("t-1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_clear_finished_idempotent() {
        let table = TunnelTable::new("test");
        table.insert(rec("t-1", TunnelStatus::Active, 1));
        table.insert(rec("t-2", TunnelStatus::Terminated, 1));
        table.insert(rec("t-3", TunnelStatus::Error, 1));
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.clear_finished(), 1);
        assert_eq!(table.clear_finished(), 0);
        assert!(table.get("t-2").is_none());
        // Error 条目保留
        assert_eq!(table.get("t-3").unwrap().status, TunnelStatus::Error);
        assert_eq!(table.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_all_waits_for_supervisors() {
        let table = TunnelTable::new("test");
        let stop = table.insert(rec("t-1", TunnelStatus::Active, 1));
        let t = table.clone();
        table
            .spawn_supervisor("t-1", async move {
                stop.cancelled().await;
                t.finish("t-1", TunnelStatus::Terminated, None);
            })
            .unwrap();

        assert!(table.stop_all(Duration::from_secs(2)).await);
        assert_eq!(table.get("t-1").unwrap().status, TunnelStatus::Terminated);
        assert!(table.stop_all(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_stop_all_deadline() {
        let table = TunnelTable::new("test");
        table.insert(rec("t-1", TunnelStatus::Active, 1));
        table
            .spawn_supervisor("t-1", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
            })
            .unwrap();
        assert!(!table.stop_all(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_stop_all_waits_for_starting_entry() {
        let table = TunnelTable::new("test");
        let stop = table.insert(rec("t-1", TunnelStatus::Starting, 1));

        // 启动流程尚未登记 supervisor 时开始 stop_all
        let stopper = {
            let table = table.clone();
            tokio::spawn(async move { table.stop_all(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stopper.is_finished());
        assert!(stop.is_cancelled());

        let t = table.clone();
        table
            .spawn_supervisor("t-1", async move {
                stop.cancelled().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                t.finish("t-1", TunnelStatus::Terminated, None);
            })
            .unwrap();

        assert!(stopper.await.unwrap());
        assert_eq!(table.get("t-1").unwrap().status, TunnelStatus::Terminated);
    }

    #[tokio::test]
    async fn test_stop_all_ignores_finished_supervisor() {
        let table = TunnelTable::new("test");
        table.insert(rec("t-1", TunnelStatus::Active, 1));
        // supervisor 结束但未写回状态
        table.spawn_supervisor("t-1", async {}).unwrap();
        assert!(table.stop_all(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_spawn_supervisor_missing_entry() {
        let table: TunnelTable<Rec> = TunnelTable::new("test");
        assert!(table
            .spawn_supervisor("missing", async {})
            .unwrap_err()
            .is_not_found());
    }
}
