/// 本地端口分配
///
/// 在配置的端口范围内分配回环端口。空闲判断方式为：在 127.0.0.1 上绑定一个
/// TCP 监听并立即关闭；同时在进程内记录已分配的端口，保证两个存活隧道不会
/// 共享同一个端口。租约（`PortLease`）释放时归还端口。
use crate::config::PortRangeConfig;
use crate::error::{Result, TunnelError};
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tracing::{debug, warn};

/// 端口分配器（两个管理器共享同一个实例）
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRangeConfig,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRangeConfig) -> Arc<Self> {
        Arc::new(Self {
            range,
            reserved: Mutex::new(HashSet::new()),
        })
    }

    pub fn range(&self) -> PortRangeConfig {
        self.range
    }

    /// 分配端口
    ///
    /// `None` 或 `Some(0)` 表示在范围内随机探测；指定端口时若已被预留或绑定
    /// 失败则返回 `PortBusy`。
    pub fn allocate(self: &Arc<Self>, requested: Option<u16>) -> Result<PortLease> {
        match requested {
            Some(port) if port != 0 => self.allocate_specific(port),
            _ => self.allocate_auto(),
        }
    }

    fn allocate_specific(self: &Arc<Self>, port: u16) -> Result<PortLease> {
        let mut reserved = self.reserved.lock();
        if reserved.contains(&port) {
            debug!("Port {} is reserved by another tunnel", port);
            return Err(TunnelError::PortBusy(port));
        }
        if !probe_port(port) {
            debug!("Port {} failed the bind probe", port);
            return Err(TunnelError::PortBusy(port));
        }
        reserved.insert(port);
        Ok(PortLease {
            port,
            allocator: Arc::clone(self),
        })
    }

    fn allocate_auto(self: &Arc<Self>) -> Result<PortLease> {
        let PortRangeConfig {
            start,
            end,
            max_attempts,
        } = self.range;
        let mut rng = rand::rng();

        for attempt in 0..max_attempts {
            let port = rng.random_range(start..=end);
            let mut reserved = self.reserved.lock();
            if reserved.contains(&port) {
                continue;
            }
            if probe_port(port) {
                reserved.insert(port);
                debug!("Allocated port {} after {} attempts", port, attempt + 1);
                return Ok(PortLease {
                    port,
                    allocator: Arc::clone(self),
                });
            }
        }

        warn!(
            "No free port in {}-{} after {} attempts",
            start, end, max_attempts
        );
        Err(TunnelError::PortExhausted {
            start,
            end,
            attempts: max_attempts,
        })
    }

    /// 端口是否被进程内的某个租约持有
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    /// 当前持有的租约数
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            debug!("Released port {}", port);
        }
    }
}

/// 端口租约，Drop 时自动归还
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.port))
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

/// 在 127.0.0.1 上绑定并立即关闭，判断端口是否空闲
fn probe_port(port: u16) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
        Ok(s) => s,
        Err(_) => return false,
    };
    socket.bind(&addr.into()).and_then(|_| socket.listen(1)).is_ok()
}
