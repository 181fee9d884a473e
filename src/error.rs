/// 自定义错误类型
///
/// 使用 thiserror 定义隧道子系统的错误分类，调用者（UI）可以按类别决定
/// 如何展示或是否提供重启操作
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 隧道子系统的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 请求的本地端口已被占用
    #[error("Local port {0} is already in use")]
    PortBusy(u16),

    /// 端口范围内找不到空闲端口
    #[error("No free local port in {start}-{end} after {attempts} attempts")]
    PortExhausted { start: u16, end: u16, attempts: u32 },

    /// 无法启动 session-manager 子进程（可执行文件缺失、权限不足等）
    #[error("Failed to launch session manager '{program}': {source}")]
    ChildLaunchFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    /// 子进程在就绪之前退出
    #[error("Session manager exited before the tunnel was ready: {0}")]
    ChildExitedEarly(String),

    /// 就绪探测超时
    #[error("Tunnel was not ready after {0:?}")]
    ReadinessTimeout(Duration),

    /// 与网关通信失败
    #[error("Upstream error: {0}")]
    UpstreamError(String),

    /// 凭证缺失或格式错误，无法签名
    #[error("Signing error: {0}")]
    SigningError(String),

    /// 拓扑发现找不到可用的 VPC endpoint
    #[error("No execute-api VPC endpoint usable from VPC {vpc_id} and no endpoint id configured")]
    NoUsableEndpoint { vpc_id: String },

    /// 找不到可用的跳板机
    #[error("No usable jump host: {0}")]
    NoJumpHost(String),

    /// 隧道 ID 不存在
    #[error("Tunnel '{0}' not found")]
    NotFound(String),

    /// 当前状态不允许该操作
    #[error("Tunnel '{id}' is {status}: {reason}")]
    InvalidState {
        id: String,
        status: String,
        reason: String,
    },

    /// 操作被取消
    #[error("Operation cancelled")]
    Cancelled,

    /// 云服务调用失败（原样透传 CLI 的错误输出）
    #[error("AWS error: {0}")]
    Cloud(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建子进程启动失败错误
    pub fn launch_failed(program: impl Into<String>, source: io::Error) -> Self {
        Self::ChildLaunchFailed {
            program: program.into(),
            source,
        }
    }

    /// 创建隧道未找到错误
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// 创建状态错误
    pub fn invalid_state(
        id: impl Into<String>,
        status: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.into(),
            status: status.to_string(),
            reason: reason.into(),
        }
    }

    /// 创建云服务错误
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 检查是否为端口占用
    pub fn is_port_busy(&self) -> bool {
        matches!(self, Self::PortBusy(_))
    }

    /// 检查是否为隧道未找到
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// 检查是否为状态错误
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// 检查是否为就绪超时
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadinessTimeout(_))
    }

    /// 本地端口绑定竞争（可在管理器内部重试一次）
    pub fn is_bind_race(&self) -> bool {
        match self {
            Self::PortBusy(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::AddrInUse,
            _ => false,
        }
    }
}
