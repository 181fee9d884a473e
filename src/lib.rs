/// SSM Tunnel 库入口
///
/// 隧道子系统：端口分配、session-manager 子进程、SigV4 签名代理、
/// 跳板机拓扑发现以及两个隧道管理器。
pub mod cli;
pub mod cloud;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod port;
pub mod proxy;
pub mod session;
pub mod sigv4;
pub mod tls;
pub mod topology;
pub mod tunnel;

// 重新导出常用类型
pub use cloud::{AwsCli, AwsProfile, CloudApi, Credentials, JumpHost, VpcEndpoint};
pub use config::AppConfig;
pub use error::{Result, TunnelError};
pub use port::{PortAllocator, PortLease};
pub use session::{AwsCliLauncher, ChildSession, SessionLauncher, SessionSpec};
pub use tunnel::{
    ApiTarget, EcsTunnelManager, GatewayTunnelManager, RegistryView, TunnelContext,
    TunnelSnapshot, TunnelStatus,
};
