pub mod commands;
pub mod config;

pub use commands::execute_command;

use crate::dashboard::View;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "ssm-tunnel")]
#[command(author, version, about = "SSM port-forwarding and signed API gateway tunnels", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// AWS profile（覆盖配置文件）
    #[arg(long, env = "AWS_PROFILE", global = true)]
    pub profile: Option<String>,

    /// AWS 区域（覆盖配置文件）
    #[arg(long, env = "AWS_REGION", global = true)]
    pub region: Option<String>,

    /// 仪表盘显示的隧道类型
    #[arg(long, value_enum, default_value_t = View::All, global = true)]
    pub view: View,

    /// 配置文件路径（默认 ~/.config/ssm-tunnel/config.toml）
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<String>,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// 是否以全屏仪表盘方式运行（决定日志输出位置）
    pub fn uses_dashboard(&self) -> bool {
        match self.command {
            None => true,
            Some(Commands::Ecs { headless, .. }) | Some(Commands::Api { headless, .. }) => {
                !headless
            }
            Some(Commands::Check { .. }) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ApiKindArg {
    Rest,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EndpointTypeArg {
    Regional,
    Edge,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 转发 ECS 容器端口到本地
    Ecs {
        /// 集群名称或 ARN
        #[arg(long)]
        cluster: String,

        /// 服务名称
        #[arg(long)]
        service: String,

        /// 任务 ID
        #[arg(long)]
        task: String,

        /// 容器名称
        #[arg(long)]
        container: String,

        /// 容器运行时 ID
        #[arg(long)]
        runtime_id: String,

        /// 容器内端口
        #[arg(long)]
        remote_port: u16,

        /// 本地端口（默认自动分配）
        #[arg(long)]
        local_port: Option<u16>,

        /// 不显示仪表盘，直到 Ctrl-C
        #[arg(long)]
        headless: bool,
    },
    /// 为 API 网关启动本地签名代理
    Api {
        /// API ID
        #[arg(long)]
        api_id: String,

        /// API 名称（仅用于显示）
        #[arg(long)]
        name: Option<String>,

        /// REST (v1) 或 HTTP (v2) API
        #[arg(long, value_enum, default_value_t = ApiKindArg::Rest)]
        kind: ApiKindArg,

        /// REST API 的 endpoint 类型
        #[arg(long, value_enum, default_value_t = EndpointTypeArg::Regional)]
        endpoint_type: EndpointTypeArg,

        /// HTTP API 的 endpoint URL（默认由 API ID 和区域推导）
        #[arg(long, value_name = "URL")]
        api_endpoint: Option<String>,

        /// stage 名称
        #[arg(long, default_value = "$default")]
        stage: String,

        /// 本地端口（默认自动分配）
        #[arg(long)]
        local_port: Option<u16>,

        /// 跳板机实例 ID（私有 API）
        #[arg(long)]
        jump_host: Option<String>,

        /// 跳板机标签选择器 KEY=VALUE（私有 API）
        #[arg(long, value_name = "KEY=VALUE")]
        jump_host_tag: Option<String>,

        /// 跨账户时使用的 execute-api VPC endpoint ID（私有 API）
        #[arg(long)]
        vpc_endpoint: Option<String>,

        /// 不显示仪表盘，直到 Ctrl-C
        #[arg(long)]
        headless: bool,
    },
    /// 检查配置文件与 AWS 访问
    Check {
        /// 输出格式
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// 同时调用 AWS 验证凭证与跳板机发现
        #[arg(long)]
        probe: bool,
    },
}
