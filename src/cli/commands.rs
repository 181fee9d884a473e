use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::config::{check_config, resolve_profile};
use super::{ApiKindArg, Cli, Commands, EndpointTypeArg};
use crate::cloud::{AwsCli, AwsProfile, CloudApi};
use crate::config::AppConfig;
use crate::dashboard::{self, Dashboard};
use crate::session::AwsCliLauncher;
use crate::topology::TopologyRequest;
use crate::tunnel::{
    ApiTarget, EcsContainer, EcsService, EcsTask, EcsTunnelManager, EndpointType,
    GatewayTunnelManager, RegistryView, TunnelContext,
};

/// 无界面模式下检查隧道是否仍存活的间隔
const HEADLESS_POLL: Duration = Duration::from_millis(500);

/// 执行命令
///
/// 返回 `Ok(true)` 表示所有隧道在关闭期限内停止；`Ok(false)` 表示关闭超时。
pub async fn execute_command(cli: &Cli) -> Result<bool> {
    if let Some(Commands::Check { format, probe }) = cli.command {
        check_config(
            cli.config.as_deref(),
            cli.profile.as_deref(),
            cli.region.as_deref(),
            format,
            probe,
        )
        .await?;
        return Ok(true);
    }

    let config = AppConfig::load(cli.config.as_deref())?;
    let profile = resolve_profile(&config, cli.profile.as_deref(), cli.region.as_deref())?;
    info!(
        "Using profile {} in {}",
        profile.display_name(),
        profile.region
    );

    let cloud: Arc<dyn CloudApi> = Arc::new(AwsCli::new(config.aws.cli_path.clone(), profile.clone()));
    let launcher = Arc::new(AwsCliLauncher::new(config.aws.cli_path.clone()));
    let ctx = TunnelContext::new(&config, cloud, launcher)
        .context("Failed to initialise tunnel context")?;
    let registry = RegistryView::new(
        Arc::new(EcsTunnelManager::new(ctx.clone())),
        Arc::new(GatewayTunnelManager::new(ctx)),
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    let result = run(cli, &profile, &registry, shutdown.clone()).await;
    if let Err(ref e) = result {
        error!("{:#}", e);
    }

    let clean = registry.stop_all(config.shutdown_timeout()).await;
    if clean {
        info!("All tunnels stopped");
    }
    result.map(|_| clean)
}

async fn run(
    cli: &Cli,
    profile: &AwsProfile,
    registry: &RegistryView,
    shutdown: CancellationToken,
) -> Result<()> {
    match cli.command {
        Some(Commands::Ecs {
            ref cluster,
            ref service,
            ref task,
            ref container,
            ref runtime_id,
            remote_port,
            local_port,
            headless,
        }) => {
            let (cluster_arn, cluster_name) = split_cluster(cluster);
            let tunnel = registry
                .ecs()
                .start_tunnel(
                    &EcsService {
                        service_name: service.clone(),
                        cluster_arn,
                        cluster_name,
                    },
                    &EcsTask {
                        task_id: task.clone(),
                    },
                    &EcsContainer {
                        name: container.clone(),
                        runtime_id: runtime_id.clone(),
                    },
                    remote_port,
                    local_port,
                    shutdown.clone(),
                )
                .await
                .context("Failed to start ECS tunnel")?;
            println!(
                "{}: 127.0.0.1:{} -> {}/{}:{}",
                tunnel.id, tunnel.local_port, tunnel.service_name, tunnel.container_name, remote_port
            );
            present(cli, profile, registry, shutdown, headless).await
        }
        Some(Commands::Api {
            ref api_id,
            ref name,
            kind,
            endpoint_type,
            ref api_endpoint,
            ref stage,
            local_port,
            ref jump_host,
            ref jump_host_tag,
            ref vpc_endpoint,
            headless,
        }) => {
            let api = build_api_target(
                api_id,
                name.as_deref(),
                kind,
                endpoint_type,
                api_endpoint.as_deref(),
                &profile.region,
            );
            let gateway = registry.gateway();
            let started = if api.is_private() {
                let request = TopologyRequest {
                    jump_host_id: jump_host.clone(),
                    jump_host_tag: jump_host_tag.clone(),
                    vpc_endpoint_id: vpc_endpoint.clone(),
                };
                gateway
                    .start_private_tunnel_auto(&api, stage, &request, local_port, shutdown.clone())
                    .await
            } else {
                gateway
                    .start_public_tunnel(&api, stage, local_port, shutdown.clone())
                    .await
            };
            let tunnel = started.context("Failed to start API tunnel")?;
            println!(
                "{}: http://127.0.0.1:{} -> https://{}",
                tunnel.id, tunnel.local_port, tunnel.upstream_host
            );
            if let Some(ref notice) = tunnel.notice {
                println!("Note: {}", notice);
            }
            present(cli, profile, registry, shutdown, headless).await
        }
        Some(Commands::Check { .. }) => Ok(()),
        None => present(cli, profile, registry, shutdown, false).await,
    }
}

/// 显示仪表盘，或在无界面模式下等待中断或所有隧道结束
async fn present(
    cli: &Cli,
    profile: &AwsProfile,
    registry: &RegistryView,
    shutdown: CancellationToken,
    headless: bool,
) -> Result<()> {
    if !headless {
        let dashboard = Dashboard::new(profile.display_name(), profile.region.clone(), cli.view);
        return dashboard::run_dashboard(registry.clone(), dashboard).await;
    }

    let mut poll = tokio::time::interval(HEADLESS_POLL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = poll.tick() => {
                if registry.live_count() == 0 {
                    for t in registry.snapshot() {
                        if let Some(e) = t.last_error() {
                            println!("{}: {} ({})", t.id(), t.status(), e);
                        }
                    }
                    anyhow::bail!("All tunnels have ended");
                }
            }
        }
    }
}

/// 集群参数可以是名称或 ARN；返回 (arn, name)
fn split_cluster(cluster: &str) -> (String, String) {
    let name = cluster
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(cluster)
        .to_string();
    (cluster.to_string(), name)
}

fn build_api_target(
    api_id: &str,
    name: Option<&str>,
    kind: ApiKindArg,
    endpoint_type: EndpointTypeArg,
    api_endpoint: Option<&str>,
    region: &str,
) -> ApiTarget {
    let name = name.unwrap_or(api_id).to_string();
    match kind {
        ApiKindArg::Rest => ApiTarget::RestV1 {
            api_id: api_id.to_string(),
            name,
            endpoint_type: match endpoint_type {
                EndpointTypeArg::Regional => EndpointType::Regional,
                EndpointTypeArg::Edge => EndpointType::Edge,
                EndpointTypeArg::Private => EndpointType::Private,
            },
        },
        ApiKindArg::Http => ApiTarget::HttpV2 {
            api_id: api_id.to_string(),
            name,
            api_endpoint: api_endpoint.map(str::to_string).unwrap_or_else(|| {
                format!("https://{}.execute-api.{}.amazonaws.com", api_id, region)
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_cluster() {
        assert_eq!(
            split_cluster("arn:aws:ecs:us-east-1:123456789012:cluster/prod"),
            (
                "arn:aws:ecs:us-east-1:123456789012:cluster/prod".to_string(),
                "prod".to_string()
            )
        );
        assert_eq!(split_cluster("prod"), ("prod".to_string(), "prod".to_string()));
    }

    #[test]
    fn test_build_api_target() {
        let api = build_api_target(
            "a1b2",
            None,
            ApiKindArg::Rest,
            EndpointTypeArg::Private,
            None,
            "us-east-1",
        );
        assert!(api.is_private());
        assert_eq!(api.name(), "a1b2");

        let api = build_api_target(
            "x9",
            Some("users"),
            ApiKindArg::Http,
            EndpointTypeArg::Private,
            None,
            "eu-west-1",
        );
        assert!(!api.is_private());
        assert_eq!(
            api.upstream_host("eu-west-1").unwrap(),
            "x9.execute-api.eu-west-1.amazonaws.com"
        );
    }
}
