use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::OutputFormat;
use crate::cloud::{AwsCli, AwsProfile, CloudApi};
use crate::config::{expand_path, AppConfig, DEFAULT_CONFIG_PATH};
use crate::topology::{EndpointChoice, TopologyRequest, TopologyResolver};

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

impl CheckResult {
    fn print(&self, format: OutputFormat) -> Result<()> {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(self)?),
            OutputFormat::Text => {
                if let Some(ref error) = self.error {
                    println!("✗ {}", error);
                }
                for warning in &self.warnings {
                    println!("⚠ Warning: {}", warning);
                }
                if self.valid {
                    println!("\n✓ Configuration is valid!");
                }
            }
        }
        Ok(())
    }
}

/// 解析最终使用的 profile 与区域（命令行优先于配置文件）
pub fn resolve_profile(
    config: &AppConfig,
    profile: Option<&str>,
    region: Option<&str>,
) -> Result<AwsProfile> {
    let region = region
        .map(str::to_string)
        .or_else(|| config.aws.region.clone())
        .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
        .filter(|r| !r.trim().is_empty())
        .context("No AWS region configured; use --region, aws.region or AWS_REGION")?;
    let name = profile
        .map(str::to_string)
        .or_else(|| config.aws.profile.clone());
    Ok(AwsProfile::new(name, region))
}

fn collect_warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Some(ref bundle) = config.proxy.ca_bundle {
        if !bundle.exists() {
            warnings.push(format!("CA bundle not found: {}", bundle.display()));
        }
    }
    let cli = Path::new(&config.aws.cli_path);
    if cli.components().count() > 1 && !cli.exists() {
        warnings.push(format!("aws CLI not found at {}", config.aws.cli_path));
    }
    warnings
}

fn config_details(config: &AppConfig, source: &str, profile: Option<&AwsProfile>) -> serde_json::Value {
    serde_json::json!({
        "source": source,
        "profile": profile.map(|p| p.display_name().to_string()),
        "region": profile.map(|p| p.region.clone()),
        "aws_cli": config.aws.cli_path,
        "port_range": format!("{}-{}", config.ports.start, config.ports.end),
        "start_timeout_secs": config.session.start_timeout_secs,
        "settle_ms": config.session.settle_ms,
        "request_timeout_secs": config.proxy.request_timeout_secs,
        "upstream_overrides": config.proxy.upstream_overrides.len(),
        "jump_host_id": config.topology.jump_host_id,
        "jump_host_tag": config.topology.jump_host_tag,
        "vpc_endpoint_id": config.topology.vpc_endpoint_id,
        "shutdown_timeout_secs": config.shutdown_timeout_secs,
    })
}

/// 检查配置；`probe` 为真时额外调用 AWS 验证凭证与拓扑发现
pub async fn check_config(
    config_path: Option<&str>,
    profile: Option<&str>,
    region: Option<&str>,
    format: OutputFormat,
    probe: bool,
) -> Result<()> {
    let source = match config_path {
        Some(p) => expand_path(p)?.display().to_string(),
        None => {
            let default = expand_path(DEFAULT_CONFIG_PATH)?;
            if default.exists() {
                default.display().to_string()
            } else {
                "defaults".to_string()
            }
        }
    };
    if format == OutputFormat::Text {
        println!("Checking configuration: {}\n", source);
    }

    let config = match AppConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("{:#}", e)),
                details: serde_json::json!({ "source": source }),
            };
            result.print(format)?;
            return Err(e);
        }
    };

    let mut warnings = collect_warnings(&config);
    let aws_profile = match resolve_profile(&config, profile, region) {
        Ok(p) => Some(p),
        Err(e) => {
            warnings.push(e.to_string());
            None
        }
    };
    let mut details = config_details(&config, &source, aws_profile.as_ref());

    if format == OutputFormat::Text {
        println!("✓ Port range: {}-{}", config.ports.start, config.ports.end);
        println!(
            "✓ Session: start timeout {}s, settle {}ms, stop grace {}s",
            config.session.start_timeout_secs,
            config.session.settle_ms,
            config.session.stop_grace_secs
        );
        println!("✓ aws CLI: {}", config.aws.cli_path);
        if let Some(ref p) = aws_profile {
            println!("✓ Profile: {} ({})", p.display_name(), p.region);
        }
    }

    if probe {
        let Some(aws_profile) = aws_profile else {
            anyhow::bail!("Cannot probe AWS without a region");
        };
        let cloud: Arc<dyn CloudApi> = Arc::new(AwsCli::new(config.aws.cli_path.clone(), aws_profile));
        match probe_aws(cloud, &config).await {
            Ok(probe) => {
                if format == OutputFormat::Text {
                    for line in &probe.lines {
                        println!("✓ {}", line);
                    }
                }
                warnings.extend(probe.warnings);
                details["probe"] = serde_json::json!(probe.lines);
            }
            Err(e) => {
                let result = CheckResult {
                    valid: false,
                    warnings,
                    error: Some(format!("{:#}", e)),
                    details,
                };
                result.print(format)?;
                return Err(e);
            }
        }
    }

    CheckResult {
        valid: true,
        warnings,
        error: None,
        details,
    }
    .print(format)
}

struct ProbeReport {
    lines: Vec<String>,
    warnings: Vec<String>,
}

async fn probe_aws(cloud: Arc<dyn CloudApi>, config: &AppConfig) -> Result<ProbeReport> {
    let mut report = ProbeReport {
        lines: Vec::new(),
        warnings: Vec::new(),
    };

    cloud
        .credentials()
        .await
        .context("Failed to obtain AWS credentials")?;
    report.lines.push("Credentials available".to_string());

    let endpoints = cloud
        .list_execute_api_vpc_endpoints()
        .await
        .context("Failed to list VPC endpoints")?;
    report
        .lines
        .push(format!("{} execute-api VPC endpoint(s)", endpoints.len()));

    let instances = cloud
        .list_ssm_managed_instances()
        .await
        .context("Failed to list SSM managed instances")?;
    report
        .lines
        .push(format!("{} SSM managed instance(s)", instances.len()));

    let resolver = TopologyResolver::new(cloud, config.topology.clone());
    match resolver.resolve(&TopologyRequest::default()).await {
        Ok(resolved) => {
            let endpoint = match resolved.endpoint {
                EndpointChoice::Discovered(ref ep) => format!("{} (discovered)", ep.endpoint_id),
                EndpointChoice::Configured(ref id) => format!("{} (configured)", id),
            };
            report.lines.push(format!(
                "Jump host {} ({}) with endpoint {}",
                resolved.jump_host.instance_id, resolved.jump_host.name, endpoint
            ));
        }
        Err(e) => report
            .warnings
            .push(format!("Private API tunnels unavailable: {}", e)),
    }

    Ok(report)
}
