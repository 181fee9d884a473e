use super::{AwsProfile, CloudApi, Credentials, InstanceState, JumpHost, VpcEndpoint};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tokio::process::Command;
use tracing::{debug, warn};

/// 凭证在过期前多久刷新
const CREDENTIAL_REFRESH_MARGIN_MINUTES: i64 = 5;

/// 通过 `aws` 命令行访问云服务（认证、SSO 等由 CLI 自行处理）
pub struct AwsCli {
    program: String,
    profile: AwsProfile,
    cached: Mutex<Option<Credentials>>,
}

impl AwsCli {
    pub fn new(program: impl Into<String>, profile: AwsProfile) -> Self {
        Self {
            program: program.into(),
            profile,
            cached: Mutex::new(None),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(ref name) = self.profile.name {
            cmd.args(["--profile", name]);
        }
        cmd.args(["--region", &self.profile.region]);
        cmd.kill_on_drop(true);
        cmd
    }

    /// 执行一条 CLI 命令并返回 JSON 输出；失败时原样返回 stderr
    async fn run_json(&self, args: &[&str]) -> Result<String> {
        debug!("aws {}", args.join(" "));
        let output = self
            .command()
            .args(args)
            .args(["--output", "json"])
            .output()
            .await
            .map_err(|e| TunnelError::launch_failed(self.program.clone(), e))?;
        if !output.status.success() {
            return Err(TunnelError::cloud(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn fetch_credentials(&self) -> Result<Credentials> {
        let json = self
            .run_json(&["configure", "export-credentials", "--format", "process"])
            .await?;
        serde_json::from_str(&json)
            .map_err(|e| TunnelError::SigningError(format!("Unreadable credentials: {}", e)))
    }
}

#[async_trait]
impl CloudApi for AwsCli {
    fn profile(&self) -> &AwsProfile {
        &self.profile
    }

    async fn list_execute_api_vpc_endpoints(&self) -> Result<Vec<VpcEndpoint>> {
        let filter = format!(
            "Name=service-name,Values=com.amazonaws.{}.execute-api",
            self.profile.region
        );
        let json = self
            .run_json(&["ec2", "describe-vpc-endpoints", "--filters", &filter])
            .await?;
        let resp: RawVpcEndpointsResponse = parse(&json)?;
        Ok(resp.vpc_endpoints.into_iter().map(Into::into).collect())
    }

    async fn list_ssm_managed_instances(&self) -> Result<Vec<JumpHost>> {
        let json = self
            .run_json(&["ssm", "describe-instance-information"])
            .await?;
        let ssm: RawSsmResponse = parse(&json)?;
        let managed: HashSet<String> = ssm
            .instance_information_list
            .into_iter()
            .filter(|i| i.ping_status.as_deref() != Some("ConnectionLost"))
            .map(|i| i.instance_id)
            .filter(|id| id.starts_with("i-"))
            .collect();
        if managed.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["ec2", "describe-instances", "--instance-ids"];
        let ids: Vec<&str> = managed.iter().map(String::as_str).collect();
        args.extend(ids);
        let json = self.run_json(&args).await?;
        let resp: RawInstancesResponse = parse(&json)?;

        Ok(resp
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .filter_map(|raw| {
                let vpc_id = match raw.vpc_id {
                    Some(v) => v,
                    None => {
                        warn!("Instance {} has no VPC, skipping", raw.instance_id);
                        return None;
                    }
                };
                let tags: HashMap<String, String> = raw
                    .tags
                    .unwrap_or_default()
                    .into_iter()
                    .map(|t| (t.key, t.value))
                    .collect();
                Some(JumpHost {
                    name: tags.get("Name").cloned().unwrap_or_default(),
                    ssm_managed: managed.contains(&raw.instance_id),
                    instance_id: raw.instance_id,
                    vpc_id,
                    private_ip: raw.private_ip,
                    state: InstanceState::parse(&raw.state.name),
                    tags,
                })
            })
            .collect())
    }

    async fn describe_vpc_endpoint(&self, endpoint_id: &str) -> Result<VpcEndpoint> {
        let json = self
            .run_json(&["ec2", "describe-vpc-endpoints", "--vpc-endpoint-ids", endpoint_id])
            .await?;
        let resp: RawVpcEndpointsResponse = parse(&json)?;
        resp.vpc_endpoints
            .into_iter()
            .next()
            .map(Into::into)
            .ok_or_else(|| TunnelError::cloud(format!("VPC endpoint {} not found", endpoint_id)))
    }

    async fn credentials(&self) -> Result<Credentials> {
        let margin = chrono::Duration::minutes(CREDENTIAL_REFRESH_MARGIN_MINUTES);
        if let Some(creds) = self.cached.lock().as_ref() {
            if !creds.is_expired(Utc::now(), margin) {
                return Ok(creds.clone());
            }
        }
        let creds = self.fetch_credentials().await?;
        *self.cached.lock() = Some(creds.clone());
        Ok(creds)
    }
}

fn parse<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| TunnelError::cloud(format!("Unexpected CLI output: {}", e)))
}

// ── CLI JSON 结构 ──

#[derive(Debug, Deserialize)]
struct RawVpcEndpointsResponse {
    #[serde(rename = "VpcEndpoints", default)]
    vpc_endpoints: Vec<RawVpcEndpoint>,
}

#[derive(Debug, Deserialize)]
struct RawVpcEndpoint {
    #[serde(rename = "VpcEndpointId")]
    vpc_endpoint_id: String,
    #[serde(rename = "ServiceName", default)]
    service_name: String,
    #[serde(rename = "VpcId")]
    vpc_id: String,
    #[serde(rename = "DnsEntries", default)]
    dns_entries: Vec<RawDnsEntry>,
}

#[derive(Debug, Deserialize)]
struct RawDnsEntry {
    #[serde(rename = "DnsName")]
    dns_name: String,
}

impl From<RawVpcEndpoint> for VpcEndpoint {
    fn from(raw: RawVpcEndpoint) -> Self {
        VpcEndpoint {
            endpoint_id: raw.vpc_endpoint_id,
            service_name: raw.service_name,
            vpc_id: raw.vpc_id,
            dns_entries: raw.dns_entries.into_iter().map(|d| d.dns_name).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSsmResponse {
    #[serde(rename = "InstanceInformationList", default)]
    instance_information_list: Vec<RawSsmInfo>,
}

#[derive(Debug, Deserialize)]
struct RawSsmInfo {
    #[serde(rename = "InstanceId")]
    instance_id: String,
    #[serde(rename = "PingStatus", default)]
    ping_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawInstancesResponse {
    #[serde(rename = "Reservations", default)]
    reservations: Vec<RawReservation>,
}

#[derive(Debug, Deserialize)]
struct RawReservation {
    #[serde(rename = "Instances", default)]
    instances: Vec<RawInstance>,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    #[serde(rename = "InstanceId")]
    instance_id: String,
    #[serde(rename = "VpcId", default)]
    vpc_id: Option<String>,
    #[serde(rename = "PrivateIpAddress", default)]
    private_ip: Option<String>,
    #[serde(rename = "State")]
    state: RawState,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<RawTag>>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vpc_endpoints() {
        let json = r#"{
            "VpcEndpoints": [{
                "VpcEndpointId": "vpce-0abc",
                "VpcEndpointType": "Interface",
                "ServiceName": "com.amazonaws.us-east-1.execute-api",
                "VpcId": "vpc-1",
                "DnsEntries": [
                    {"DnsName": "vpce-0abc-xyz.execute-api.us-east-1.vpce.amazonaws.com", "HostedZoneId": "Z1"},
                    {"DnsName": "vpce-0abc-xyz-us-east-1a.execute-api.us-east-1.vpce.amazonaws.com", "HostedZoneId": "Z1"}
                ]
            }]
        }"#;
        let resp: RawVpcEndpointsResponse = parse(json).unwrap();
        let eps: Vec<VpcEndpoint> = resp.vpc_endpoints.into_iter().map(Into::into).collect();
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].vpc_id, "vpc-1");
        assert_eq!(
            eps[0].primary_dns(),
            Some("vpce-0abc-xyz.execute-api.us-east-1.vpce.amazonaws.com")
        );
    }

    #[test]
    fn test_parse_instances() {
        let json = r#"{"Reservations":[{"Instances":[{
            "InstanceId":"i-1","VpcId":"vpc-1","PrivateIpAddress":"10.0.0.5",
            "State":{"Code":16,"Name":"running"},
            "Tags":[{"Key":"Name","Value":"bastion-a"},{"Key":"Role","Value":"bastion"}]
        }]}]}"#;
        let resp: RawInstancesResponse = parse(json).unwrap();
        let raw = &resp.reservations[0].instances[0];
        assert_eq!(raw.instance_id, "i-1");
        assert_eq!(raw.state.name, "running");
        assert_eq!(raw.tags.as_ref().map(|t| t.len()), Some(2));
    }

    #[test]
    fn test_parse_error_is_cloud() {
        let err = parse::<RawSsmResponse>("not json").unwrap_err();
        assert!(matches!(err, TunnelError::Cloud(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let cli = AwsCli::new(
            "/nonexistent/aws-cli-binary",
            AwsProfile::new(None, "us-east-1"),
        );
        let err = cli.list_execute_api_vpc_endpoints().await.unwrap_err();
        assert!(matches!(err, TunnelError::ChildLaunchFailed { .. }));
    }
}
