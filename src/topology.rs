/// 私有 API 网关拓扑发现
///
/// 为私有网关选择跳板机与 execute-api VPC endpoint：
/// 1. 列出 execute-api VPC endpoint，按 vpc_id 建索引；
/// 2. 在 SSM 托管实例中按层级挑选跳板机，同层优先选择有 endpoint 的 VPC；
/// 3. 跳板机所在 VPC 有 endpoint 时直接使用，否则退回到配置的 endpoint ID
///    （跨账户场景），两者都没有时报错。
use crate::cloud::{CloudApi, JumpHost, VpcEndpoint};
use crate::config::TopologyConfig;
use crate::error::{Result, TunnelError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `Key=Value` 形式的标签选择器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSelector {
    pub key: String,
    pub value: String,
}

impl TagSelector {
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok(Self {
                key: k.trim().to_string(),
                value: v.trim().to_string(),
            }),
            _ => Err(TunnelError::config_error(format!(
                "Invalid tag selector '{}', expected Key=Value",
                s
            ))),
        }
    }

    pub fn matches(&self, host: &JumpHost) -> bool {
        host.has_tag(&self.key, &self.value)
    }
}

impl fmt::Display for TagSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// 调用方给出的拓扑选择条件（缺省项使用配置中的默认值）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyRequest {
    pub jump_host_id: Option<String>,
    pub jump_host_tag: Option<String>,
    pub vpc_endpoint_id: Option<String>,
}

/// endpoint 来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointSource {
    /// 与跳板机同一 VPC 中发现
    Discovered,
    /// 用户配置的 endpoint（跨账户）
    Configured,
}

impl fmt::Display for EndpointSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Configured => write!(f, "configured"),
        }
    }
}

/// endpoint 选择结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointChoice {
    Discovered(VpcEndpoint),
    /// 仅知道 ID，需要再查询一次
    Configured(String),
}

/// 拓扑发现结果
#[derive(Debug, Clone)]
pub struct ResolvedTopology {
    pub jump_host: JumpHost,
    pub endpoint: EndpointChoice,
}

impl ResolvedTopology {
    /// 同一 VPC 中发现的 endpoint（用于 `start_private_tunnel`）
    pub fn discovered_endpoint(&self) -> Option<&VpcEndpoint> {
        match self.endpoint {
            EndpointChoice::Discovered(ref ep) => Some(ep),
            EndpointChoice::Configured(_) => None,
        }
    }

    pub fn configured_endpoint_id(&self) -> Option<&str> {
        match self.endpoint {
            EndpointChoice::Configured(ref id) => Some(id),
            EndpointChoice::Discovered(_) => None,
        }
    }
}

/// 合并后的跳板机选择条件
#[derive(Debug, Clone, Default)]
pub struct JumpHostCriteria {
    pub explicit_id: Option<String>,
    pub explicit_tag: Option<TagSelector>,
    pub default_tags: Vec<TagSelector>,
    pub default_names: Vec<String>,
}

/// 在候选实例中选择跳板机
pub fn select_jump_host(
    instances: &[JumpHost],
    preferred_vpcs: &HashSet<String>,
    criteria: &JumpHostCriteria,
) -> Result<JumpHost> {
    let candidates: Vec<&JumpHost> = instances
        .iter()
        .filter(|h| h.ssm_managed && h.state.is_usable())
        .collect();

    if let Some(ref id) = criteria.explicit_id {
        return candidates
            .iter()
            .find(|h| &h.instance_id == id)
            .map(|h| (*h).clone())
            .ok_or_else(|| {
                TunnelError::NoJumpHost(format!(
                    "instance {} is not a running SSM-managed instance",
                    id
                ))
            });
    }

    let names: Vec<String> = criteria
        .default_names
        .iter()
        .map(|n| n.to_lowercase())
        .collect();

    let tiers: [Box<dyn Fn(&JumpHost) -> bool + '_>; 3] = [
        Box::new(|h: &JumpHost| criteria.explicit_tag.as_ref().map(|t| t.matches(h)).unwrap_or(false)),
        Box::new(|h: &JumpHost| criteria.default_tags.iter().any(|t| t.matches(h))),
        Box::new(|h: &JumpHost| {
            let name = h.name.to_lowercase();
            names.iter().any(|n| name.contains(n.as_str()))
        }),
    ];

    for (tier, matcher) in tiers.iter().enumerate() {
        let mut matched: Vec<&JumpHost> = candidates.iter().copied().filter(|h| matcher(h)).collect();
        if matched.is_empty() {
            continue;
        }
        matched.sort_by(|a, b| {
            let a_pref = preferred_vpcs.contains(&a.vpc_id);
            let b_pref = preferred_vpcs.contains(&b.vpc_id);
            b_pref
                .cmp(&a_pref)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        debug!(
            "Jump host tier {} matched {} candidates",
            tier,
            matched.len()
        );
        return Ok(matched[0].clone());
    }

    Err(TunnelError::NoJumpHost(format!(
        "none of {} SSM-managed instances matched the jump host selectors",
        candidates.len()
    )))
}

/// 为跳板机选择 endpoint
pub fn choose_endpoint(
    host: &JumpHost,
    index: &HashMap<String, VpcEndpoint>,
    configured_id: Option<&str>,
) -> Result<EndpointChoice> {
    if let Some(ep) = index.get(&host.vpc_id) {
        return Ok(EndpointChoice::Discovered(ep.clone()));
    }
    match configured_id {
        Some(id) => Ok(EndpointChoice::Configured(id.to_string())),
        None => Err(TunnelError::NoUsableEndpoint {
            vpc_id: host.vpc_id.clone(),
        }),
    }
}

/// 按 vpc_id 建立 endpoint 索引（同一 VPC 多个时取 ID 最小者）
pub fn index_endpoints(endpoints: Vec<VpcEndpoint>) -> HashMap<String, VpcEndpoint> {
    let mut index: HashMap<String, VpcEndpoint> = HashMap::new();
    for ep in endpoints {
        match index.get(&ep.vpc_id) {
            Some(existing) if existing.endpoint_id <= ep.endpoint_id => {}
            _ => {
                index.insert(ep.vpc_id.clone(), ep);
            }
        }
    }
    index
}

/// 拓扑解析器
pub struct TopologyResolver {
    cloud: Arc<dyn CloudApi>,
    defaults: TopologyConfig,
}

impl TopologyResolver {
    pub fn new(cloud: Arc<dyn CloudApi>, defaults: TopologyConfig) -> Self {
        Self { cloud, defaults }
    }

    fn criteria(&self, request: &TopologyRequest) -> Result<JumpHostCriteria> {
        let explicit_tag = request
            .jump_host_tag
            .as_deref()
            .or(self.defaults.jump_host_tag.as_deref())
            .map(TagSelector::parse)
            .transpose()?;
        let default_tags = self
            .defaults
            .candidate_tags
            .iter()
            .map(|t| TagSelector::parse(t))
            .collect::<Result<Vec<_>>>()?;
        Ok(JumpHostCriteria {
            explicit_id: request
                .jump_host_id
                .clone()
                .or_else(|| self.defaults.jump_host_id.clone()),
            explicit_tag,
            default_tags,
            default_names: self.defaults.candidate_names.clone(),
        })
    }

    pub async fn resolve(&self, request: &TopologyRequest) -> Result<ResolvedTopology> {
        let criteria = self.criteria(request)?;
        let configured_id = request
            .vpc_endpoint_id
            .clone()
            .or_else(|| self.defaults.vpc_endpoint_id.clone());

        let endpoints = self.cloud.list_execute_api_vpc_endpoints().await?;
        let index = index_endpoints(endpoints);
        let preferred_vpcs: HashSet<String> = index.keys().cloned().collect();
        debug!("execute-api endpoints found in VPCs: {:?}", preferred_vpcs);

        let instances = self.cloud.list_ssm_managed_instances().await?;
        let jump_host = select_jump_host(&instances, &preferred_vpcs, &criteria)?;
        let endpoint = choose_endpoint(&jump_host, &index, configured_id.as_deref())?;

        match endpoint {
            EndpointChoice::Discovered(ref ep) => info!(
                "Selected jump host {} ({}) with endpoint {} in {}",
                jump_host.instance_id, jump_host.name, ep.endpoint_id, ep.vpc_id
            ),
            EndpointChoice::Configured(ref id) => warn!(
                "Jump host {} is in {} which has no execute-api endpoint, falling back to configured endpoint {}",
                jump_host.instance_id, jump_host.vpc_id, id
            ),
        }

        Ok(ResolvedTopology {
            jump_host,
            endpoint,
        })
    }
}
