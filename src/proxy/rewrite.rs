use http::header::{HeaderMap, CONNECTION};

/// 逐跳头部（不能转发）
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&name.as_str()) || name.starts_with("proxy-")
}

/// Connection 头中列出的额外逐跳头部
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn strip(headers: &HeaderMap, extra: impl Fn(&str) -> bool) -> HeaderMap {
    let listed = connection_listed(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let lower = name.as_str();
        if is_hop_by_hop(lower) || listed.iter().any(|l| l == lower) || extra(lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// 入站请求头清理：去掉逐跳头、Host、Content-Length 以及已有的签名相关头
pub fn sanitize_request_headers(headers: &HeaderMap) -> HeaderMap {
    strip(headers, |name| {
        name == "host"
            || name == "content-length"
            || name == "authorization"
            || name == "x-apigw-api-id"
            || name.starts_with("x-amz-")
    })
}

/// 上游响应头清理：只去掉逐跳头
pub fn sanitize_response_headers(headers: &HeaderMap) -> HeaderMap {
    strip(headers, |_| false)
}

/// 在路径前加 stage 前缀（已有前缀时不变）
pub fn rewrite_path(path: &str, stage_prefix: Option<&str>) -> String {
    let path = if path.is_empty() { "/" } else { path };
    let stage = match stage_prefix {
        Some(s) if !s.is_empty() => s.trim_matches('/'),
        _ => return path.to_string(),
    };
    let prefix = format!("/{}", stage);
    if path == prefix || path.starts_with(&format!("{}/", prefix)) {
        return path.to_string();
    }
    format!("{}{}", prefix, path)
}

/// 拼接路径与查询串
pub fn path_and_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    }
}
