/// AWS Signature Version 4 请求签名
///
/// 流程：规范请求 → 待签字符串 → HMAC 链（日期/区域/服务/aws4_request）→
/// Authorization 头。只签名 host、content-type、x-amz-* 与 x-apigw-api-id。
use crate::cloud::Credentials;
use crate::error::{Result, TunnelError};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use http::{Method, Uri};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const EXECUTE_API_SERVICE: &str = "execute-api";
/// 空请求体的 SHA-256
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub const X_AMZ_DATE: &str = "x-amz-date";
pub const X_AMZ_SECURITY_TOKEN: &str = "x-amz-security-token";

/// 签名所需参数
#[derive(Debug, Clone, Copy)]
pub struct SigningParams<'a> {
    pub credentials: &'a Credentials,
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

/// 请求体哈希（十六进制小写）
pub fn hash_payload(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| TunnelError::SigningError(format!("Invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// 派生签名密钥
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

/// URI 编码（RFC 3986 非保留字符之外全部编码）
pub fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        if is_unreserved(b) || (keep_slash && b == b'/') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// 百分号解码（非法序列原样保留）
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// 规范 URI：已编码的路径再编码一次（execute-api 不是 S3）
pub fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    uri_encode(path, true)
}

/// 规范查询串：解码后重新编码，按键、值排序
pub fn canonical_query(query: Option<&str>) -> String {
    let query = match query {
        Some(q) if !q.is_empty() => q,
        _ => return String::new(),
    };
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (
                uri_encode(&percent_decode(k), false),
                uri_encode(&percent_decode(v), false),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn is_signed_header(name: &str) -> bool {
    name == "host" || name == "content-type" || name == "x-apigw-api-id" || name.starts_with("x-amz-")
}

fn normalize_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 返回 (规范头部块, 签名头列表)
pub fn canonical_headers(headers: &HeaderMap) -> Result<(String, String)> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name = name.as_str().to_ascii_lowercase();
        if !is_signed_header(&name) {
            continue;
        }
        let value = value
            .to_str()
            .map_err(|_| TunnelError::SigningError(format!("Header {} is not valid text", name)))?;
        map.entry(name).or_default().push(normalize_value(value));
    }
    let mut block = String::new();
    for (name, values) in &map {
        block.push_str(name);
        block.push(':');
        block.push_str(&values.join(","));
        block.push('\n');
    }
    let signed = map.keys().cloned().collect::<Vec<_>>().join(";");
    Ok((block, signed))
}

/// 构造规范请求
pub fn canonical_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    payload_hash: &str,
) -> Result<(String, String)> {
    let (header_block, signed_headers) = canonical_headers(headers)?;
    let text = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.as_str(),
        canonical_uri(uri.path()),
        canonical_query(uri.query()),
        header_block,
        signed_headers,
        payload_hash
    );
    Ok((text, signed_headers))
}

/// 为请求添加 X-Amz-Date、X-Amz-Security-Token 与 Authorization
///
/// `headers` 中必须已包含上游 host。
pub fn sign(
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    payload_hash: &str,
    params: &SigningParams<'_>,
) -> Result<()> {
    let creds = params.credentials;
    if creds.access_key_id.is_empty() || creds.secret_access_key.is_empty() {
        return Err(TunnelError::SigningError(
            "Credentials are missing an access key or secret".to_string(),
        ));
    }
    if !headers.contains_key(http::header::HOST) {
        return Err(TunnelError::SigningError("Request has no Host header".to_string()));
    }

    let amz_date = params.time.format("%Y%m%dT%H%M%SZ").to_string();
    let date = params.time.format("%Y%m%d").to_string();

    headers.insert(HeaderName::from_static(X_AMZ_DATE), header_value(&amz_date)?);
    match creds.session_token {
        Some(ref token) => {
            headers.insert(HeaderName::from_static(X_AMZ_SECURITY_TOKEN), header_value(token)?);
        }
        None => {
            headers.remove(X_AMZ_SECURITY_TOKEN);
        }
    }

    let (canonical, signed_headers) = canonical_request(method, uri, headers, payload_hash)?;
    let scope = format!("{}/{}/{}/aws4_request", date, params.region, params.service);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical.as_bytes()))
    );

    let key = signing_key(&creds.secret_access_key, &date, params.region, params.service)?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, creds.access_key_id, scope, signed_headers, signature
    );
    headers.insert(AUTHORIZATION, header_value(&authorization)?);
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TunnelError::SigningError(format!("Invalid header value: {}", e)))
}
