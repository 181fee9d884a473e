/// SigV4 签名代理
///
/// 在本地回环端口上监听 HTTP/1.1，请求经过路径重写、头部清理与 SigV4
/// 签名后发送到网关；响应按帧流式返回。单个请求失败只影响该请求，不会
/// 停止隧道。
mod rewrite;
mod upstream;

pub use rewrite::{
    is_hop_by_hop, path_and_query, rewrite_path, sanitize_request_headers,
    sanitize_response_headers,
};
pub use upstream::{build_client, UpstreamTarget};

use crate::cloud::CloudApi;
use crate::config::ProxyConfig;
use crate::error::{Result, TunnelError};
use crate::sigv4::{self, SigningParams, EXECUTE_API_SERVICE};
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use http::header::{HeaderValue, CONTENT_TYPE, HOST};
use http::{request, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub const API_ID_HEADER: &str = "x-apigw-api-id";

/// 代理共享状态
struct ProxyContext {
    client: reqwest::Client,
    target: UpstreamTarget,
    base_url: String,
    stage_prefix: Option<String>,
    region: String,
    cloud: Arc<dyn CloudApi>,
}

/// 本地签名代理
pub struct SigningProxy {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
}

impl SigningProxy {
    /// 使用已绑定的监听器创建代理
    pub fn new(
        listener: TcpListener,
        target: UpstreamTarget,
        stage_prefix: Option<String>,
        cloud: Arc<dyn CloudApi>,
        config: &ProxyConfig,
        extra_roots: &[reqwest::Certificate],
    ) -> Result<Self> {
        let client = build_client(config, &target, extra_roots)?;
        let region = cloud.profile().region.clone();
        Ok(Self {
            listener,
            ctx: Arc::new(ProxyContext {
                client,
                base_url: target.base_url(),
                target,
                stage_prefix,
                region,
                cloud,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn upstream_host(&self) -> &str {
        &self.ctx.target.host
    }

    /// 接受连接直到 `shutdown` 被取消；返回时关闭监听器并中止所有进行中的连接
    pub async fn serve(self, shutdown: CancellationToken) {
        let local = self.listener.local_addr().ok();
        info!(
            "Signing proxy on {:?} forwarding to {}",
            local, self.ctx.base_url
        );
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("Proxy connection from {}", peer);
                            let ctx = self.ctx.clone();
                            connections.spawn(async move {
                                let service = service_fn(move |req| {
                                    let ctx = ctx.clone();
                                    async move { Ok::<_, Infallible>(ctx.handle(req).await) }
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!("Proxy connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Proxy accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.abort_all();
        info!("Signing proxy on {:?} stopped", local);
    }
}

impl ProxyContext {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return text_response(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read request body: {}", e),
                );
            }
        };

        let method = parts.method.clone();
        let path = parts.uri.path().to_string();
        match self.forward(parts, body).await {
            Ok(resp) => {
                debug!("{} {} -> {}", method, path, resp.status());
                resp
            }
            Err(TunnelError::UpstreamError(msg)) => {
                warn!("{} {} failed: {}", method, path, msg);
                text_response(
                    StatusCode::BAD_GATEWAY,
                    format!("Upstream request failed: {}", msg),
                )
            }
            Err(e) => {
                error!("{} {} could not be signed: {}", method, path, e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to sign request: {}", e),
                )
            }
        }
    }

    async fn forward(&self, parts: request::Parts, body: Bytes) -> Result<Response<ProxyBody>> {
        let path = rewrite_path(parts.uri.path(), self.stage_prefix.as_deref());
        let pq = path_and_query(&path, parts.uri.query());
        let (url, sign_uri) = upstream_request_target(&self.base_url, &pq)?;

        let mut headers = sanitize_request_headers(&parts.headers);
        headers.insert(HOST, signing_header(&self.target.host)?);
        if let Some(ref api_id) = self.target.api_id_header {
            headers.insert(API_ID_HEADER, signing_header(api_id)?);
        }

        let credentials = self
            .cloud
            .credentials()
            .await
            .map_err(|e| TunnelError::SigningError(format!("No credentials: {}", e)))?;
        let params = SigningParams {
            credentials: &credentials,
            region: &self.region,
            service: EXECUTE_API_SERVICE,
            time: Utc::now(),
        };
        let payload_hash = sigv4::hash_payload(&body);
        sigv4::sign(&parts.method, &sign_uri, &mut headers, &payload_hash, &params)?;

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| TunnelError::UpstreamError(error_chain(&e)))?;

        let status = upstream.status();
        let headers = sanitize_response_headers(upstream.headers());
        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);

        let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// 解析上游 URL，并返回按 URL 序列化结果构造的签名用 URI
///
/// `url` 会重新编码 `{`、`}`、`"` 等字符，签名必须覆盖实际发出的路径。
fn upstream_request_target(base_url: &str, pq: &str) -> Result<(reqwest::Url, Uri)> {
    let url = reqwest::Url::parse(&format!("{}{}", base_url, pq))
        .map_err(|e| TunnelError::UpstreamError(format!("Invalid request path: {}", e)))?;
    let sign_uri = path_and_query(url.path(), url.query())
        .parse()
        .map_err(|e| TunnelError::UpstreamError(format!("Invalid request path: {}", e)))?;
    Ok((url, sign_uri))
}

fn signing_header(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TunnelError::SigningError(format!("Invalid header value '{}': {}", value, e)))
}

/// 纯文本错误响应
fn text_response(status: StatusCode, message: String) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// 拼接错误及其来源链
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let outer = TunnelError::from(inner);
        assert_eq!(error_chain(&outer), "I/O error: refused: refused");
    }

    #[test]
    fn test_request_target_matches_sent_path() {
        let (url, uri) = upstream_request_target("https://abc.example.com", "/prod/a{b}?q=1").unwrap();
        assert_eq!(url.path(), "/prod/a%7Bb%7D");
        assert_eq!(uri.path(), url.path());
        assert_eq!(uri.query(), Some("q=1"));

        let (url, uri) =
            upstream_request_target("https://vpce.example.com:15001", "/prod/items").unwrap();
        assert_eq!(url.port(), Some(15001));
        assert_eq!(uri.path(), "/prod/items");
        assert_eq!(uri.query(), None);
    }

    #[tokio::test]
    async fn test_text_response() {
        let resp = text_response(StatusCode::BAD_GATEWAY, "boom".to_string());
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"boom");
    }
}
