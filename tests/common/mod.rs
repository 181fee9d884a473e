//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use ssm_tunnel::cloud::{AwsProfile, CloudApi, Credentials, InstanceState, JumpHost, VpcEndpoint};
use ssm_tunnel::config::AppConfig;
use ssm_tunnel::session::{LaunchCommand, SessionLauncher, SessionSpec};
use ssm_tunnel::sigv4;
use ssm_tunnel::tunnel::{EcsTunnelManager, GatewayTunnelManager, RegistryView, TunnelContext, TunnelStatus};
use ssm_tunnel::{Result, TunnelError};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const REGION: &str = "us-east-1";
pub const ACCESS_KEY: &str = "AKIDEXAMPLE";
pub const SECRET_KEY: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
pub const SESSION_TOKEN: &str = "session-token-example";
pub const READY_SCRIPT: &str = "echo 'Waiting for connections...'; exec sleep 60";

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Wait for server to be ready
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Poll until the predicate holds or the timeout expires
pub async fn wait_until<F: FnMut() -> bool>(mut predicate: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    predicate()
}

/// True once the process no longer exists or is a zombie
pub fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .map(|(_, rest)| rest.starts_with('Z'))
            .unwrap_or(false),
        Err(_) => true,
    }
}

/// Config tuned for fast tests
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.aws.region = Some(REGION.to_string());
    config.session.settle_ms = 100;
    config.session.start_timeout_secs = 3;
    config.session.stop_grace_secs = 2;
    config.shutdown_timeout_secs = 5;
    config
}

pub fn jump_host(id: &str, name: &str, vpc: &str) -> JumpHost {
    JumpHost {
        instance_id: id.to_string(),
        name: name.to_string(),
        vpc_id: vpc.to_string(),
        private_ip: Some("10.0.0.10".to_string()),
        ssm_managed: true,
        state: InstanceState::Running,
        tags: HashMap::new(),
    }
}

pub fn vpc_endpoint(id: &str, vpc: &str) -> VpcEndpoint {
    VpcEndpoint {
        endpoint_id: id.to_string(),
        service_name: format!("com.amazonaws.{}.execute-api", REGION),
        vpc_id: vpc.to_string(),
        dns_entries: vec![
            format!("{}-abcd1234.execute-api.{}.vpce.amazonaws.com", id, REGION),
            format!("{}-abcd1234-{}a.execute-api.{}.vpce.amazonaws.com", id, REGION, REGION),
        ],
    }
}

/// In-memory cloud with fixed topology and credentials
pub struct StubCloud {
    profile: AwsProfile,
    pub endpoints: Vec<VpcEndpoint>,
    pub instances: Vec<JumpHost>,
    pub described: HashMap<String, VpcEndpoint>,
    pub fail_credentials: bool,
}

impl StubCloud {
    pub fn new() -> Self {
        Self {
            profile: AwsProfile::new(Some("test".to_string()), REGION),
            endpoints: Vec::new(),
            instances: Vec::new(),
            described: HashMap::new(),
            fail_credentials: false,
        }
    }
}

#[async_trait]
impl CloudApi for StubCloud {
    fn profile(&self) -> &AwsProfile {
        &self.profile
    }

    async fn list_execute_api_vpc_endpoints(&self) -> Result<Vec<VpcEndpoint>> {
        Ok(self.endpoints.clone())
    }

    async fn list_ssm_managed_instances(&self) -> Result<Vec<JumpHost>> {
        Ok(self.instances.clone())
    }

    async fn describe_vpc_endpoint(&self, endpoint_id: &str) -> Result<VpcEndpoint> {
        self.described.get(endpoint_id).cloned().ok_or_else(|| {
            TunnelError::cloud(format!(
                "An error occurred (InvalidVpcEndpointId.NotFound): {}",
                endpoint_id
            ))
        })
    }

    async fn credentials(&self) -> Result<Credentials> {
        if self.fail_credentials {
            return Err(TunnelError::cloud("Unable to locate credentials"));
        }
        Ok(Credentials::new(ACCESS_KEY, SECRET_KEY)
            .with_session_token(SESSION_TOKEN))
    }
}

/// What the stub session manager does
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Print the ready line and sleep
    Ready,
    /// Never become ready
    Silent,
    /// Write to stderr and exit
    Fail(String),
    /// Listen on the local port and forward to the target (stands in for the bastion)
    ForwardTo(SocketAddr),
    /// Report the local port as taken once, then behave like `Ready`
    BindRaceOnce,
    /// Run an arbitrary shell script
    Script(String),
}

/// Launcher that runs `sh -c` placeholder processes instead of the aws CLI
pub struct StubLauncher {
    behaviour: Mutex<Behaviour>,
    pub specs: Mutex<Vec<SessionSpec>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl StubLauncher {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Mutex::new(behaviour),
            specs: Mutex::new(Vec::new()),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock() = behaviour;
    }

    pub fn launches(&self) -> usize {
        self.specs.lock().len()
    }

    pub fn last_spec(&self) -> Option<SessionSpec> {
        self.specs.lock().last().cloned()
    }
}

impl Drop for StubLauncher {
    fn drop(&mut self) {
        for handle in self.forwarders.lock().drain(..) {
            handle.abort();
        }
    }
}

fn shell(script: &str) -> LaunchCommand {
    LaunchCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: vec![],
    }
}

fn bind_failure(port: u16) -> String {
    format!(
        "echo 'listen tcp 127.0.0.1:{}: bind: address already in use' >&2; exit 1",
        port
    )
}

async fn forward(listener: TokioTcpListener, target: SocketAddr) {
    while let Ok((mut inbound, _)) = listener.accept().await {
        tokio::spawn(async move {
            if let Ok(mut outbound) = TcpStream::connect(target).await {
                let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
            }
        });
    }
}

#[async_trait]
impl SessionLauncher for StubLauncher {
    async fn prepare(&self, spec: &SessionSpec) -> Result<LaunchCommand> {
        self.specs.lock().push(spec.clone());
        let behaviour = self.behaviour.lock().clone();
        match behaviour {
            Behaviour::Ready => Ok(shell(READY_SCRIPT)),
            Behaviour::Silent => Ok(shell("exec sleep 60")),
            Behaviour::Fail(msg) => Ok(shell(&format!("echo '{}' >&2; exit 1", msg))),
            Behaviour::Script(script) => Ok(shell(&script)),
            Behaviour::BindRaceOnce => {
                self.set_behaviour(Behaviour::Ready);
                Ok(shell(&bind_failure(spec.local_port)))
            }
            Behaviour::ForwardTo(target) => {
                match TokioTcpListener::bind(("127.0.0.1", spec.local_port)).await {
                    Ok(listener) => {
                        self.forwarders
                            .lock()
                            .push(tokio::spawn(forward(listener, target)));
                        Ok(shell(READY_SCRIPT))
                    }
                    Err(_) => Ok(shell(&bind_failure(spec.local_port))),
                }
            }
        }
    }
}

/// Managers wired to stubs
pub struct Harness {
    pub launcher: Arc<StubLauncher>,
    pub ecs: Arc<EcsTunnelManager>,
    pub gateway: Arc<GatewayTunnelManager>,
    pub registry: RegistryView,
}

impl Harness {
    pub fn new(config: &AppConfig, cloud: StubCloud, behaviour: Behaviour) -> Self {
        let launcher = StubLauncher::new(behaviour);
        let ctx = TunnelContext::new(config, Arc::new(cloud), launcher.clone())
            .expect("Failed to build tunnel context");
        let ecs = Arc::new(EcsTunnelManager::new(ctx.clone()));
        let gateway = Arc::new(GatewayTunnelManager::new(ctx));
        let registry = RegistryView::new(ecs.clone(), gateway.clone());
        Self {
            launcher,
            ecs,
            gateway,
            registry,
        }
    }

    pub async fn wait_for_status(&self, id: &str, status: TunnelStatus) -> bool {
        wait_until(
            || self.registry.find(id).map(|t| t.status()) == Some(status),
            Duration::from_secs(10),
        )
        .await
    }
}

/// Request seen by the mock upstream
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub sni: Option<String>,
    pub method: String,
    pub path_and_query: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// HTTPS upstream with a self-signed certificate for the given host names
pub struct MockUpstream {
    pub addr: SocketAddr,
    pub ca_pem: String,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockUpstream {
    pub async fn start(hosts: &[&str]) -> Self {
        let certified = rcgen::generate_simple_self_signed(
            hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
        )
        .expect("Failed to generate certificate");
        let ca_pem = certified.cert.pem();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.signing_key.serialize_der(),
        ));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("Failed to select protocol versions")
            .with_no_client_auth()
            .with_single_cert(vec![certified.cert.der().clone()], key)
            .expect("Failed to build TLS config");
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

        let listener = TokioTcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock upstream");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    let sni = tls.get_ref().1.server_name().map(str::to_string);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = recorded.clone();
                        let sni = sni.clone();
                        async move { Ok::<_, Infallible>(respond(req, sni, recorded).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            ca_pem,
            requests,
            task,
        }
    }

    /// Write the certificate to a PEM file usable as `proxy.ca_bundle`
    pub fn write_ca_bundle(&self, dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("upstream-ca.pem");
        std::fs::write(&path, &self.ca_pem).expect("Failed to write CA bundle");
        path
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().last().cloned()
    }
}

type MockBody = http_body_util::combinators::UnsyncBoxBody<Bytes, Infallible>;

/// `/chunked` streams three frames; everything else echoes the request body
async fn respond(
    req: Request<Incoming>,
    sni: Option<String>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> Response<MockBody> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    recorded.lock().push(RecordedRequest {
        sni,
        method: parts.method.to_string(),
        path_and_query: path_and_query.clone(),
        headers: parts
            .headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
        body: body.clone(),
    });

    let response_body: MockBody = if parts.uri.path().ends_with("/chunked") {
        let frames = ["alpha,", "beta,", "gamma"]
            .into_iter()
            .map(|s| Ok::<_, Infallible>(Frame::data(Bytes::from_static(s.as_bytes()))));
        StreamBody::new(futures::stream::iter(frames)).boxed_unsync()
    } else {
        Full::new(body).boxed_unsync()
    };

    Response::builder()
        .status(200)
        .header("x-upstream-path", path_and_query)
        .body(response_body)
        .expect("Failed to build response")
}

/// Recompute the SigV4 signature over what the upstream actually received
pub fn signature_matches(req: &RecordedRequest) -> bool {
    let Some(authorization) = req.headers.get("authorization") else {
        return false;
    };
    let Some(signed) = authorization
        .split(", ")
        .find_map(|part| part.strip_prefix("SignedHeaders="))
    else {
        return false;
    };
    let Some(time) = req
        .headers
        .get(sigv4::X_AMZ_DATE)
        .and_then(|d| chrono::NaiveDateTime::parse_from_str(d, "%Y%m%dT%H%M%SZ").ok())
    else {
        return false;
    };

    let mut headers = http::HeaderMap::new();
    for name in signed.split(';') {
        if name == sigv4::X_AMZ_DATE || name == sigv4::X_AMZ_SECURITY_TOKEN {
            continue;
        }
        let Some(value) = req.headers.get(name) else {
            return false;
        };
        headers.insert(
            http::HeaderName::from_bytes(name.as_bytes()).expect("Invalid header name"),
            http::HeaderValue::from_str(value).expect("Invalid header value"),
        );
    }

    let credentials = Credentials::new(ACCESS_KEY, SECRET_KEY).with_session_token(SESSION_TOKEN);
    let params = sigv4::SigningParams {
        credentials: &credentials,
        region: REGION,
        service: sigv4::EXECUTE_API_SERVICE,
        time: time.and_utc(),
    };
    let method: http::Method = req.method.parse().expect("Invalid method");
    let uri: http::Uri = req.path_and_query.parse().expect("Invalid path");
    let payload_hash = sigv4::hash_payload(&req.body);
    sigv4::sign(&method, &uri, &mut headers, &payload_hash, &params).expect("Failed to sign");

    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(authorization.as_str())
}
