/// session-manager 子进程
///
/// 负责启动、就绪探测、监控与终止 `aws ssm start-session` 端口转发进程。
/// 子进程的 stdout/stderr 被持续抽取到固定大小的环形缓冲区中，用于就绪
/// 判断以及退出时的错误信息。
mod output;

pub use output::OutputRing;

use crate::cloud::Credentials;
use crate::config::SessionConfig;
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use serde_json::json;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// ECS 容器端口转发文档
pub const ECS_DOCUMENT: &str = "AWS-StartPortForwardingSession";
/// 经由实例转发到远端主机的文档
pub const REMOTE_HOST_DOCUMENT: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// 就绪检查间隔
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// 错误信息中保留的 stderr 行数
const TAIL_LINES: usize = 5;

/// 一次 SSM 会话的描述
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub target: String,
    pub document: String,
    pub parameters: serde_json::Value,
    pub local_port: u16,
    pub region: String,
    pub profile: Option<String>,
    pub credentials: Option<Credentials>,
}

impl SessionSpec {
    /// ECS 容器端口转发：目标为 `ecs:<cluster>_<task>_<runtime_id>`
    pub fn ecs_container(
        cluster_name: &str,
        task_id: &str,
        runtime_id: &str,
        remote_port: u16,
        local_port: u16,
        region: impl Into<String>,
    ) -> Self {
        Self {
            target: format!("ecs:{}_{}_{}", cluster_name, task_id, runtime_id),
            document: ECS_DOCUMENT.to_string(),
            parameters: json!({
                "portNumber": [remote_port.to_string()],
                "localPortNumber": [local_port.to_string()],
            }),
            local_port,
            region: region.into(),
            profile: None,
            credentials: None,
        }
    }

    /// 经跳板机转发到 `host:port`
    pub fn remote_host(
        instance_id: &str,
        host: &str,
        port: u16,
        local_port: u16,
        region: impl Into<String>,
    ) -> Self {
        Self {
            target: instance_id.to_string(),
            document: REMOTE_HOST_DOCUMENT.to_string(),
            parameters: json!({
                "host": [host],
                "portNumber": [port.to_string()],
                "localPortNumber": [local_port.to_string()],
            }),
            local_port,
            region: region.into(),
            profile: None,
            credentials: None,
        }
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// 改用另一个本地端口
    pub fn with_local_port(mut self, local_port: u16) -> Self {
        self.local_port = local_port;
        self.parameters["localPortNumber"] = json!([local_port.to_string()]);
        self
    }

    /// 远端主机（仅 RemoteHost 文档）
    pub fn remote_target_host(&self) -> Option<&str> {
        self.parameters
            .get("host")
            .and_then(|h| h.get(0))
            .and_then(|h| h.as_str())
    }
}

/// 实际要执行的命令行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// 将会话描述转换为子进程命令
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn prepare(&self, spec: &SessionSpec) -> Result<LaunchCommand>;
}

/// 默认实现：`aws ssm start-session ...`
#[derive(Debug, Clone)]
pub struct AwsCliLauncher {
    program: String,
}

impl AwsCliLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn build(&self, spec: &SessionSpec) -> LaunchCommand {
        let mut args = vec![
            "ssm".to_string(),
            "start-session".to_string(),
            "--target".to_string(),
            spec.target.clone(),
            "--document-name".to_string(),
            spec.document.clone(),
            "--parameters".to_string(),
            spec.parameters.to_string(),
            "--region".to_string(),
            spec.region.clone(),
        ];
        if let Some(ref profile) = spec.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }

        let mut env = vec![
            ("AWS_REGION".to_string(), spec.region.clone()),
            ("AWS_DEFAULT_REGION".to_string(), spec.region.clone()),
        ];
        if let Some(ref profile) = spec.profile {
            env.push(("AWS_PROFILE".to_string(), profile.clone()));
        }
        if let Some(ref creds) = spec.credentials {
            env.extend(
                creds
                    .env_vars()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v)),
            );
        }

        LaunchCommand {
            program: self.program.clone(),
            args,
            env,
        }
    }
}

impl Default for AwsCliLauncher {
    fn default() -> Self {
        Self::new("aws")
    }
}

#[async_trait]
impl SessionLauncher for AwsCliLauncher {
    async fn prepare(&self, spec: &SessionSpec) -> Result<LaunchCommand> {
        Ok(self.build(spec))
    }
}

/// 运行中的 session-manager 子进程
pub struct ChildSession {
    child: Child,
    pid: Option<u32>,
    program: String,
    local_port: u16,
    stdout: OutputRing,
    stderr: OutputRing,
    ready_seen: Arc<AtomicBool>,
    spawned_at: Instant,
    exit_status: Option<ExitStatus>,
    group_reaped: bool,
}

impl ChildSession {
    /// 启动子进程（stdin 关闭，stdout/stderr 被捕获）
    pub async fn spawn(
        launcher: &dyn SessionLauncher,
        spec: &SessionSpec,
        config: &SessionConfig,
    ) -> Result<Self> {
        let launch = launcher.prepare(spec).await?;
        debug!("Spawning session manager: {}", launch.display());

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // 独立进程组，停止时连同 session-manager-plugin 一起结束
        // SAFETY: setpgid is async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TunnelError::launch_failed(launch.program.clone(), e))?;
        let pid = child.id();

        let stdout = OutputRing::new(config.output_buffer_bytes);
        let stderr = OutputRing::new(config.output_buffer_bytes);
        let ready_seen = Arc::new(AtomicBool::new(false));

        if let Some(out) = child.stdout.take() {
            tokio::spawn(output::pump(
                out,
                stdout.clone(),
                config.ready_line.clone(),
                ready_seen.clone(),
            ));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(output::pump(
                err,
                stderr.clone(),
                config.ready_line.clone(),
                ready_seen.clone(),
            ));
        }

        info!(
            "Session manager started (pid {:?}) for {} on local port {}",
            pid, spec.target, spec.local_port
        );

        Ok(Self {
            child,
            pid,
            program: launch.program,
            local_port: spec.local_port,
            stdout,
            stderr,
            ready_seen,
            spawned_at: Instant::now(),
            exit_status: None,
            group_reaped: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn stdout(&self) -> &OutputRing {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputRing {
        &self.stderr
    }

    /// 等待就绪
    ///
    /// 存活满 `settle` 之后，本地端口可连接或输出中出现就绪文本即视为就绪。
    /// 超时后子进程被杀掉并返回 `ReadinessTimeout`；提前退出返回
    /// `ChildExitedEarly`。
    pub async fn wait_ready(&mut self, settle: Duration, start_timeout: Duration) -> Result<()> {
        let deadline = self.spawned_at + start_timeout;
        let settled_at = self.spawned_at + settle;
        let local_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port));

        loop {
            tokio::select! {
                status = self.child.wait() => {
                    let status = status?;
                    self.exit_status = Some(status);
                    self.reap_group();
                    // 让输出抽取任务读完剩余数据
                    sleep(Duration::from_millis(50)).await;
                    return Err(TunnelError::ChildExitedEarly(self.exit_reason(status)));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "Session manager on port {} not ready after {:?}, killing it",
                        self.local_port, start_timeout
                    );
                    self.kill().await;
                    return Err(TunnelError::ReadinessTimeout(start_timeout));
                }
                _ = sleep(READY_POLL_INTERVAL) => {
                    if Instant::now() < settled_at {
                        continue;
                    }
                    if self.ready_seen.load(Ordering::Acquire) {
                        debug!("Port {} ready (ready line)", self.local_port);
                        return Ok(());
                    }
                    if let Ok(Ok(_)) = timeout(READY_POLL_INTERVAL, TcpStream::connect(local_addr)).await {
                        debug!("Port {} ready (tcp connect)", self.local_port);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// 等待子进程退出
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        self.reap_group();
        Ok(status)
    }

    /// 优雅停止：SIGTERM，宽限期后 SIGKILL
    pub async fn stop(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Some(status);
        }
        self.signal(libc::SIGTERM);
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                self.reap_group();
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for session manager: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Session manager (pid {:?}) ignored SIGTERM for {:?}, killing",
                    self.pid, grace
                );
                self.kill().await
            }
        }
    }

    /// 立即 SIGKILL 并回收
    pub async fn kill(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Some(status);
        }
        self.signal(libc::SIGKILL);
        if let Err(e) = self.child.start_kill() {
            debug!("start_kill: {}", e);
        }
        match self.child.wait().await {
            Ok(status) => {
                self.exit_status = Some(status);
                self.reap_group();
                Some(status)
            }
            Err(e) => {
                warn!("Failed to reap session manager: {}", e);
                None
            }
        }
    }

    /// 结束进程组中残留的进程
    ///
    /// 首进程退出后 session-manager-plugin 仍可能占用本地端口，
    /// 因此每条退出路径都要在释放端口租约之前调用。
    pub fn reap_group(&mut self) {
        if self.group_reaped {
            return;
        }
        self.group_reaped = true;
        if let Some(pid) = self.pid {
            // 进程组号即首进程 pid
            let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
            if rc == 0 {
                debug!("Killed leftover processes in group {}", pid);
            }
        }
    }

    fn signal(&self, sig: libc::c_int) {
        if let Some(pid) = self.pid {
            // 发送给整个进程组
            unsafe {
                libc::kill(-(pid as i32), sig);
            }
        }
    }

    /// stderr 最后几行
    pub fn stderr_tail(&self) -> String {
        self.stderr.tail_lines(TAIL_LINES)
    }

    /// 退出原因：优先使用 stderr，没有时使用退出状态
    pub fn exit_reason(&self, status: ExitStatus) -> String {
        let tail = self.stderr_tail();
        if tail.is_empty() {
            format!("session manager exited with {}", status)
        } else {
            tail
        }
    }
}

impl Drop for ChildSession {
    fn drop(&mut self) {
        self.reap_group();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 进程已退出（不存在或为僵尸）
    fn process_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .map(|(_, rest)| rest.starts_with('Z'))
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    async fn eventually_gone(pid: i32) -> bool {
        for _ in 0..40 {
            if process_gone(pid) {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        false
    }

    struct ShellLauncher(String);

    #[async_trait]
    impl SessionLauncher for ShellLauncher {
        async fn prepare(&self, _spec: &SessionSpec) -> Result<LaunchCommand> {
            Ok(LaunchCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), self.0.clone()],
                env: vec![],
            })
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            settle_ms: 100,
            start_timeout_secs: 2,
            ..Default::default()
        }
    }

    fn spec(port: u16) -> SessionSpec {
        SessionSpec::ecs_container("c", "t", "r", 80, port, "us-east-1")
    }

    #[test]
    fn test_ecs_command() {
        let spec = SessionSpec::ecs_container("prod", "abc123", "abc123-111", 8080, 15000, "eu-west-1")
            .with_profile(Some("dev".to_string()))
            .with_credentials(Credentials::new("AKID", "secret").with_session_token("tok"));
        let cmd = AwsCliLauncher::default().build(&spec);

        assert_eq!(cmd.program, "aws");
        assert_eq!(&cmd.args[..2], &["ssm", "start-session"]);
        assert!(cmd.args.contains(&"ecs:prod_abc123_abc123-111".to_string()));
        assert!(cmd.args.contains(&ECS_DOCUMENT.to_string()));
        let params_idx = cmd.args.iter().position(|a| a == "--parameters").unwrap();
        let params: serde_json::Value = serde_json::from_str(&cmd.args[params_idx + 1]).unwrap();
        assert_eq!(params["portNumber"][0], "8080");
        assert_eq!(params["localPortNumber"][0], "15000");
        assert!(cmd.args.ends_with(&["--profile".to_string(), "dev".to_string()]));

        let env: std::collections::HashMap<_, _> = cmd.env.into_iter().collect();
        assert_eq!(env.get("AWS_PROFILE").map(String::as_str), Some("dev"));
        assert_eq!(env.get("AWS_DEFAULT_REGION").map(String::as_str), Some("eu-west-1"));
        assert_eq!(env.get("AWS_SESSION_TOKEN").map(String::as_str), Some("tok"));
    }

    #[test]
    fn test_remote_host_command() {
        let spec = SessionSpec::remote_host("i-0abc", "vpce-1.execute-api.us-east-1.vpce.amazonaws.com", 443, 16000, "us-east-1");
        assert_eq!(spec.remote_target_host(), Some("vpce-1.execute-api.us-east-1.vpce.amazonaws.com"));
        let cmd = AwsCliLauncher::new("/usr/local/bin/aws").build(&spec);
        assert_eq!(cmd.program, "/usr/local/bin/aws");
        assert!(cmd.args.contains(&REMOTE_HOST_DOCUMENT.to_string()));
        assert!(cmd.args.contains(&"i-0abc".to_string()));
        assert!(!cmd.args.contains(&"--profile".to_string()));

        let moved = spec.with_local_port(16001);
        assert_eq!(moved.local_port, 16001);
        assert_eq!(moved.parameters["localPortNumber"][0], "16001");
        assert_eq!(moved.parameters["portNumber"][0], "443");
    }

    #[tokio::test]
    async fn test_ready_line() {
        let launcher = ShellLauncher("echo 'Waiting for connections...'; exec sleep 30".into());
        let mut child = ChildSession::spawn(&launcher, &spec(1), &fast_config()).await.unwrap();
        assert!(child.pid().is_some());
        child.wait_ready(Duration::from_millis(100), Duration::from_secs(2)).await.unwrap();
        assert!(child.stop(Duration::from_secs(2)).await.is_some());
    }

    #[tokio::test]
    async fn test_tcp_connect_readiness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let launcher = ShellLauncher("exec sleep 30".into());
        let mut child = ChildSession::spawn(&launcher, &spec(port), &fast_config()).await.unwrap();
        child.wait_ready(Duration::from_millis(100), Duration::from_secs(2)).await.unwrap();
        child.kill().await;
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let launcher = ShellLauncher("exec sleep 30".into());
        let start_timeout = Duration::from_millis(600);
        let started = Instant::now();
        // 端口 1 无人监听
        let mut child = ChildSession::spawn(&launcher, &spec(1), &fast_config()).await.unwrap();
        let err = child
            .wait_ready(Duration::from_millis(100), start_timeout)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(err.is_timeout());
        match err {
            TunnelError::ReadinessTimeout(d) => assert_eq!(d, start_timeout),
            other => panic!("unexpected error: {:?}", other),
        }
        // 截止时间到达后最多再经过一次探测与回收
        assert!(elapsed >= start_timeout, "gave up early: {:?}", elapsed);
        assert!(
            elapsed <= start_timeout + READY_POLL_INTERVAL * 2 + Duration::from_millis(300),
            "gave up late: {:?}",
            elapsed
        );
        // 已被杀掉
        assert!(child.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_exited_early_reports_stderr() {
        let launcher = ShellLauncher("echo 'TargetNotConnected: ecs:x is not connected' >&2; exit 255".into());
        let mut child = ChildSession::spawn(&launcher, &spec(1), &fast_config()).await.unwrap();
        let err = child
            .wait_ready(Duration::from_millis(100), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            TunnelError::ChildExitedEarly(msg) => assert!(msg.contains("TargetNotConnected")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exit_status_when_no_stderr() {
        let launcher = ShellLauncher("exit 3".into());
        let mut child = ChildSession::spawn(&launcher, &spec(1), &fast_config()).await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(child.exit_reason(status).contains("exited with"));
    }

    #[tokio::test]
    async fn test_leader_exit_reaps_group() {
        // 首进程退出，后台进程留在同一进程组中
        let launcher = ShellLauncher("sleep 30 & echo $!; exit 0".into());
        let mut child = ChildSession::spawn(&launcher, &spec(1), &fast_config()).await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
        sleep(Duration::from_millis(100)).await;
        let leftover: i32 = child.stdout().tail_lines(1).trim().parse().unwrap();
        assert!(eventually_gone(leftover).await, "pid {} still running", leftover);
    }

    #[tokio::test]
    async fn test_drop_reaps_group() {
        let launcher = ShellLauncher("sleep 30 & echo $!; echo 'Waiting for connections'; wait".into());
        let mut child = ChildSession::spawn(&launcher, &spec(1), &fast_config()).await.unwrap();
        child.wait_ready(Duration::from_millis(100), Duration::from_secs(2)).await.unwrap();
        let leftover: i32 = child
            .stdout()
            .tail_lines(2)
            .lines()
            .next()
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        drop(child);
        assert!(eventually_gone(leftover).await, "pid {} still running", leftover);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let launcher = ShellLauncher("trap '' TERM; echo 'Waiting for connections'; while true; do sleep 1; done".into());
        let mut child = ChildSession::spawn(&launcher, &spec(1), &fast_config()).await.unwrap();
        child.wait_ready(Duration::from_millis(100), Duration::from_secs(2)).await.unwrap();
        let status = child.stop(Duration::from_millis(300)).await;
        assert!(status.is_some());
    }

    #[tokio::test]
    async fn test_missing_program() {
        struct Missing;
        #[async_trait]
        impl SessionLauncher for Missing {
            async fn prepare(&self, _spec: &SessionSpec) -> Result<LaunchCommand> {
                Ok(LaunchCommand {
                    program: "/nonexistent/session-manager".into(),
                    args: vec![],
                    env: vec![],
                })
            }
        }
        let err = ChildSession::spawn(&Missing, &spec(1), &fast_config()).await.err().unwrap();
        assert!(matches!(err, TunnelError::ChildLaunchFailed { .. }));
    }
}
