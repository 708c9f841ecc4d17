// Process supervision for an experiment run.
//
// Spawns the server, waits for its readiness line on stdout, spawns
// the clients, then watches all children until the global timeout. Any
// child failing early tears the whole run down. At the deadline every
// survivor gets SIGTERM, a bounded grace period to exit, and a hard
// kill as the fallback. The supervisor never touches protocol
// messages; spawn and signals are its only cross-process effects.

use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time;

use crate::config::Config;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLIENT_SPAWN_STAGGER: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client(u32),
}

impl Role {
    pub fn log_file_name(&self) -> String {
        match self {
            Role::Server => "server.log".to_string(),
            Role::Client(id) => format!("client_{id}.log"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client(id) => write!(f, "client_{id}"),
        }
    }
}

/// One spawned child. Created on spawn, finalized when the process
/// exits or is killed.
struct ProcessHandle {
    role: Role,
    child: Child,
    started: time::Instant,
    status: Option<std::process::ExitStatus>,
    forced: bool,
}

impl ProcessHandle {
    fn is_running(&self) -> bool {
        self.status.is_none()
    }

    /// Poll for exit without blocking; records the status once seen.
    fn poll_exit(&mut self) -> Result<Option<std::process::ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let polled = self
            .child
            .try_wait()
            .context(format!("Failed to poll {}", self.role))?;
        if let Some(status) = polled {
            log::info!(
                "{} exited with {} after {:?}",
                self.role,
                status,
                self.started.elapsed()
            );
            self.status = Some(status);
        }
        Ok(polled)
    }

    /// Graceful termination request. SIGTERM on Unix; elsewhere there
    /// is no graceful signal, so this degrades to a hard kill.
    fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                log::debug!("Sending SIGTERM to {} (pid {})", self.role, pid);
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                return;
            }
        }

        if let Err(e) = self.child.start_kill() {
            log::warn!("Failed to kill {}: {}", self.role, e);
        }
    }

    async fn force_kill(&mut self) {
        log::warn!("Force-killing {}", self.role);
        if let Err(e) = self.child.kill().await {
            log::warn!("Failed to force-kill {}: {}", self.role, e);
        }
        match self.child.wait().await {
            Ok(status) => self.status = Some(status),
            Err(e) => log::warn!("Failed to reap {}: {}", self.role, e),
        }
        self.forced = true;
    }
}

/// Final fate of one child, aggregated into the run's exit status.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub role: Role,
    /// Exit code; None when the process died to a signal or could not
    /// be reaped.
    pub code: Option<i32>,
    pub forced: bool,
}

impl ProcessExit {
    pub fn clean(&self) -> bool {
        self.code == Some(0) && !self.forced
    }
}

#[derive(Debug, Clone)]
pub struct ExitReport {
    pub processes: Vec<ProcessExit>,
}

impl ExitReport {
    /// Overall success: every process exited zero, none force-killed.
    pub fn all_clean(&self) -> bool {
        !self.processes.is_empty() && self.processes.iter().all(|p| p.clean())
    }
}

pub struct Supervisor {
    timeout: Duration,
    client_count: u32,
    host: String,
    port: u16,
    log_dir: PathBuf,
    config: Config,
    config_path: Option<PathBuf>,
    debug: bool,
}

impl Supervisor {
    pub fn new(timeout: Duration, client_count: u32, port: u16, config: Config) -> Self {
        let log_dir = config.supervise.log_dir.clone();
        Self {
            timeout,
            client_count,
            host: "127.0.0.1".to_string(),
            port,
            log_dir,
            config,
            config_path: None,
            debug: false,
        }
    }

    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = log_dir;
        self
    }

    /// Forwarded to children so they resolve the same config file.
    pub fn with_config_path(mut self, config_path: Option<PathBuf>) -> Self {
        self.config_path = config_path;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub async fn run(mut self) -> Result<ExitReport> {
        std::fs::create_dir_all(&self.log_dir).context(format!(
            "Failed to create log directory: {}",
            self.log_dir.display()
        ))?;

        let exe = std::env::current_exe().context("Failed to locate current executable")?;

        log::info!(
            "Starting experiment: {} client(s) against {}:{} for {:?}",
            self.client_count,
            self.host,
            self.port,
            self.timeout
        );

        let mut handles: Vec<ProcessHandle> = Vec::new();

        let server = self
            .spawn_child(&exe, Role::Server)
            .context("Failed to start the server")?;
        handles.push(server);

        if let Err(e) = self.wait_for_server_ready(&mut handles[0]).await {
            // Startup failure: tear down whatever exists, fail the run.
            self.shutdown_remaining(&mut handles).await;
            return Err(e.context("Server did not become ready"));
        }
        log::info!("Server is listening on port {}", self.port);

        for id in 1..=self.client_count {
            let client = self
                .spawn_child(&exe, Role::Client(id))
                .context(format!("Failed to start client_{id}"))?;
            handles.push(client);
            time::sleep(CLIENT_SPAWN_STAGGER).await;
        }

        let failed_early = self.supervise(&mut handles).await?;
        if failed_early {
            log::error!("A process failed before the timeout, terminating the rest");
        }
        self.shutdown_remaining(&mut handles).await;

        let report = ExitReport {
            processes: handles
                .iter()
                .map(|h| ProcessExit {
                    role: h.role,
                    code: h.status.and_then(|s| s.code()),
                    forced: h.forced,
                })
                .collect(),
        };

        for p in &report.processes {
            log::info!(
                "{}: exit code {:?}{}",
                p.role,
                p.code,
                if p.forced { " (force-killed)" } else { "" }
            );
        }

        Ok(report)
    }

    fn spawn_child(&self, exe: &std::path::Path, role: Role) -> Result<ProcessHandle> {
        let log_path = self.log_dir.join(role.log_file_name());
        let timeout_secs = self.timeout.as_secs().to_string();

        let mut command = Command::new(exe);
        match role {
            Role::Server => {
                command
                    .arg("server")
                    .arg("--host")
                    .arg(&self.host)
                    .arg("--port")
                    .arg(self.port.to_string())
                    .arg("--log")
                    .arg(&log_path)
                    .arg("--timeout")
                    .arg(&timeout_secs);
            }
            Role::Client(id) => {
                command
                    .arg("client")
                    .arg("--id")
                    .arg(id.to_string())
                    .arg("--host")
                    .arg(&self.host)
                    .arg("--port")
                    .arg(self.port.to_string())
                    .arg("--log")
                    .arg(&log_path)
                    .arg("--timeout")
                    .arg(&timeout_secs);
            }
        }
        if let Some(ref path) = self.config_path {
            command.arg("--config").arg(path);
        }
        if self.debug {
            command.arg("--debug");
        }

        // Children write their outcomes to the log files; diagnostic
        // output stays on the shared stderr. The server's stdout is
        // captured for the readiness line.
        command.stdin(Stdio::null());
        if role == Role::Server {
            command.stdout(Stdio::piped());
        }
        command.kill_on_drop(true);

        let child = command
            .spawn()
            .context(format!("Failed to spawn {role}"))?;
        log::info!("Spawned {} (pid {:?})", role, child.id());

        Ok(ProcessHandle {
            role,
            child,
            started: time::Instant::now(),
            status: None,
            forced: false,
        })
    }

    /// Read the server's readiness line from its captured stdout.
    /// Out-of-band on purpose: connecting to the port to detect it
    /// would show up in the server's connection count. Fails when the
    /// server process dies first or the ready-wait expires.
    async fn wait_for_server_ready(&self, server: &mut ProcessHandle) -> Result<()> {
        let ready_wait = self.config.supervise.ready_wait();
        let ready_deadline = time::Instant::now() + ready_wait;

        let stdout = server
            .child
            .stdout
            .take()
            .context("Server stdout was not captured")?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            if let Some(status) = server.poll_exit()? {
                anyhow::bail!("Server exited before becoming ready: {status}");
            }
            if time::Instant::now() >= ready_deadline {
                anyhow::bail!("Server not ready within {:?}", ready_wait);
            }

            // next_line is cancel safe, so a poll-interval timeout
            // never loses buffered output.
            match time::timeout(POLL_INTERVAL, lines.next_line()).await {
                Ok(Ok(Some(line))) if line.starts_with("READY") => {
                    log::debug!("Server reported: {line}");
                    return Ok(());
                }
                Ok(Ok(Some(line))) => log::debug!("Server stdout: {line}"),
                // EOF: stdout closed, the exit poll above settles it.
                Ok(Ok(None)) => time::sleep(POLL_INTERVAL).await,
                Ok(Err(e)) => return Err(e).context("Failed to read server stdout"),
                Err(_) => {}
            }
        }
    }

    /// Watch the children until the global deadline. Returns true when
    /// a child failed early (the caller then tears everything down).
    async fn supervise(&self, handles: &mut [ProcessHandle]) -> Result<bool> {
        let deadline = time::Instant::now() + self.timeout;

        loop {
            let mut all_done = true;
            for handle in handles.iter_mut() {
                match handle.poll_exit()? {
                    Some(status) if !status.success() => {
                        log::error!("{} failed: {}", handle.role, status);
                        return Ok(true);
                    }
                    Some(_) => {}
                    None => all_done = false,
                }
            }

            if all_done {
                log::info!("All processes finished before the timeout");
                return Ok(false);
            }
            if time::Instant::now() >= deadline {
                log::info!("Global timeout reached");
                return Ok(false);
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Graceful-then-forced teardown of whatever is still running.
    /// After this returns, no child remains alive.
    async fn shutdown_remaining(&self, handles: &mut [ProcessHandle]) {
        for handle in handles.iter_mut() {
            if handle.is_running() {
                handle.terminate();
            }
        }

        let grace_deadline = time::Instant::now() + self.config.supervise.grace_period();
        loop {
            let mut still_running = false;
            for handle in handles.iter_mut() {
                match handle.poll_exit() {
                    Ok(Some(_)) => {}
                    Ok(None) => still_running = true,
                    Err(e) => log::warn!("{:#}", e),
                }
            }
            if !still_running || time::Instant::now() >= grace_deadline {
                break;
            }
            time::sleep(Duration::from_millis(50)).await;
        }

        for handle in handles.iter_mut() {
            if handle.is_running() {
                handle.force_kill().await;
            }
        }
    }
}
