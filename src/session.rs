//! Session supervision: tmux + ttyd launch, readiness, keystrokes, teardown.
//!
//! The supervised CLI runs inside a tmux session that ttyd exposes as a web
//! terminal. The supervisor has no knowledge of interactions or queues; it
//! only launches the pair, polls the visible pane for a ready prompt, sends
//! keystrokes, and tears the pair down.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::types::View;

/// Ready-prompt signature matched against each pane line. The interactive
/// CLIs this wraps draw a `>` or `❯` prompt once they accept input.
pub const DEFAULT_READY_PATTERN: &str = r"^\s*[>❯]";

/// Delay between the literal keystrokes and the submit Enter, so the
/// terminal's input buffering settles before the submit lands.
const SUBMIT_SETTLE_DELAY: Duration = Duration::from_millis(150);
const TERMINATE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// When false, no process is spawned and the engine runs notification-only.
    pub enabled: bool,
    /// The interactive CLI to run inside the session.
    pub command: String,
    pub args: Vec<String>,
    /// Isolated session home; exported as HOME to the supervised process.
    pub home_dir: PathBuf,
    /// Fixed terminal view port; an OS-assigned ephemeral port when absent.
    pub port: Option<u16>,
    pub ready_pattern: String,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
}

impl LaunchConfig {
    /// No-process mode for unit tests and non-interactive contexts.
    pub fn disabled(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: false,
            command: String::new(),
            args: Vec::new(),
            home_dir: home_dir.into(),
            port: None,
            ready_pattern: DEFAULT_READY_PATTERN.to_string(),
            ready_timeout: Duration::from_secs(30),
            ready_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Outcome of a successful launch.
#[derive(Debug, Clone)]
pub struct LaunchState {
    pub pid: Option<u32>,
    /// tmux session name; `None` in disabled mode.
    pub session: Option<String>,
    pub views: Vec<View>,
}

pub struct SessionSupervisor {
    config: LaunchConfig,
    child: Mutex<Option<Child>>,
}

impl SessionSupervisor {
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    /// Spawn the ttyd/tmux pair bound to a fresh session id.
    pub async fn launch(&self) -> Result<LaunchState, EngineError> {
        if !self.config.enabled {
            return Ok(LaunchState {
                pid: None,
                session: None,
                views: Vec::new(),
            });
        }

        let session = format!("asb-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let port = match self.config.port {
            Some(port) => port,
            None => pick_ephemeral_port()
                .map_err(|err| EngineError::Launch(format!("no free port: {err}")))?,
        };

        let mut cmd = Command::new("ttyd");
        cmd.arg("-p")
            .arg(port.to_string())
            .arg("-W")
            .arg("tmux")
            .arg("new-session")
            .arg("-A")
            .arg("-s")
            .arg(&session)
            .arg(&self.config.command);
        for arg in &self.config.args {
            cmd.arg(arg);
        }
        cmd.env("HOME", &self.config.home_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd
            .spawn()
            .map_err(|err| EngineError::Launch(format!("failed to spawn ttyd: {err}")))?;
        let pid = child.id();
        *self.child.lock().await = Some(child);

        tracing::info!(target: "session_broker::session", session = %session, port, pid, "session launched");

        Ok(LaunchState {
            pid,
            session: Some(session),
            views: vec![View {
                name: "terminal".to_string(),
                port,
                protocol: "http".to_string(),
                url: format!("http://127.0.0.1:{port}"),
            }],
        })
    }

    /// Poll the visible pane until the ready prompt shows or the budget runs out.
    pub async fn wait_ready(&self, session: &str) -> Result<(), EngineError> {
        let pattern = Regex::new(&self.config.ready_pattern)
            .map_err(|err| EngineError::Launch(format!("invalid ready pattern: {err}")))?;
        let deadline = Instant::now() + self.config.ready_timeout;

        loop {
            if let Ok(output) = tmux(&["capture-pane", "-p", "-t", session]).await {
                if output.status.success()
                    && pane_is_ready(&pattern, &String::from_utf8_lossy(&output.stdout))
                {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Launch(format!(
                    "session {session} not ready within {:?}",
                    self.config.ready_timeout
                )));
            }
            sleep(self.config.ready_poll_interval).await;
        }
    }

    /// Send the input as literal keystrokes, then submit it.
    pub async fn deliver(&self, session: &str, input: &str) -> Result<(), EngineError> {
        tmux_ok(&["send-keys", "-t", session, "-l", "--", input])
            .await
            .map_err(EngineError::Delivery)?;
        sleep(SUBMIT_SETTLE_DELAY).await;
        tmux_ok(&["send-keys", "-t", session, "Enter"])
            .await
            .map_err(EngineError::Delivery)?;
        Ok(())
    }

    /// Send an interrupt keystroke. Callers treat failure as best-effort.
    pub async fn interrupt(&self, session: &str) -> Result<(), EngineError> {
        tmux_ok(&["send-keys", "-t", session, "C-c"])
            .await
            .map_err(EngineError::Delivery)
    }

    /// Tear the session down: kill-session, SIGTERM, bounded wait. All
    /// sub-step errors are swallowed so teardown always completes.
    pub async fn terminate(&self, session: Option<&str>, pid: Option<u32>) {
        if let Some(session) = session {
            let _ = tmux(&["kill-session", "-t", session]).await;
        }

        #[cfg(unix)]
        if let Some(pid) = pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if timeout(TERMINATE_WAIT, child.wait()).await.is_err() {
                tracing::warn!(target: "session_broker::session", "process ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
    }
}

fn pane_is_ready(pattern: &Regex, pane: &str) -> bool {
    pane.lines().any(|line| pattern.is_match(line))
}

fn pick_ephemeral_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

async fn tmux(args: &[&str]) -> std::io::Result<std::process::Output> {
    Command::new("tmux").args(args).output().await
}

async fn tmux_ok(args: &[&str]) -> Result<(), String> {
    match tmux(args).await {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(format!(
            "tmux {} failed: {}",
            args.first().unwrap_or(&"?"),
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(err) => Err(format!("failed to run tmux: {err}")),
    }
}
