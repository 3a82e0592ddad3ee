use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::session::{LaunchConfig, DEFAULT_READY_PATTERN};

#[derive(Debug, Parser, Clone)]
#[command(name = "agent-session-broker")]
#[command(about = "Exposes an interactive agent CLI session as an asynchronous HTTP API")]
pub struct Config {
    /// The interactive CLI to supervise (e.g. "claude").
    #[arg(required = true)]
    pub command: String,

    /// Additional arguments passed to the supervised CLI.
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Workspace root; session home directories are created beneath it.
    /// Defaults to the current directory.
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Explicit session home directory. Must be a concrete path; ~ is rejected.
    #[arg(long)]
    pub home_dir: Option<PathBuf>,

    /// Fixed terminal view port. An ephemeral port is picked when omitted.
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, default_value_t = 8377)]
    pub api_port: u16,

    /// Regex matched per pane line to detect the ready prompt.
    #[arg(long, default_value = DEFAULT_READY_PATTERN)]
    pub ready_pattern: String,

    #[arg(long, default_value_t = 30_000)]
    pub ready_timeout_ms: u64,

    #[arg(long, default_value_t = 500)]
    pub ready_poll_ms: u64,

    #[arg(long, default_value = "notify.json")]
    pub notify_file: String,

    /// Credential/config file to place in the session home before launch,
    /// as REL=SRC (relative destination = local source path). Repeatable.
    #[arg(long = "credential", value_name = "REL=SRC")]
    pub credentials: Vec<String>,

    /// Run without launching a session (notification-only mode).
    #[arg(long, default_value_t = false)]
    pub no_launch: bool,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn launch_config(&self, home_dir: PathBuf) -> LaunchConfig {
        LaunchConfig {
            enabled: !self.no_launch,
            command: self.command.clone(),
            args: self.args.clone(),
            home_dir,
            port: self.port,
            ready_pattern: self.ready_pattern.clone(),
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            ready_poll_interval: Duration::from_millis(self.ready_poll_ms),
        }
    }
}
