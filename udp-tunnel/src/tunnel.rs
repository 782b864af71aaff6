//! The ssh process that carries the tunnel and hosts the remote relay.
//!
//! Starting a circuit is one `ssh` invocation that does three things at
//! once: opens a control master (so later commands can reuse the
//! connection), forwards a local TCP port to the remote relay's port, and
//! runs the remote relay as its command.
//!
//! Stopping it is a second, separate invocation that runs `pkill` on the
//! far host. Killing the local `ssh` alone is not enough: without a pty the
//! remote relay does not get a hangup when the session drops, and keeps
//! running detached.

use std::borrow::Cow;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::{SetupError, TeardownError};
use crate::remote::RetryPolicy;

/// Everything needed to build both ssh command lines.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Program used to reach the far host, normally `ssh`.
    pub ssh_program: String,
    /// Extra arguments placed before the host (`-p 2222`, `-i key`, ...).
    pub ssh_args: Vec<String>,
    pub host: String,
    /// Local end of the port forward; the local relay connects here.
    pub forward_port: u16,
    /// Port the remote relay listens on, on the far host's loopback.
    pub remote_port: u16,
    /// `host:port` the remote relay sends datagrams to.
    pub destination: String,
    /// Path or name of this binary on the far host.
    pub remote_program: String,
    pub retry: RetryPolicy,
    /// How long the remote kill may take before it is abandoned.
    pub kill_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            ssh_args: Vec::new(),
            host: String::new(),
            forward_port: 18889,
            remote_port: 18889,
            destination: "localhost:88".to_string(),
            remote_program: "udp-tunnel".to_string(),
            retry: RetryPolicy::default(),
            kill_timeout: Duration::from_secs(10),
        }
    }
}

impl TunnelConfig {
    /// Command line that starts the remote relay, quoted for the remote
    /// shell.
    pub fn remote_command(&self) -> String {
        let words = [
            self.remote_program.clone(),
            "remote".to_string(),
            "--listen-port".to_string(),
            self.remote_port.to_string(),
            "--destination".to_string(),
            self.destination.clone(),
            "--attempt-timeout-ms".to_string(),
            self.retry.attempt_timeout.as_millis().to_string(),
            "--max-attempts".to_string(),
            self.retry.max_attempts.to_string(),
        ];

        words
            .iter()
            .map(|word| shell_escape::escape(Cow::Borrowed(word.as_str())).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Command line that kills the remote relay started by
    /// [`TunnelConfig::remote_command`], quoted for the remote shell.
    pub fn kill_command(&self) -> String {
        let pattern = kill_pattern(&format!(
            "{} remote --listen-port {}",
            self.remote_program, self.remote_port
        ));
        format!("pkill -f -- {}", shell_escape::escape(Cow::Owned(pattern)))
    }

    fn master_args(&self, control_path: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-M".into(),
            "-S".into(),
            control_path.into(),
            "-o".into(),
            "ControlPersist=no".into(),
            "-o".into(),
            "ExitOnForwardFailure=yes".into(),
            "-L".into(),
            format!("{}:127.0.0.1:{}", self.forward_port, self.remote_port).into(),
        ];
        args.extend(self.ssh_args.iter().map(OsString::from));
        args.push(self.host.clone().into());
        args.push(self.remote_command().into());
        args
    }

    fn kill_args(&self, control_path: &Path) -> Vec<OsString> {
        // Reuses the master when it is still up, connects afresh otherwise.
        let mut args: Vec<OsString> = vec!["-S".into(), control_path.into()];
        args.extend(self.ssh_args.iter().map(OsString::from));
        args.push(self.host.clone().into());
        args.push(self.kill_command().into());
        args
    }
}

/// `pkill -f` regex for `command`.
///
/// The first character is wrapped in a bracket expression so the pattern
/// still matches the relay but no longer matches the remote shell whose
/// own command line contains the pattern text.
fn kill_pattern(command: &str) -> String {
    let mut chars = command.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };

    let mut pattern = String::with_capacity(command.len() + 8);
    if first.is_ascii_alphanumeric() || "/_-.~".contains(first) {
        pattern.push('[');
        pattern.push(first);
        pattern.push(']');
    } else {
        push_escaped(&mut pattern, first);
    }
    for c in chars {
        push_escaped(&mut pattern, c);
    }
    pattern
}

fn push_escaped(pattern: &mut String, c: char) {
    if "\\^$.|?*+()[]{}".contains(c) {
        pattern.push('\\');
    }
    pattern.push(c);
}

/// Handle on a running tunnel's local state: the control socket's
/// temporary directory and the config needed to stop the remote side.
pub struct SshTunnel {
    config: TunnelConfig,
    control_path: PathBuf,
    temp_dir: Mutex<Option<tempfile::TempDir>>,
}

/// The local `ssh` master process.
///
/// Killed when dropped, so a supervisor that stops polling it does not
/// leave the master behind.
pub struct TunnelProcess {
    child: Child,
}

impl SshTunnel {
    /// Create the control directory and spawn the `ssh` master.
    pub fn start(config: TunnelConfig) -> Result<(Self, TunnelProcess), SetupError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("udp-tunnel-")
            .tempdir()
            .map_err(|source| SetupError::TempDir { source })?;
        let control_path = temp_dir.path().join("control");

        tracing::info!(
            "Starting tunnel to {}: 127.0.0.1:{} -> remote 127.0.0.1:{}",
            config.host,
            config.forward_port,
            config.remote_port
        );
        tracing::debug!("Remote command: {}", config.remote_command());

        let child = Command::new(&config.ssh_program)
            .args(config.master_args(&control_path))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SetupError::Spawn {
                program: config.ssh_program.clone(),
                source,
            })?;

        let tunnel = SshTunnel {
            config,
            control_path,
            temp_dir: Mutex::new(Some(temp_dir)),
        };
        Ok((tunnel, TunnelProcess { child }))
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn control_path(&self) -> &Path {
        &self.control_path
    }
}

impl TunnelProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Resolves when `ssh` exits on its own.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kill the master and reap it.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already exited.
            tracing::trace!("ssh master not killed: {e}");
        }
        if let Err(e) = self.child.wait().await {
            tracing::warn!("Failed to reap ssh master: {e}");
        }
    }
}

#[async_trait::async_trait]
impl crate::lifecycle::Teardown for SshTunnel {
    async fn kill_remote(&self) -> Result<(), TeardownError> {
        tracing::info!("Stopping remote relay on {}", self.config.host);

        let status = Command::new(&self.config.ssh_program)
            .args(self.config.kill_args(&self.control_path))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status();

        let status = tokio::time::timeout(self.config.kill_timeout, status)
            .await
            .map_err(|_| TeardownError::Timeout(self.config.kill_timeout))?
            .map_err(|source| TeardownError::Spawn {
                program: self.config.ssh_program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(TeardownError::Status(status.to_string()))
        }
    }

    fn remove_temp_state(&self) -> std::io::Result<()> {
        let temp_dir = self
            .temp_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match temp_dir {
            Some(temp_dir) => {
                tracing::debug!("Removing {}", temp_dir.path().display());
                temp_dir.close()
            }
            None => Ok(()),
        }
    }
}
