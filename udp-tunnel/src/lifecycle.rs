//! Supervision of the local side: run until told to stop, then clean up
//! the far side exactly once.
//!
//! The remote relay outlives the local `ssh` process, so stopping the local
//! side is a two step protocol driven from here:
//!
//! 1. ask the far host to kill the remote relay ([`Teardown::kill_remote`])
//! 2. remove the local temporary state ([`Teardown::remove_temp_state`])
//!
//! Both steps run from [`Lifecycle::cleanup`], which is guarded so that any
//! number of triggers (a burst of signals, the tunnel dying at the same
//! moment) run the sequence once. A failed remote kill is logged and does
//! not stop the local cleanup; it leaves a stray remote relay behind, which
//! is reported rather than hidden.

use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::sync::OnceCell;
use udp_tunnel_net::Graceful;

use crate::error::{LifecycleError, TeardownError};

/// What ended a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
    /// Shutdown requested in-process through [`Graceful::cancel`].
    Requested,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Interrupt => write!(f, "SIGINT"),
            Termination::Terminate => write!(f, "SIGTERM"),
            Termination::Quit => write!(f, "SIGQUIT"),
            Termination::Hangup => write!(f, "SIGHUP"),
            Termination::Requested => write!(f, "shutdown request"),
        }
    }
}

/// Handlers for every signal that should stop the local side.
///
/// Once registered, these signals no longer terminate the process by
/// default, for the rest of its life. Later deliveries while cleanup is
/// running are therefore absorbed instead of cutting it short.
#[cfg(unix)]
pub struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next termination signal.
    pub async fn recv(&mut self) -> Termination {
        tokio::select! {
            _ = self.interrupt.recv() => Termination::Interrupt,
            _ = self.terminate.recv() => Termination::Terminate,
            _ = self.quit.recv() => Termination::Quit,
            _ = self.hangup.recv() => Termination::Hangup,
        }
    }
}

#[cfg(not(unix))]
pub struct Signals;

#[cfg(not(unix))]
impl Signals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> Termination {
        let _ = tokio::signal::ctrl_c().await;
        Termination::Interrupt
    }
}

/// Stop side of the tunnel.
#[async_trait::async_trait]
pub trait Teardown: Send + Sync {
    /// Kill the remote relay on the far host and wait for that to finish.
    async fn kill_remote(&self) -> Result<(), TeardownError>;

    /// Remove local temporary state. Must be safe to call more than once.
    fn remove_temp_state(&self) -> std::io::Result<()>;
}

/// Result of the one cleanup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub remote_killed: bool,
    pub temp_removed: bool,
}

pub struct Lifecycle<T> {
    teardown: T,
    graceful: Graceful,
    grace: Duration,
    signal_settle: Duration,
    cleanup: OnceCell<CleanupReport>,
}

impl<T: Teardown> Lifecycle<T> {
    pub fn new(teardown: T, graceful: Graceful) -> Self {
        Self {
            teardown,
            graceful,
            grace: Duration::from_secs(2),
            signal_settle: Duration::from_millis(250),
            cleanup: OnceCell::new(),
        }
    }

    /// How long in-flight sessions get to finish before cleanup starts.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// How long a tunnel exit waits for a termination signal that may be
    /// behind it.
    ///
    /// `ssh` shares the terminal's process group, so Ctrl-C or a hangup
    /// reaches it as well and it can exit just before our own handler
    /// wakes up. It stays in that group because it may need the terminal
    /// to ask for a password.
    pub fn with_signal_settle(mut self, settle: Duration) -> Self {
        self.signal_settle = settle;
        self
    }

    pub fn teardown(&self) -> &T {
        &self.teardown
    }

    /// Run the teardown sequence. Only the first call does any work; every
    /// caller, concurrent or later, gets the same report.
    pub async fn cleanup(&self) -> CleanupReport {
        *self.cleanup.get_or_init(|| self.run_cleanup()).await
    }

    async fn run_cleanup(&self) -> CleanupReport {
        let remote_killed = match self.teardown.kill_remote().await {
            Ok(()) => {
                tracing::info!("Remote relay stopped");
                true
            }
            Err(e) => {
                tracing::warn!("Could not stop remote relay, it may still be running: {e}");
                false
            }
        };

        let temp_removed = match self.teardown.remove_temp_state() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to remove temporary state: {e}");
                false
            }
        };

        CleanupReport {
            remote_killed,
            temp_removed,
        }
    }

    /// Supervise `relay` until it stops, the tunnel exits, or `termination`
    /// fires; then shut the relay down and clean up.
    ///
    /// A signal is a normal end and returns `Ok`. The tunnel going away on
    /// its own, or the relay failing, returns an error, after cleanup.
    pub async fn run<R, X, S>(
        &self,
        relay: R,
        tunnel_exit: X,
        termination: S,
    ) -> Result<Termination, LifecycleError>
    where
        R: Future<Output = std::io::Result<()>>,
        X: Future<Output = std::io::Result<ExitStatus>>,
        S: Future<Output = Termination>,
    {
        tokio::pin!(termination);

        let outcome = tokio::select! {
            biased;

            termination = &mut termination => {
                tracing::info!("Received {termination}, shutting down");
                Ok(termination)
            }
            status = tunnel_exit => {
                match tokio::time::timeout(self.signal_settle, &mut termination).await {
                    Ok(termination) => {
                        tracing::info!("Received {termination}, shutting down");
                        Ok(termination)
                    }
                    Err(_) => {
                        let status = match status {
                            Ok(status) => status.to_string(),
                            Err(e) => e.to_string(),
                        };
                        tracing::error!("Tunnel exited: {status}");
                        Err(LifecycleError::TunnelExited { status })
                    }
                }
            }
            result = relay => match result {
                Ok(()) => Ok(Termination::Requested),
                Err(source) => {
                    tracing::error!("Relay failed: {source}");
                    Err(LifecycleError::Relay { source })
                }
            },
        };

        self.graceful.shutdown(self.grace).await;
        let report = self.cleanup().await;
        tracing::debug!("Cleanup finished: {report:?}");

        outcome
    }
}
