//! Error types for udp-tunnel
//!
//! Errors are split by blast radius: a [`RelayError`] only ever fails the
//! one request it belongs to, a [`SetupError`] stops the process before
//! any request is served, and a [`LifecycleError`] ends a supervised run.

use std::net::SocketAddr;

/// Failure of a single relayed request. Never fatal to the relay loop.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to connect to tunnel at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("session framing error: {source}")]
    Frame {
        #[from]
        source: udp_tunnel_net::FrameError,
    },

    #[error("no reply from tunnel within {0:?}")]
    Timeout(std::time::Duration),

    #[error("destination did not answer after {attempts} attempts")]
    RemoteTimeout { attempts: u8 },

    #[error("destination unreachable from remote relay")]
    Unreachable,

    #[error("failed to send reply to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Process-fatal startup failures.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Bind(#[from] udp_tunnel_net::BindError),

    #[error("invalid destination {destination:?}: expected host:port")]
    Destination { destination: String },

    #[error("retry policy must allow at least one attempt")]
    NoAttempts,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to create temporary directory: {source}")]
    TempDir { source: std::io::Error },
}

/// Why a supervised run ended with an error.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("tunnel process exited unexpectedly ({status})")]
    TunnelExited { status: String },

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("relay stopped: {source}")]
    Relay { source: std::io::Error },
}

/// Failure of the remote kill during cleanup. Logged, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("remote kill command failed ({0})")]
    Status(String),

    #[error("remote kill command did not finish within {0:?}")]
    Timeout(std::time::Duration),
}
