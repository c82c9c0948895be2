//! Error types, grouped by how far a failure is allowed to propagate.
//!
//! - [`ConfigError`], [`AllocationError`] and [`BridgeError`] abort startup.
//! - [`LaunchError`] and [`SessionError`] abort one session's creation.
//! - [`RouteError`] is an expected outcome of a POST racing a teardown.
//! - [`SendError`] ends one forwarding direction and tears its session down.
//!
//! [`ProxyError`] collects the startup-time variants for the binary.

use std::io;

use thiserror::Error;

use crate::registry::SessionId;

/// Configuration could not be loaded or is incomplete.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("no child command given")]
    MissingCommand,
}

/// The port allocator could not produce a usable port.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("bound listener has no local address: {0}")]
    NoAddress(#[source] io::Error),
}

/// A child process could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("child process `{command}` has no {pipe} pipe")]
    MissingPipe { command: String, pipe: &'static str },
}

/// Session creation failed before the session was registered.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("could not mint a unique session id after {0} attempts")]
    IdExhausted(usize),
    #[error("session {0} is already registered")]
    Duplicate(SessionId),
    #[error("relay is shutting down")]
    ShuttingDown,
}

/// A POST addressed a session that is not (or no longer) registered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no such session: {0}")]
    NotFound(SessionId),
}

/// Delivering one message to a peer failed.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("peer is closed")]
    Closed,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote rejected message with status {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// The single-session bridge could not be established.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server at {url} answered with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("server at {0} closed the stream before announcing its endpoint")]
    NoEndpoint(String),
    #[error("timed out waiting for the endpoint event from {0}")]
    Timeout(String),
}

/// Any error that aborts the process at startup.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}
