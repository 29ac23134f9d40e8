use std::path::PathBuf;

use thiserror::Error;

/// Problems with the description file or the local setup. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid description: {0}")]
    Invalid(String),

    #[error("virtualenv '{0}' does not provide bin/aiodns-proxy")]
    MissingVirtualenv(String),
}

impl ConfigurationError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigurationError::Invalid(msg.into())
    }
}

/// A subprocess, SSH hop or node console misbehaved.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to spawn `{cmd}`: {reason}")]
    Spawn { cmd: String, reason: String },

    #[error("`{cmd}` exited with {status}: {stderr}")]
    Failed {
        cmd: String,
        status: String,
        stderr: String,
    },

    #[error("console of {node} failed: {reason}")]
    Console { node: String, reason: String },
}

/// A run could not be brought into a measurable state.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("border router on {sink} did not come up: {reason}")]
    BorderRouter { sink: String, reason: String },

    #[error("{node} did not get a global IPv6 address")]
    NoGlobalAddress { node: String },

    #[error("{node} did not converge: {reason}")]
    Convergence { node: String, reason: String },

    #[error("{node} cannot reach the resolver at {addr}")]
    ResolverUnreachable { node: String, addr: String },

    #[error("{node} failed to initialise transport towards {endpoint}")]
    TransportInit { node: String, endpoint: String },

    #[error("{node} did not accept the OSCORE context")]
    Oscore { node: String },

    #[error("{node} did not accept query delay of {value} ms")]
    SleepSchedule { node: String, value: u64 },

    #[error("{node} proxy setup failed: {reason}")]
    Proxy { node: String, reason: String },
}

impl ExperimentError {
    pub fn is_border_router(&self) -> bool {
        matches!(self, ExperimentError::BorderRouter { .. })
    }
}
