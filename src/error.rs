use std::time::Duration;

use thiserror::Error;

/// Problems with the configuration file. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is malformed: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Reasons a single RSSI read did not produce a value.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("device {0} not seen")]
    Unreachable(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("query failed: {0}")]
    Query(String),

    #[error("bluetooth adapter error: {0}")]
    Adapter(#[from] btleplug::Error),
}

/// Reasons a lock attempt (or lock status check) failed.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("`{program}` failed: {reason}")]
    CommandFailed { program: String, reason: String },

    #[error("`{program}` did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("no graphical session found for user {0}")]
    NoSession(String),

    #[error("all screen lock methods failed")]
    AllMethodsFailed,
}
