use std::path::PathBuf;

/// Fatal configuration problems. Any of these prevents the server from being built.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unsupported config format: .{0}")]
    UnsupportedFormat(String),

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("private key must be 64 hex characters: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid exclude route pattern `{pattern}`: {message}")]
    InvalidExcludePattern { pattern: String, message: String },

    #[error("invalid exclude method `{0}`")]
    InvalidExcludeMethod(String),

    #[error("invalid listen address {0}")]
    InvalidAddress(String),

    #[error("tls is enabled but {0} is empty")]
    IncompleteTls(&'static str),
}
