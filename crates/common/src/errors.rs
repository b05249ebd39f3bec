//! The error type shared by the loop, the HTTP client, and the MySQL client.
//!
//! A settled rejection may fan out to any number of continuations, so the
//! error is cheaply cloneable: the kind and message are inline and the
//! optional cause is behind an `Arc`.

use std::{
    fmt,
    sync::Arc,
};

pub type Result<T> = std::result::Result<T, Error>;

/// Stable classification of a failure. Retryability is a property of the
/// kind; policies may further narrow it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Operation aborted by the caller or a parent timeout.
    #[error("cancelled")]
    Cancelled,
    /// Wall-clock budget exceeded.
    #[error("timeout")]
    Timeout,
    /// Socket or DNS failure, TLS handshake error, connection refused.
    #[error("transport")]
    Transport,
    /// Malformed HTTP or MySQL frame, unexpected sequence id.
    #[error("protocol")]
    Protocol,
    /// Non-2xx response surfaced as an error at the caller's request.
    #[error("http status {0}")]
    HttpStatus(u16),
    /// MySQL ERR packet.
    #[error("sql error {code} ({sql_state})")]
    Sql { code: u16, sql_state: String },
    #[error("pool closed")]
    PoolClosed,
    #[error("pool exhausted")]
    PoolExhausted,
    #[error("file io")]
    FileIo,
    /// Cache read/write failure. Non-fatal: the request proceeds as a miss.
    #[error("cache")]
    Cache,
    /// Caller misuse, e.g. executing a closed statement.
    #[error("usage")]
    Usage,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::HttpStatus(..) => "http_status",
            ErrorKind::Sql { .. } => "sql",
            ErrorKind::PoolClosed => "pool_closed",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::FileIo => "file_io",
            ErrorKind::Cache => "cache",
            ErrorKind::Usage => "usage",
        }
    }
}

#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    cause: Option<Arc<anyhow::Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(kind: ErrorKind, message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Usage, message)
    }

    pub fn file_io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileIo, message)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    /// Whether a retry policy may consider this failure transient. Usage
    /// errors are never retried; cancellation is a caller decision, not a
    /// transient fault.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Transport | ErrorKind::Timeout => true,
            ErrorKind::HttpStatus(status) => status >= 500 && status != 501,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::NotFound
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::AlreadyExists => ErrorKind::FileIo,
            _ => ErrorKind::Transport,
        };
        Self::with_cause(kind, e.to_string(), e.into())
    }
}
