// src/error.rs
use std::io;
use std::path::PathBuf;

/// Central error type for the etude engine.
#[derive(Debug, thiserror::Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A startup syscall (bind, listen, epoll_create, fork...) failed.
    #[error("{op} failed: {source}")]
    Setup {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The document root could not be scanned or mapped.
    #[error("static resource {path:?}: {source}")]
    Resource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Percent-decoded bytes were not valid UTF-8.
    #[error("malformed percent-encoding: {0}")]
    Decode(String),

    /// The user table could not be read or written.
    #[error("database error: {0}")]
    Database(String),

    /// The script endpoint failed or returned garbage.
    #[error("script execution failed: {0}")]
    Script(String),

    /// Every pooled database connection was handed out and none came back.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The peer shut down its side of the connection.
    #[error("peer closed the connection")]
    PeerClosed,
}

impl EtudeError {
    /// Wraps the current `errno` for a failed setup step.
    pub(crate) fn setup(op: &'static str) -> Self {
        EtudeError::Setup {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;
