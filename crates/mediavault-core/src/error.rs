use std::io;
use thiserror::Error;

/// Failure classes reported by object-store clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Transient,
    Timeout,
    NotFound,
    PermissionDenied,
    QuotaExceeded,
    Other,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Cannot access '{path}': {source}")]
    FileAccess {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Remote error ({kind:?}): {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("Location '{0}' is already registered")]
    DuplicateLocation(String),

    #[error("Unknown location '{0}'")]
    UnknownLocation(String),

    #[error("Unknown asset {0}")]
    UnknownAsset(String),

    #[error("Verification failed copying {expected} to '{location}': destination hashed to {actual}")]
    MigrationVerification {
        expected: String,
        actual: String,
        location: String,
    },

    #[error("Refusing to remove the last copy of {0}")]
    LastCopy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn file_access(path: impl Into<String>, source: io::Error) -> Self {
        Error::FileAccess {
            path: path.into(),
            source,
        }
    }

    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Error::Remote {
            kind,
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) | Error::FileAccess { source: e, .. } => is_transient_io(e),
            Error::Remote { kind, .. } => {
                matches!(kind, RemoteErrorKind::Transient | RemoteErrorKind::Timeout)
            }
            Error::Database(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) | Error::FileAccess { source: e, .. } => {
                e.kind() == io::ErrorKind::NotFound
            }
            Error::Remote { kind, .. } => *kind == RemoteErrorKind::NotFound,
            _ => false,
        }
    }

    /// Configuration failures are fatal to a whole run. A location name that
    /// is taken or unknown counts as one.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidConfig(_)
                | Error::DuplicateLocation(_)
                | Error::UnknownLocation(_)
        )
    }
}

fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

pub type Result<T> = std::result::Result<T, Error>;
