/// Rejection of a [`TargetConfig`](crate::target::TargetConfig) before it is
/// persisted or turned into an output. Always names the offending field.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::MissingField { field } | ValidationError::InvalidField { field, .. } => field,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField { field, reason: reason.into() }
    }
}

/// Error type returned by [`TargetStore`](crate::store::TargetStore).
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("a log target named '{0}' already exists")]
    DuplicateName(String),

    #[error("log target not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Error type returned when building an output or delivering records to it.
#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    #[error("output is closed")]
    Closed,

    #[error("output is not connected")]
    NotConnected,

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint responded with status {status}")]
    Status { status: u16 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid target configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("{0} feature is not enabled")]
    FeatureDisabled(&'static str),
}

/// Error type returned by [`Manager`](crate::manager::Manager) operations.
#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("no target store attached")]
    NoTargetStore,
}
