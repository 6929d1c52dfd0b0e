use std::collections::HashMap;
use thiserror::Error;

/// Unified error type for the processing-state tracker
#[derive(Debug, Error)]
pub enum ProcError {
    /// A caller broke an operation's contract (not recoverable)
    #[error("Precondition violated in {operation}: {message}")]
    PreconditionViolation {
        operation: String,
        message: String,
        context: HashMap<String, String>,
    },

    /// The execution backend could not be reached
    #[error("Backend unavailable during {operation}: {message}")]
    BackendUnavailable {
        operation: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The backend holds no record for a handle
    #[error("Unknown task handle: {handle}")]
    UnknownHandle { handle: String },

    /// A payload could not be merged into a job
    #[error("Merge failed for field {field}: {message}")]
    Merge { field: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProcError {
    /// Create a precondition violation
    pub fn precondition<S: Into<String>, M: Into<String>>(operation: S, message: M) -> Self {
        Self::PreconditionViolation {
            operation: operation.into(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to a precondition violation
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::PreconditionViolation { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    /// Create a backend unavailable error
    pub fn backend_unavailable<S: Into<String>, M: Into<String>>(operation: S, message: M) -> Self {
        Self::BackendUnavailable {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a backend unavailable error with source
    pub fn backend_unavailable_with_source<
        S: Into<String>,
        M: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    >(
        operation: S,
        message: M,
        source: E,
    ) -> Self {
        Self::BackendUnavailable {
            operation: operation.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn unknown_handle<S: Into<String>>(handle: S) -> Self {
        Self::UnknownHandle {
            handle: handle.into(),
        }
    }

    /// Create a merge error
    pub fn merge<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Merge {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error for a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Transient backend trouble; a later reconciliation may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BackendUnavailable { .. } | Self::Io { .. } => true,
            Self::PreconditionViolation { .. } | Self::Configuration { .. } => false,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::PreconditionViolation { .. } => "precondition",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::UnknownHandle { .. } => "unknown_handle",
            Self::Merge { .. } => "merge",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ProcError>;

impl From<std::io::Error> for ProcError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ProcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ProcError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("invalid yaml: {}", err))
    }
}

impl From<anyhow::Error> for ProcError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
