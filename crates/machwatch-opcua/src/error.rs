// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for machine monitoring.
//!
//! Errors are grouped by the failure domain they come from, which also
//! decides how the monitor reacts to them:
//!
//! ```text
//! MonitorError
//! ├── Transport   - open/session/subscription failures, retried with backoff
//! ├── Read        - single node reads, surfaced to the caller
//! ├── Write       - single node writes, surfaced to the caller
//! ├── Monitoring  - monitored item failures, never tear down the subscription
//! ├── Config      - invalid settings, fatal at startup
//! └── Handler     - consumer callback failures, isolated per handler
//! ```
//!
//! # Examples
//!
//! ```
//! use machwatch_opcua::error::{MonitorError, TransportError};
//!
//! let error = MonitorError::from(TransportError::open(
//!     "opc.tcp://localhost:4840",
//!     "connection refused",
//! ));
//! assert!(error.is_retryable());
//! assert_eq!(error.category(), "transport");
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::Level;

use crate::types::{NodeId, StatusCode};

/// Result type alias for monitoring operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

// =============================================================================
// MonitorError - Main Error Type
// =============================================================================

/// The main error type of the crate.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Transport, session or subscription failures.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Node read failures.
    #[error("{0}")]
    Read(#[from] ReadError),

    /// Node write failures.
    #[error("{0}")]
    Write(#[from] WriteError),

    /// Monitored item failures.
    #[error("{0}")]
    Monitoring(#[from] MonitoringError),

    /// Configuration errors.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Consumer handler failures.
    #[error("{0}")]
    Handler(#[from] HandlerError),
}

impl MonitorError {
    /// Returns `true` if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Read(ReadError::Timeout { .. }) => true,
            _ => false,
        }
    }

    /// Returns `true` if this error reports a connect attempt that was
    /// overtaken by a newer connection or an explicit disconnect.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Superseded))
    }

    /// Returns the error category for structured logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Read(_) => "read",
            Self::Write(_) => "write",
            Self::Monitoring(_) => "monitoring",
            Self::Config(_) => "config",
            Self::Handler(_) => "handler",
        }
    }

    /// Returns the severity of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Transport(TransportError::Superseded) => ErrorSeverity::Info,
            Self::Transport(_) => ErrorSeverity::Error,
            Self::Read(_) | Self::Write(_) => ErrorSeverity::Warning,
            Self::Monitoring(_) | Self::Handler(_) => ErrorSeverity::Warning,
            Self::Config(_) => ErrorSeverity::Critical,
        }
    }

    /// Logs this error at the level matching its severity.
    pub fn log(&self, context: &str) {
        match self.severity().to_tracing_level() {
            Level::ERROR => tracing::error!(
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
            Level::WARN => tracing::warn!(
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
            _ => tracing::debug!(
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
        }
    }
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Severity levels used to pick a log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected during normal operation.
    Info,
    /// Recoverable, worth surfacing.
    Warning,
    /// Operation failed.
    Error,
    /// The monitor cannot start.
    Critical,
}

impl ErrorSeverity {
    /// Maps the severity to a tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::DEBUG,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }
}

// =============================================================================
// TransportError
// =============================================================================

/// Failures while establishing or holding the protocol connection.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The transport could not be opened.
    #[error("Failed to open transport to '{endpoint}': {message}")]
    Open {
        /// Target endpoint.
        endpoint: String,
        /// Failure description.
        message: String,
    },

    /// Session creation failed.
    #[error("Session creation failed: {message}")]
    SessionCreation {
        /// Failure description.
        message: String,
    },

    /// Subscription creation failed.
    #[error("Subscription creation failed: {message}")]
    SubscriptionCreation {
        /// Failure description.
        message: String,
    },

    /// The connection dropped.
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// Reason reported by the transport.
        reason: String,
    },

    /// A connect attempt was overtaken by a newer connection or an
    /// explicit disconnect.
    #[error("Connection attempt superseded")]
    Superseded,

    /// A teardown step failed.
    #[error("Failed to close {what}: {message}")]
    Close {
        /// Which resource failed to close.
        what: &'static str,
        /// Failure description.
        message: String,
    },
}

impl TransportError {
    /// Creates an open error.
    pub fn open(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Open {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates a session creation error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::SessionCreation {
            message: message.into(),
        }
    }

    /// Creates a subscription creation error.
    pub fn subscription(message: impl Into<String>) -> Self {
        Self::SubscriptionCreation {
            message: message.into(),
        }
    }

    /// Creates a connection lost error.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Creates a close error.
    pub fn close(what: &'static str, message: impl Into<String>) -> Self {
        Self::Close {
            what,
            message: message.into(),
        }
    }

    /// Returns `true` if reconnecting may help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Superseded | Self::Close { .. })
    }
}

// =============================================================================
// ReadError / WriteError
// =============================================================================

/// Failures of a single node read.
#[derive(Debug, Clone, Error)]
pub enum ReadError {
    /// No live session.
    #[error("Cannot read '{node_id}': not connected")]
    NotConnected {
        /// Node that was requested.
        node_id: NodeId,
    },

    /// The read request failed.
    #[error("Read of '{node_id}' failed: {message}")]
    Failed {
        /// Node that was requested.
        node_id: NodeId,
        /// Failure description.
        message: String,
    },

    /// The server answered with a bad status.
    #[error("Read of '{node_id}' returned bad status {status}")]
    BadStatus {
        /// Node that was requested.
        node_id: NodeId,
        /// Returned status.
        status: StatusCode,
    },

    /// The read did not finish in time.
    #[error("Read of '{node_id}' timed out after {timeout:?}")]
    Timeout {
        /// Node that was requested.
        node_id: NodeId,
        /// Applied timeout.
        timeout: Duration,
    },
}

impl ReadError {
    /// Creates a failed read error.
    pub fn failed(node_id: &NodeId, message: impl Into<String>) -> Self {
        Self::Failed {
            node_id: node_id.clone(),
            message: message.into(),
        }
    }
}

/// Failures of a single node write.
#[derive(Debug, Clone, Error)]
pub enum WriteError {
    /// No live session.
    #[error("Cannot write '{node_id}': not connected")]
    NotConnected {
        /// Target node.
        node_id: NodeId,
    },

    /// The write request failed.
    #[error("Write of '{node_id}' failed: {message}")]
    Failed {
        /// Target node.
        node_id: NodeId,
        /// Failure description.
        message: String,
    },

    /// The server rejected the value.
    #[error("Write of '{node_id}' returned bad status {status}")]
    BadStatus {
        /// Target node.
        node_id: NodeId,
        /// Returned status.
        status: StatusCode,
    },
}

impl WriteError {
    /// Creates a failed write error.
    pub fn failed(node_id: &NodeId, message: impl Into<String>) -> Self {
        Self::Failed {
            node_id: node_id.clone(),
            message: message.into(),
        }
    }
}

// =============================================================================
// MonitoringError
// =============================================================================

/// Failures of monitored items.
#[derive(Debug, Clone, Error)]
pub enum MonitoringError {
    /// No active subscription to attach the item to.
    #[error("Subscription not created")]
    NotSubscribed,

    /// The server refused to create the item.
    #[error("Failed to monitor '{display_name}': {message}")]
    ItemCreation {
        /// Registry key of the item.
        display_name: String,
        /// Failure description.
        message: String,
    },

    /// The item reported an error after creation.
    #[error("Monitored item '{display_name}' failed: {message}")]
    ItemFailure {
        /// Registry key of the item.
        display_name: String,
        /// Failure description.
        message: String,
    },
}

impl MonitoringError {
    /// Creates an item creation error.
    pub fn item_creation(display_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ItemCreation {
            display_name: display_name.into(),
            message: message.into(),
        }
    }

    /// Creates an item failure error.
    pub fn item_failure(display_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ItemFailure {
            display_name: display_name.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// ConfigError
// =============================================================================

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is missing or empty.
    #[error("Missing required field: {field}")]
    MissingField {
        /// Field path.
        field: String,
    },

    /// A field holds an unusable value.
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue {
        /// Field path.
        field: String,
        /// What is wrong.
        message: String,
    },

    /// The configuration source could not be parsed.
    #[error("Failed to parse configuration '{}': {message}", path.display())]
    Parse {
        /// Source file.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// The configuration file could not be read.
    #[error("Failed to read configuration '{}'", path.display())]
    Io {
        /// Source file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// =============================================================================
// HandlerError
// =============================================================================

/// Failure raised by a consumer-supplied handler.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("Handler '{handler}' failed: {message}")]
    Failed {
        /// Handler name.
        handler: String,
        /// Failure description.
        message: String,
    },

    /// The handler panicked.
    #[error("Handler '{handler}' panicked: {message}")]
    Panicked {
        /// Handler name.
        handler: String,
        /// Panic payload, when it was a string.
        message: String,
    },
}

impl HandlerError {
    /// Creates a failed handler error.
    pub fn failed(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// Creates a panicked handler error.
    pub fn panicked(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Panicked {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        let open = MonitorError::from(TransportError::open("opc.tcp://h:4840", "refused"));
        assert!(open.is_retryable());

        let superseded = MonitorError::from(TransportError::Superseded);
        assert!(!superseded.is_retryable());
        assert!(superseded.is_superseded());

        let config = MonitorError::from(ConfigError::missing_field("connection.endpoint"));
        assert!(!config.is_retryable());
        assert_eq!(config.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_read_timeout_is_retryable() {
        let error = MonitorError::from(ReadError::Timeout {
            node_id: NodeId::string(2, "Temp"),
            timeout: Duration::from_secs(2),
        });
        assert!(error.is_retryable());
        assert_eq!(error.category(), "read");
    }

    #[test]
    fn test_display() {
        let error = MonitorError::from(MonitoringError::NotSubscribed);
        assert_eq!(error.to_string(), "Subscription not created");

        let error = MonitorError::from(ReadError::BadStatus {
            node_id: NodeId::numeric(0, 2259),
            status: StatusCode::BAD_NODE_ID_UNKNOWN,
        });
        assert!(error.to_string().contains("ns=0;i=2259"));
        assert!(error.to_string().contains("0x80340000"));
    }
}
