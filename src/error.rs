//! Error taxonomy: capacity errors retried at the connection level,
//! transient errors retried at the query level, loss errors replayed
//! silently, sequence timeouts fatal for the socket.

/// Codes the server emits when it is out of connection capacity.
/// These are recoverable by waiting and reconnecting.
pub const TOO_MANY_CONNS_ERRORS: [&str; 7] = [
    "ER_TOO_MANY_USER_CONNECTIONS",
    "ER_CON_COUNT_ERROR",
    "ER_USER_LIMIT_REACHED",
    "ER_OUT_OF_RESOURCES",
    "PROTOCOL_CONNECTION_LOST",
    "PROTOCOL_SEQUENCE_TIMEOUT",
    "ETIMEDOUT",
];

/// Codes for statement failures that are safe to retry on the same
/// connection after a backoff delay.
pub const RETRYABLE_QUERY_ERRORS: [&str; 7] = [
    "ER_LOCK_DEADLOCK",
    "ER_LOCK_WAIT_TIMEOUT",
    "ER_QUERY_TIMEOUT",
    "ER_QUERY_INTERRUPTED",
    "ER_QUERY_KILLED",
    "ER_LOCKING_SERVICE_TIMEOUT",
    "ER_LOCKING_SERVICE_DEADLOCK",
];

/// An error reported by the underlying client library, tagged with the
/// MySQL error code string.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DriverError {
    pub code: String,
    pub message: String,
}

impl DriverError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Too-many-connections family, retried with backoff by the governor.
    pub fn is_capacity(&self) -> bool {
        TOO_MANY_CONNS_ERRORS.contains(&self.code.as_str())
    }

    /// Connection went away under us; the query layer reconnects and
    /// replays silently.
    pub fn is_connection_lost(&self) -> bool {
        self.code.starts_with("PROTOCOL_ENQUEUE_AFTER_")
            || matches!(
                self.code.as_str(),
                "PROTOCOL_CONNECTION_LOST" | "EPIPE" | "ECONNRESET"
            )
    }

    /// A timed-out socket cannot be trusted to carry further traffic.
    pub fn is_sequence_timeout(&self) -> bool {
        self.code == "PROTOCOL_SEQUENCE_TIMEOUT"
    }

    /// Transient statement failures, retried with backoff up to the
    /// configured query-retry budget.
    pub fn is_retryable_query(&self) -> bool {
        RETRYABLE_QUERY_ERRORS.contains(&self.code.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection could not be established after exhausting the retry
    /// budget, or failed with a non-retryable error.
    #[error("connection failed after {attempts} attempts: {source}")]
    ConnectionEstablish {
        attempts: u32,
        #[source]
        source: DriverError,
    },

    /// A statement failed. `sql` carries the substituted statement text
    /// when SQL-echo is enabled.
    #[error("{source}")]
    Query {
        #[source]
        source: DriverError,
        sql: Option<String>,
    },

    #[error("Invalid data source URL provided: {0}")]
    InvalidDsn(String),
}

impl Error {
    /// The underlying driver error, if this wraps one.
    pub fn driver(&self) -> Option<&DriverError> {
        match self {
            Error::ConnectionEstablish { source, .. } => Some(source),
            Error::Query { source, .. } => Some(source),
            Error::InvalidDsn(_) => None,
        }
    }

    /// Substituted statement text attached by SQL-echo mode.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}
