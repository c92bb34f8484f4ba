//! Error types for tracemon

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tracemon
#[derive(Error, Debug)]
pub enum Error {
    /// Table model / registry errors
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Persistence engine errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Session runner errors
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    /// Remote transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Schema registry and table-model errors
#[derive(Error, Debug)]
pub enum SchemaError {
    /// A table with this name is already registered
    #[error("table '{0}' is already registered")]
    DuplicateTable(String),

    /// Lookup of an unregistered table
    #[error("table '{0}' is not registered")]
    TableNotFound(String),

    /// Registration attempted after the engine froze the schema
    #[error("schema is frozen; table '{0}' cannot be registered")]
    RegistryFrozen(String),

    /// More than one field flagged as primary key
    #[error("table '{0}' declares more than one primary key")]
    MultiplePrimaryKeys(String),

    /// A row does not match the table's field count
    #[error("row for table '{table}' has {got} values, expected {expected}")]
    RowArity {
        table: String,
        expected: usize,
        got: usize,
    },
}

/// Persistence engine errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database failure
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// `start` called on an engine that already has a writer
    #[error("engine is already started")]
    AlreadyStarted,

    /// A waiting caller's deadline passed before the writer published
    #[error("timeout expired on query {statement}")]
    WaitTimeout { statement: String },

    /// The writer exited before publishing a result for this item
    #[error("writer stopped before the result was published")]
    WriterGone,
}

/// Session runner errors
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Consecutive failures reached the fault-tolerance budget
    #[error("stop session '{name}': errors count arrived to limit ({limit}); last: {last}")]
    BudgetExhausted {
        name: String,
        limit: usize,
        last: String,
    },
}

/// Remote transport errors, produced by `Transport` implementations
#[derive(Error, Debug)]
pub enum TransportError {
    /// Session establishment failed
    #[error("connect to '{host}' failed: {reason}")]
    Connect { host: String, reason: String },

    /// Command execution failed
    #[error("command failed: {reason}")]
    Command { reason: String },

    /// Session teardown failed
    #[error("disconnect failed: {reason}")]
    Disconnect { reason: String },

    /// An operation that requires a live session was called without one
    #[error("not connected")]
    NotConnected,
}

/// Construction-time validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Host alias is mandatory
    #[error("host alias must not be empty")]
    MissingAlias,

    /// Host address is mandatory
    #[error("host address must not be empty for '{0}'")]
    MissingHost(String),

    /// A host with this alias is already registered
    #[error("host '{0}' is already registered")]
    DuplicateAlias(String),

    /// The periodic command stage has no commands
    #[error("command set for '{0}' is empty")]
    EmptyCommandSet(String),

    /// Interval must be positive
    #[error("interval for '{0}' must be greater than zero")]
    ZeroInterval(String),

    /// Fault tolerance must be positive
    #[error("fault tolerance for '{0}' must be greater than zero")]
    ZeroFaultTolerance(String),

    /// Config file could not be parsed
    #[error("invalid config {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_wraps_into_error() {
        let err: Error = StoreError::WaitTimeout {
            statement: "INSERT INTO Sample VALUES (?, ?)".to_string(),
        }
        .into();
        let text = err.to_string();
        assert!(text.contains("Store error"));
        assert!(text.contains("timeout expired on query"));
    }

    #[test]
    fn budget_message_names_session_and_limit() {
        let err = RunnerError::BudgetExhausted {
            name: "web01/cpu".to_string(),
            limit: 10,
            last: "connect refused".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("web01/cpu"));
        assert!(text.contains("limit (10)"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
