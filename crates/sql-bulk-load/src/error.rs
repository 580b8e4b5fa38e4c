//! Error types for the bulk-load engine.

use thiserror::Error;

/// Main error type for load operations.
#[derive(Error, Debug)]
pub enum LoadError {
    /// Configuration error (invalid YAML, missing fields, unsupported mode, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Driver-neutral SQL error carrying the SQL state and vendor code.
    #[error("Database error{}: {message}", format_state(.sql_state, .code))]
    Database {
        sql_state: Option<String>,
        code: Option<i64>,
        message: String,
    },

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error
    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// SQL Server driver error
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// Loading rows into a specific table failed
    #[error("Load failed for table {table}: {message}")]
    Load { table: String, message: String },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since the transaction began - cannot resume. Run cleanup and start again.")]
    ConfigChanged,

    /// Retries were exhausted (or the error was not retryable after a retry).
    /// Wraps the first error seen; `causes` summarizes every attempt.
    #[error("Giving up after {attempts} attempts: {causes}")]
    RetryExhausted {
        attempts: u32,
        causes: String,
        #[source]
        source: Box<LoadError>,
    },

    /// A failure followed by a second failure while releasing resources.
    /// The original failure is the one reported.
    #[error("{source} (suppressed: {suppressed})")]
    Suppressed {
        #[source]
        source: Box<LoadError>,
        suppressed: String,
    },

    /// IO error (file operations, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled (SIGINT, interrupted retry wait, etc.)
    #[error("Load cancelled")]
    Cancelled,
}

fn format_state(sql_state: &Option<String>, code: &Option<i64>) -> String {
    match (sql_state, code) {
        (Some(s), Some(c)) => format!(" [{} / {}]", s, c),
        (Some(s), None) => format!(" [{}]", s),
        (None, Some(c)) => format!(" [{}]", c),
        (None, None) => String::new(),
    }
}

impl LoadError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        LoadError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Load error
    pub fn load(table: impl Into<String>, message: impl Into<String>) -> Self {
        LoadError::Load {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a driver-neutral database error.
    pub fn database(
        sql_state: Option<&str>,
        code: Option<i64>,
        message: impl Into<String>,
    ) -> Self {
        LoadError::Database {
            sql_state: sql_state.map(str::to_string),
            code,
            message: message.into(),
        }
    }

    /// Attach a secondary failure (typically from `close()`) to this error.
    pub fn with_suppressed(self, suppressed: &LoadError) -> Self {
        LoadError::Suppressed {
            source: Box::new(self),
            suppressed: suppressed.to_string(),
        }
    }

    /// The error that actually caused this one, looking through retry and
    /// suppression wrappers.
    pub fn root(&self) -> &LoadError {
        match self {
            LoadError::RetryExhausted { source, .. } | LoadError::Suppressed { source, .. } => {
                source.root()
            }
            other => other,
        }
    }

    /// SQL state reported by the database, if any.
    pub fn sql_state(&self) -> Option<String> {
        match self.root() {
            LoadError::Database { sql_state, .. } => sql_state.clone(),
            LoadError::Postgres(e) => e.code().map(|c| c.code().to_string()),
            LoadError::Mysql(mysql_async::Error::Server(e)) => Some(e.state.clone()),
            _ => None,
        }
    }

    /// Vendor-specific error code reported by the database, if any.
    pub fn error_code(&self) -> Option<i64> {
        match self.root() {
            LoadError::Database { code, .. } => *code,
            LoadError::Mysql(mysql_async::Error::Server(e)) => Some(i64::from(e.code)),
            LoadError::Mssql(e) => e.code().map(i64::from),
            _ => None,
        }
    }

    /// True when the connection itself failed (reset, broken pipe, timeout)
    /// rather than the statement. Unresolvable hosts do not count.
    pub fn is_connection_failure(&self) -> bool {
        let root = self.root();
        let broken = match root {
            LoadError::Io(_) => true,
            LoadError::Postgres(e) => {
                e.is_closed()
                    || (e.code().is_none()
                        && std::error::Error::source(e).is_some_and(|s| s.is::<std::io::Error>()))
            }
            LoadError::Mysql(mysql_async::Error::Io(_)) => true,
            LoadError::Mssql(tiberius::error::Error::Io { .. }) => true,
            _ => false,
        };
        broken && !summarize_causes(root).contains("failed to lookup address")
    }

    /// True when the whole operation was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), LoadError::Cancelled)
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            LoadError::Config(_) | LoadError::Yaml(_) => 1,
            LoadError::Pool { .. } => 2,
            LoadError::Database { .. }
            | LoadError::Postgres(_)
            | LoadError::Mysql(_)
            | LoadError::Mssql(_) => 3,
            LoadError::Load { .. } => 4,
            LoadError::State(_) | LoadError::ConfigChanged | LoadError::Json(_) => 5,
            LoadError::Cancelled => 6,
            LoadError::Io(_) => 7,
            LoadError::RetryExhausted { .. } | LoadError::Suppressed { .. } => 4,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Join an error's message chain with `" < "`, collapsing consecutive
/// duplicate messages.
pub fn summarize_causes(err: &(dyn std::error::Error + 'static)) -> String {
    let mut messages: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let message = e.to_string();
        if messages.last() != Some(&message) {
            messages.push(message);
        }
        current = e.source();
    }
    messages.join(" < ")
}

/// Result type alias for load operations.
pub type Result<T> = std::result::Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("{message}")]
    struct Chained {
        message: String,
        #[source]
        source: Option<Box<Chained>>,
    }

    fn chain(messages: &[&str]) -> Chained {
        let mut err: Option<Chained> = None;
        for m in messages.iter().rev() {
            err = Some(Chained {
                message: m.to_string(),
                source: err.map(Box::new),
            });
        }
        err.unwrap()
    }

    #[test]
    fn test_summarize_causes_joins_chain() {
        let err = chain(&["commit failed", "connection reset"]);
        assert_eq!(summarize_causes(&err), "commit failed < connection reset");
    }

    #[test]
    fn test_summarize_causes_collapses_duplicates() {
        let err = chain(&["lock timeout", "lock timeout", "socket closed", "socket closed"]);
        assert_eq!(summarize_causes(&err), "lock timeout < socket closed");
    }

    #[test]
    fn test_database_error_display_includes_state() {
        let err = LoadError::database(Some("40P01"), None, "deadlock detected");
        assert_eq!(err.to_string(), "Database error [40P01]: deadlock detected");
        assert_eq!(err.sql_state().as_deref(), Some("40P01"));
        assert_eq!(err.error_code(), None);
    }

    #[test]
    fn test_root_looks_through_wrappers() {
        let first = LoadError::database(None, Some(1205), "lock wait timeout");
        let wrapped = LoadError::RetryExhausted {
            attempts: 3,
            causes: "lock wait timeout".into(),
            source: Box::new(first),
        };
        assert_eq!(wrapped.error_code(), Some(1205));
        assert_eq!(wrapped.exit_code(), 3);
    }

    #[test]
    fn test_suppressed_keeps_original() {
        let original = LoadError::load("orders", "flush failed");
        let close = LoadError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        let err = original.with_suppressed(&close);
        assert!(matches!(err.root(), LoadError::Load { .. }));
        assert!(err.to_string().contains("suppressed: IO error: broken pipe"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(LoadError::Config("x".into()).exit_code(), 1);
        assert_eq!(LoadError::pool("x", "y").exit_code(), 2);
        assert_eq!(LoadError::Cancelled.exit_code(), 6);
        assert_eq!(
            LoadError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "x")).exit_code(),
            7
        );
    }

    #[test]
    fn test_connection_failure_classification() {
        let reset = LoadError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        assert!(reset.is_connection_failure());

        let unknown_host = LoadError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        ));
        assert!(!unknown_host.is_connection_failure());

        assert!(!LoadError::database(Some("40001"), None, "x").is_connection_failure());
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let err = LoadError::RetryExhausted {
            attempts: 2,
            causes: "boom".into(),
            source: Box::new(LoadError::load("t", "boom")),
        };
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: Giving up after 2 attempts"));
        assert!(detailed.contains("Caused by:\n  1: Load failed for table t: boom"));
    }
}
