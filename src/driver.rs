use std::time::Duration;

use async_trait::async_trait;

/// Default numeric code a driver reports when a command exceeds its timeout.
/// The classifier's recognized code list is configurable but defaults to this.
pub const DEFAULT_TIMEOUT_ERROR_CODE: i32 = -2;

/// How to reach the target server, shared by every worker.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_string: String,
    /// Application name used when the command carries none or app-name
    /// mimicry is disabled.
    pub default_app_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Broken,
    Closed,
}

/// Failure surfaced by a driver call.
///
/// `Db` carries the server's numeric error code so the engine can classify
/// timeouts and transient database errors; anything the driver cannot
/// attribute to the server (socket teardown, protocol violation) is
/// `Unavailable` and treated as unclassified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    Db { code: i32, message: String },
    Unavailable(String),
}

impl DriverError {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Db { code, .. } => Some(*code),
            Self::Unavailable(_) => None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Db {
            code: DEFAULT_TIMEOUT_ERROR_CODE,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db { code, message } => write!(f, "database error {code}: {message}"),
            Self::Unavailable(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for DriverError {}

/// A single live connection to the target server, owned exclusively by one
/// worker. All execution flavors take the per-command timeout; exceeding it
/// must surface as a `Db` error carrying the driver's timeout code.
#[async_trait]
pub trait SqlConnection: Send {
    fn state(&self) -> ConnectionState;

    /// Name of the database this connection currently talks to.
    fn database(&self) -> &str;

    async fn change_database(&mut self, database: &str) -> Result<(), DriverError>;

    /// Executes without requesting rows.
    async fn execute_non_query(&mut self, sql: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Executes and returns the first column of the first row, if any.
    async fn execute_scalar_int(
        &mut self,
        sql: &str,
        timeout: Duration,
    ) -> Result<Option<i64>, DriverError>;

    /// Executes as a reader and fully drains every result set, discarding rows.
    async fn execute_drain(&mut self, sql: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Invokes the server-side user trace event procedure with
    /// (Int, NVarChar(128), VarBinary(8000)) parameter binding.
    async fn raise_trace_event(
        &mut self,
        event_id: i32,
        info: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Closes the connection, releasing it back to the driver's pool when one
    /// exists. Never fails; close errors are swallowed by implementations.
    async fn close(&mut self);

    /// Purges the process-global driver pool entry backing this connection,
    /// then closes it without returning it to the pool, swallowing errors.
    /// Safe to call from any worker.
    async fn clear_pool(&mut self);
}

/// Factory for [`SqlConnection`]s.
#[async_trait]
pub trait SqlDriver: Send + Sync {
    /// Opens a connection to `database` identifying as `app_name`.
    async fn open(
        &self,
        info: &ConnectionInfo,
        app_name: &str,
        database: &str,
    ) -> Result<Box<dyn SqlConnection>, DriverError>;
}
