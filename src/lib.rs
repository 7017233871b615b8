pub mod backoff;
pub mod config;
mod dsn;
pub mod error;
pub mod escape;
pub mod governor;
pub mod query;
pub mod state;
pub mod transaction;
pub mod value;

pub use backoff::Backoff;
pub use config::{ConnectionConfig, Hooks, NoopHooks, Settings, Sleeper, TokioSleeper};
pub use error::{DriverError, Error};
pub use governor::ServerlessMysql;
pub use query::ExecContext;
pub use state::State;
pub use transaction::Transaction;
pub use value::{ResultSet, Row, Statement, Value};

use async_trait::async_trait;

/// Client create Connection and expose escaping helpers
#[async_trait]
pub trait Client: Send + Sync + 'static {
    type Conn: Connection;

    /// create a Connection, fully connected and ready for queries
    async fn create_connection(&self, config: &ConnectionConfig)
        -> Result<Self::Conn, DriverError>;

    fn escape(&self, value: &Value) -> String {
        escape::escape(value)
    }

    fn escape_id(&self, identifier: &str) -> String {
        escape::escape_id(identifier)
    }

    fn format(&self, sql: &str, params: &[Value]) -> String {
        escape::format(sql, params)
    }
}

/// A live session exclusively owned by the governor
#[async_trait]
pub trait Connection: Send + 'static {
    async fn query(&mut self, stmt: &Statement) -> Result<ResultSet, DriverError>;

    async fn change_user(&mut self, config: &ConnectionConfig) -> Result<(), DriverError>;

    /// graceful close
    async fn end(&mut self) -> Result<(), DriverError>;

    /// forced socket teardown, no goodbye packet
    fn destroy(&mut self);

    /// asynchronous session errors (connection dropped by the server etc.)
    /// The default is a closed channel for sessions with no error source.
    fn error_events(&self) -> flume::Receiver<DriverError> {
        flume::unbounded::<DriverError>().1
    }
}
