use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::error::{DriverError, Error};
use crate::governor::ServerlessMysql;
use crate::value::{ResultSet, Statement, Value};
use crate::{Client, Connection};

pub(crate) type RollbackFn = Arc<dyn Fn(&Error) + Send + Sync>;

/// Execution context threaded through query calls. Carries the rollback
/// callback when the statement runs inside a transaction; plain calls
/// use the default empty context.
#[derive(Clone, Default)]
pub struct ExecContext {
    pub(crate) rollback: Option<RollbackFn>,
}

impl ExecContext {
    pub(crate) fn with_rollback(rollback: RollbackFn) -> Self {
        Self {
            rollback: Some(rollback),
        }
    }
}

/// One statement attempt against the held session.
enum Issue {
    /// The session vanished between ensure and issue.
    NotConnected,
    Done(Result<ResultSet, DriverError>),
}

impl<M: Client> ServerlessMysql<M> {
    /// Run a statement, establishing the connection first if needed.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<ResultSet, Error> {
        self.execute(Statement::new(sql).with_params(params.to_vec()))
            .await
    }

    /// Run a pre-built statement (carrying params and optional timeout).
    pub async fn execute(&self, stmt: Statement) -> Result<ResultSet, Error> {
        self.run(&stmt, &ExecContext::default()).await
    }

    pub(crate) async fn run(&self, stmt: &Statement, ctx: &ExecContext) -> Result<ResultSet, Error> {
        // transaction thunks may produce an empty probe statement; it
        // must not touch the connection
        if ctx.rollback.is_some() && stmt.sql.is_empty() {
            return Ok(ResultSet::default());
        }

        let replay_budget = self.settings.max_retries.max(1);
        let mut replays = 0u32;
        let mut query_retries = 0u32;
        let mut prev_wait = 0u64;

        loop {
            self.connect().await?;
            let result = match self.issue(stmt).await {
                Issue::NotConnected => {
                    if replays >= replay_budget {
                        let lost = DriverError::new(
                            "PROTOCOL_CONNECTION_LOST",
                            "connection lost before the statement was issued",
                        );
                        return Err(self.query_error(lost, stmt));
                    }
                    replays += 1;
                    continue;
                }
                Issue::Done(result) => result,
            };

            let err = match result {
                Ok(mut results) => {
                    if self.settings.return_final_sql {
                        results.sql = Some(self.client.format(&stmt.sql, &stmt.params));
                    }
                    return Ok(results);
                }
                Err(err) => err,
            };

            if err.is_sequence_timeout() {
                // socket already destroyed in issue()
                return Err(self.query_error(err, stmt));
            }
            if err.is_connection_lost() {
                if replays >= replay_budget {
                    return Err(self.query_error(err, stmt));
                }
                replays += 1;
                tracing::trace!(code = %err.code, replays, "replaying statement after connection loss");
                continue;
            }
            if err.is_retryable_query() && query_retries < self.settings.max_query_retries {
                query_retries += 1;
                let sleep = self.settings.query_retry_backoff.delay(
                    self.settings.base,
                    self.settings.cap,
                    query_retries,
                    prev_wait,
                );
                tracing::trace!(
                    code = %err.code,
                    retry = query_retries,
                    delay_ms = sleep,
                    "transient query error, backing off"
                );
                self.settings.hooks.on_query_retry(
                    &err,
                    query_retries,
                    sleep,
                    self.settings.query_retry_backoff.name(),
                );
                self.settings
                    .sleeper
                    .sleep(Duration::from_millis(sleep))
                    .await;
                prev_wait = sleep;
                continue;
            }

            let err = self.query_error(err, stmt);
            if let Some(rollback) = &ctx.rollback {
                self.rollback_probe().await;
                rollback(&err);
            }
            return Err(err);
        }
    }

    /// Issue the statement once against the held session, applying the
    /// statement (or default) timeout. Connection-state fallout of the
    /// failure classes is handled here, under the lock.
    async fn issue(&self, stmt: &Statement) -> Issue {
        let mut st = self.inner.lock().await;
        let Some(conn) = st.conn.as_mut() else {
            return Issue::NotConnected;
        };
        let timeout = stmt.timeout.or_else(|| self.statement_timeout.get());
        let result = match timeout {
            Some(t) => match tokio::time::timeout(t, conn.query(stmt)).await {
                Ok(result) => result,
                Err(_) => Err(DriverError::new(
                    "PROTOCOL_SEQUENCE_TIMEOUT",
                    format!("statement exceeded {}ms timeout", t.as_millis()),
                )),
            },
            None => conn.query(stmt).await,
        };
        if let Err(err) = &result {
            if err.is_sequence_timeout() {
                if let Some(mut conn) = st.conn.take() {
                    conn.destroy();
                }
                self.connected.store(false, Ordering::SeqCst);
                self.counter.store(0, Ordering::SeqCst);
            } else if err.is_connection_lost() {
                st.conn = None;
                self.connected.store(false, Ordering::SeqCst);
                self.counter.store(0, Ordering::SeqCst);
            }
        }
        Issue::Done(result)
    }

    /// Best-effort `ROLLBACK` issued on the transaction error path. Runs
    /// as a single shot, its own failures discarded.
    async fn rollback_probe(&self) {
        if self.connect().await.is_err() {
            return;
        }
        let _ = self.issue(&Statement::new("ROLLBACK")).await;
    }

    /// Switch the authenticated user of the held session. Connection-loss
    /// failures reset the governor to disconnected before surfacing.
    pub async fn change_user(&self, options: &ConnectionConfig) -> Result<(), Error> {
        self.connect().await?;
        let mut st = self.inner.lock().await;
        let Some(conn) = st.conn.as_mut() else {
            let lost = DriverError::new(
                "PROTOCOL_CONNECTION_LOST",
                "connection lost before changing user",
            );
            return Err(Error::Query {
                source: lost,
                sql: None,
            });
        };
        match conn.change_user(options).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_connection_lost() {
                    st.conn = None;
                    self.connected.store(false, Ordering::SeqCst);
                    self.counter.store(0, Ordering::SeqCst);
                }
                Err(Error::Query {
                    source: err,
                    sql: None,
                })
            }
        }
    }

    fn query_error(&self, source: DriverError, stmt: &Statement) -> Error {
        let sql = self
            .settings
            .return_final_sql
            .then(|| self.client.format(&stmt.sql, &stmt.params));
        Error::Query { source, sql }
    }
}
