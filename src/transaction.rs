use std::sync::Arc;

use crate::error::Error;
use crate::governor::ServerlessMysql;
use crate::query::{ExecContext, RollbackFn};
use crate::value::{ResultSet, Statement, Value};
use crate::Client;

type QueryThunk = Box<dyn Fn(Option<&ResultSet>, &[ResultSet]) -> Statement + Send + Sync>;

/// Accumulator of deferred statements executed in order inside a
/// transaction. Statement producers see the previous result and all
/// results so far, so later steps can depend on earlier ones.
///
/// Any step failing (after its own retries) triggers a best-effort
/// `ROLLBACK` plus the registered rollback callback before the error
/// propagates out of `commit()`.
pub struct Transaction<M: Client> {
    db: ServerlessMysql<M>,
    queries: Vec<QueryThunk>,
    rollback: RollbackFn,
}

impl<M: Client> Transaction<M> {
    pub(crate) fn new(db: ServerlessMysql<M>) -> Self {
        Self {
            db,
            queries: Vec::new(),
            rollback: Arc::new(|_err| {}),
        }
    }

    /// Queue a literal statement.
    pub fn query(self, sql: &str, params: &[Value]) -> Self {
        let stmt = Statement::new(sql).with_params(params.to_vec());
        self.query_fn(move |_, _| stmt.clone())
    }

    /// Queue a statement producer invoked with
    /// `(previous_result, all_results_so_far)` at commit time.
    pub fn query_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&ResultSet>, &[ResultSet]) -> Statement + Send + Sync + 'static,
    {
        self.queries.push(Box::new(f));
        self
    }

    /// Register the rollback callback, replacing any previous one.
    pub fn rollback<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.rollback = Arc::new(f);
        self
    }

    /// Run the queued statements inside a transaction and return their
    /// results in order.
    pub async fn commit(self) -> Result<Vec<ResultSet>, Error> {
        let mut results: Vec<ResultSet> = Vec::with_capacity(self.queries.len());
        self.db.query("START TRANSACTION", &[]).await?;
        let ctx = ExecContext::with_rollback(self.rollback.clone());
        for thunk in &self.queries {
            let stmt = thunk(results.last(), &results);
            let result = self.db.run(&stmt, &ctx).await?;
            results.push(result);
        }
        self.db.query("COMMIT", &[]).await?;
        Ok(results)
    }
}
