#![allow(dead_code)]

use async_trait::async_trait;
use futures_core::future::BoxFuture;
use serverless_mysql::{
    Client, Connection, ConnectionConfig, DriverError, Error, Hooks, ResultSet, Sleeper, Statement,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type QueryHandler = Arc<dyn Fn(&Statement) -> Result<ResultSet, DriverError> + Send + Sync>;

pub fn err(code: &str) -> DriverError {
    DriverError::new(code, code)
}

pub struct StubInner {
    pub connects: AtomicU64,
    pub connect_failures: Mutex<VecDeque<DriverError>>,
    pub always_fail_connect: Mutex<Option<DriverError>>,
    pub handler: Mutex<QueryHandler>,
    pub log: Mutex<Vec<Statement>>,
    pub query_delay: Mutex<Option<Duration>>,
    pub destroyed: AtomicU64,
    pub ended: AtomicU64,
    pub change_users: AtomicU64,
    pub change_user_error: Mutex<Option<DriverError>>,
    pub error_tx: Mutex<Option<flume::Sender<DriverError>>>,
}

/// Scripted in-memory client. Connections share the client's handler and
/// log, so a test can steer every query outcome and inspect the SQL that
/// reached the wire.
#[derive(Clone)]
pub struct StubClient(pub Arc<StubInner>);

impl StubClient {
    pub fn new() -> Self {
        Self::with_handler(|_stmt| Ok(ResultSet::default()))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Statement) -> Result<ResultSet, DriverError> + Send + Sync + 'static,
    {
        Self(Arc::new(StubInner {
            connects: AtomicU64::new(0),
            connect_failures: Mutex::new(VecDeque::new()),
            always_fail_connect: Mutex::new(None),
            handler: Mutex::new(Arc::new(handler)),
            log: Mutex::new(Vec::new()),
            query_delay: Mutex::new(None),
            destroyed: AtomicU64::new(0),
            ended: AtomicU64::new(0),
            change_users: AtomicU64::new(0),
            change_user_error: Mutex::new(None),
            error_tx: Mutex::new(None),
        }))
    }

    pub fn connects(&self) -> u64 {
        self.0.connects.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> u64 {
        self.0.destroyed.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> u64 {
        self.0.ended.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.0.log.lock().unwrap().clone()
    }

    pub fn sql_log(&self) -> Vec<String> {
        self.0
            .log
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Every subsequent connect attempt fails with this code.
    pub fn fail_connects_with(&self, code: &str) {
        *self.0.always_fail_connect.lock().unwrap() = Some(err(code));
    }

    /// Fail the next connect attempt (queued, first in first out).
    pub fn push_connect_failure(&self, code: &str) {
        self.0.connect_failures.lock().unwrap().push_back(err(code));
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.0.query_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_change_user_with(&self, code: &str) {
        *self.0.change_user_error.lock().unwrap() = Some(err(code));
    }

    /// Emit an asynchronous session error on the currently open
    /// connection, as the server dropping it would.
    pub fn raise_session_error(&self, code: &str) {
        if let Some(tx) = self.0.error_tx.lock().unwrap().as_ref() {
            let _ = tx.send(err(code));
        }
    }
}

#[async_trait]
impl Client for StubClient {
    type Conn = StubConn;

    async fn create_connection(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<StubConn, DriverError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.0.connect_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        if let Some(e) = self.0.always_fail_connect.lock().unwrap().clone() {
            return Err(e);
        }
        let (tx, rx) = flume::unbounded();
        *self.0.error_tx.lock().unwrap() = Some(tx);
        Ok(StubConn {
            inner: self.0.clone(),
            events: rx,
        })
    }
}

pub struct StubConn {
    inner: Arc<StubInner>,
    events: flume::Receiver<DriverError>,
}

#[async_trait]
impl Connection for StubConn {
    async fn query(&mut self, stmt: &Statement) -> Result<ResultSet, DriverError> {
        let delay = *self.inner.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.log.lock().unwrap().push(stmt.clone());
        let handler = self.inner.handler.lock().unwrap().clone();
        handler(stmt)
    }

    async fn change_user(&mut self, _config: &ConnectionConfig) -> Result<(), DriverError> {
        self.inner.change_users.fetch_add(1, Ordering::SeqCst);
        match self.inner.change_user_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn end(&mut self) -> Result<(), DriverError> {
        self.inner.ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&mut self) {
        self.inner.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn error_events(&self) -> flume::Receiver<DriverError> {
        self.events.clone()
    }
}

/// Sleeper that returns immediately, so retry loops run without
/// wall-clock delays.
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _dur: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Hooks implementation that records every event for assertions.
#[derive(Default)]
pub struct RecordingHooks {
    pub connects: AtomicU64,
    pub connect_errors: AtomicU64,
    pub closes: AtomicU64,
    pub session_errors: AtomicU64,
    pub kill_errors: AtomicU64,
    pub retries: Mutex<Vec<(String, u32, u64, String)>>,
    pub kills: Mutex<Vec<(u64, u64)>>,
    pub query_retries: Mutex<Vec<(String, u32, u64, String)>>,
}

impl Hooks for RecordingHooks {
    fn on_connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connect_error(&self, _err: &DriverError) {
        self.connect_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_retry(&self, err: &DriverError, retries: u32, delay_ms: u64, strategy: &str) {
        self.retries.lock().unwrap().push((
            err.code.clone(),
            retries,
            delay_ms,
            strategy.to_string(),
        ));
    }

    fn on_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _err: &DriverError) {
        self.session_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_kill(&self, thread_id: u64, idle_secs: u64) {
        self.kills.lock().unwrap().push((thread_id, idle_secs));
    }

    fn on_kill_error(&self, _err: &Error) {
        self.kill_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_query_retry(&self, err: &DriverError, retries: u32, delay_ms: u64, strategy: &str) {
        self.query_retries.lock().unwrap().push((
            err.code.clone(),
            retries,
            delay_ms,
            strategy.to_string(),
        ));
    }
}
