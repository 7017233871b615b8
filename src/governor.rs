use dark_std::sync::AtomicDuration;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::{ConnectionConfig, Settings};
use crate::error::{DriverError, Error};
use crate::state::{ConnState, MaxConnsCache, State, UsedConnsCache};
use crate::transaction::Transaction;
use crate::value::Value;
use crate::{Client, Connection};

const MAX_CONNS_SQL: &str = "SELECT IF(@@max_user_connections > 0, \
    LEAST(@@max_user_connections,@@max_connections), \
    @@max_connections) AS total, \
    IF(@@max_user_connections > 0,true,false) AS userLimit";

const USED_CONNS_SQL: &str = "SELECT COUNT(ID) as total, MAX(time) as max_age \
    FROM information_schema.processlist \
    WHERE (user = ? AND @@max_user_connections > 0) OR true";

const ZOMBIES_SQL: &str = "SELECT ID,time FROM information_schema.processlist \
    WHERE command = 'Sleep' AND time >= ? AND user = ? \
    ORDER BY time DESC";

/// Governor for a single lazily-established MySQL session.
///
/// Holds at most one connection at a time, reconnecting with jittered
/// backoff on capacity errors and recycling server-side zombies on
/// `end()`. Clones share the same session and counters.
pub struct ServerlessMysql<M: Client> {
    pub(crate) client: Arc<M>,
    pub(crate) settings: Settings,
    pub(crate) inner: Arc<Mutex<ConnState<M::Conn>>>,
    pub(crate) counter: Arc<AtomicU64>,
    pub(crate) errors: Arc<AtomicU64>,
    pub(crate) retries: Arc<AtomicU32>,
    pub(crate) connected: Arc<AtomicBool>,
    //default per-statement timeout, none unless set
    pub statement_timeout: Arc<AtomicDuration>,
}

impl<M: Client> Debug for ServerlessMysql<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.state(), f)
    }
}

impl<M: Client> Clone for ServerlessMysql<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            settings: self.settings.clone(),
            inner: self.inner.clone(),
            counter: self.counter.clone(),
            errors: self.errors.clone(),
            retries: self.retries.clone(),
            connected: self.connected.clone(),
            statement_timeout: self.statement_timeout.clone(),
        }
    }
}

impl<M: Client> ServerlessMysql<M> {
    pub fn new(client: M, settings: Settings) -> Self {
        let config = settings.connection.clone();
        Self {
            client: Arc::new(client),
            settings,
            inner: Arc::new(Mutex::new(ConnState::new(config))),
            counter: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            retries: Arc::new(AtomicU32::new(0)),
            connected: Arc::new(AtomicBool::new(false)),
            statement_timeout: Arc::new(AtomicDuration::new(None)),
        }
    }

    /// Establish the session if none is held, retrying capacity errors
    /// with jittered backoff up to the configured budget.
    pub async fn connect(&self) -> Result<(), Error> {
        self.connect_wait(0).await
    }

    /// `connect` with an explicit wait hint, fed to the decorrelated and
    /// custom strategies as the previous delay.
    pub async fn connect_wait(&self, mut wait: u64) -> Result<(), Error> {
        loop {
            let err = match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let retries = self.retries.load(Ordering::SeqCst);
            if err.is_capacity() && retries < self.settings.max_retries {
                let retries = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
                let sleep = self
                    .settings
                    .backoff
                    .delay(self.settings.base, self.settings.cap, retries, wait);
                tracing::trace!(
                    code = %err.code,
                    retries,
                    delay_ms = sleep,
                    "connection capacity error, backing off"
                );
                self.settings
                    .hooks
                    .on_retry(&err, retries, sleep, self.settings.backoff.name());
                self.settings
                    .sleeper
                    .sleep(Duration::from_millis(sleep))
                    .await;
                wait = sleep;
            } else {
                self.settings.hooks.on_connect_error(&err);
                return Err(Error::ConnectionEstablish {
                    attempts: retries + 1,
                    source: err,
                });
            }
        }
    }

    /// Single connection attempt. Idempotent when a session is already
    /// held. The state lock is held across the attempt, so concurrent
    /// callers cannot start a second physical connection.
    async fn try_connect(&self) -> Result<(), DriverError> {
        let mut st = self.inner.lock().await;
        if st.conn.is_some() {
            return Ok(());
        }
        self.counter.store(0, Ordering::SeqCst);
        let conn = self.client.create_connection(&st.config).await?;
        st.generation += 1;
        self.spawn_error_watcher(conn.error_events(), st.generation);
        st.conn = Some(conn);
        self.connected.store(true, Ordering::SeqCst);
        self.retries.store(0, Ordering::SeqCst);
        tracing::debug!("connection established");
        self.settings.hooks.on_connect();
        Ok(())
    }

    /// Drains the session's asynchronous error events. An event tears
    /// down the stored handle (if the generation still matches) without
    /// failing any in-flight future; in-flight queries observe the loss
    /// on their own error paths.
    fn spawn_error_watcher(&self, events: flume::Receiver<DriverError>, generation: u64) {
        let inner = self.inner.clone();
        let errors = self.errors.clone();
        let counter = self.counter.clone();
        let connected = self.connected.clone();
        let hooks = self.settings.hooks.clone();
        tokio::spawn(async move {
            while let Ok(err) = events.recv_async().await {
                errors.fetch_add(1, Ordering::SeqCst);
                {
                    let mut st = inner.lock().await;
                    if st.generation == generation && st.conn.is_some() {
                        st.conn = None;
                        connected.store(false, Ordering::SeqCst);
                        counter.store(0, Ordering::SeqCst);
                    }
                }
                tracing::debug!(code = %err.code, "session error, connection reset");
                hooks.on_error(&err);
            }
        });
    }

    /// End of a unit of work. Consults (cached) server usage and either
    /// reaps idle zombie sessions or closes the held connection.
    pub async fn end(&self) -> Result<(), Error> {
        if !self.settings.manage_conns {
            return Ok(());
        }
        {
            let st = self.inner.lock().await;
            if st.conn.is_none() {
                return Ok(());
            }
        }
        self.counter.fetch_add(1, Ordering::SeqCst);

        let max_conns = self.get_max_connections().await?;
        let used_conns = self.get_used_connections().await?;
        let utilization = if max_conns.total == 0 {
            0.0
        } else {
            used_conns.total as f64 / max_conns.total as f64
        };

        if utilization > self.settings.conn_utilization {
            let timeout = used_conns
                .max_age
                .max(self.settings.zombie_min_timeout)
                .min(self.settings.zombie_max_timeout);
            let killed = if timeout <= used_conns.max_age {
                self.kill_zombie_connections(timeout).await?
            } else {
                0
            };
            // nothing was freed on the server side, so free our own slot
            if killed == 0 {
                tracing::debug!(
                    used = used_conns.total,
                    max = max_conns.total,
                    "over utilization with no reapable zombies, closing"
                );
                self.quit().await;
            }
        } else if used_conns.max_age > self.settings.zombie_max_timeout {
            self.kill_zombie_connections(self.settings.zombie_max_timeout)
                .await?;
        }
        Ok(())
    }

    /// Unconditionally close the held session. Idempotent when
    /// disconnected; the close itself is best-effort.
    pub async fn quit(&self) {
        let conn = {
            let mut st = self.inner.lock().await;
            st.generation += 1;
            st.conn.take()
        };
        if let Some(mut conn) = conn {
            let _ = conn.end().await;
            self.counter.store(0, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            tracing::debug!("connection closed");
            self.settings.hooks.on_close();
        }
    }

    pub(crate) async fn get_max_connections(&self) -> Result<MaxConnsCache, Error> {
        let ttl = Duration::from_millis(self.settings.max_conns_freq);
        {
            let st = self.inner.lock().await;
            if st.max_conns.fresh(ttl) {
                return Ok(st.max_conns.clone());
            }
        }
        let results = self.query(MAX_CONNS_SQL, &[]).await?;
        let row = results.first();
        let cache = MaxConnsCache {
            total: row
                .and_then(|r| r.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            user_limit: row
                .and_then(|r| r.get("userLimit"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            updated: Some(Instant::now()),
        };
        let mut st = self.inner.lock().await;
        st.max_conns = cache.clone();
        Ok(cache)
    }

    pub(crate) async fn get_used_connections(&self) -> Result<UsedConnsCache, Error> {
        let ttl = Duration::from_millis(self.settings.used_conns_freq);
        let user = {
            let st = self.inner.lock().await;
            if st.used_conns.fresh(ttl) {
                return Ok(st.used_conns.clone());
            }
            st.config.user.clone()
        };
        let results = self.query(USED_CONNS_SQL, &[Value::from(user)]).await?;
        let row = results.first();
        let cache = UsedConnsCache {
            total: row
                .and_then(|r| r.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            max_age: row
                .and_then(|r| r.get("max_age"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            updated: Some(Instant::now()),
        };
        let mut st = self.inner.lock().await;
        st.used_conns = cache.clone();
        Ok(cache)
    }

    /// Kill this user's sleeping sessions idle for at least
    /// `timeout_secs`. Per-session failures are reported through
    /// `on_kill_error` and do not abort the batch.
    pub(crate) async fn kill_zombie_connections(&self, timeout_secs: u64) -> Result<u64, Error> {
        let user = { self.inner.lock().await.config.user.clone() };
        let zombies = self
            .query(ZOMBIES_SQL, &[Value::from(timeout_secs), Value::from(user)])
            .await?;
        let mut killed = 0u64;
        for zombie in zombies.iter() {
            let Some(id) = zombie.get("ID").and_then(Value::as_u64) else {
                continue;
            };
            let idle = zombie.get("time").and_then(Value::as_u64).unwrap_or(0);
            match self.query("KILL ?", &[Value::from(id)]).await {
                Ok(_) => {
                    tracing::debug!(thread = id, idle, "killed zombie connection");
                    self.settings.hooks.on_kill(id, idle);
                    killed += 1;
                }
                Err(err) => self.settings.hooks.on_kill_error(&err),
            }
        }
        Ok(killed)
    }

    /// Start building a transaction executed on `commit()`.
    pub fn transaction(&self) -> Transaction<M> {
        Transaction::new(self.clone())
    }

    /// Merge a partial config into the live connection parameters and
    /// return the result. Applies to the next established session.
    pub async fn config(&self, patch: ConnectionConfig) -> ConnectionConfig {
        let mut st = self.inner.lock().await;
        st.config.merge(patch);
        st.config.clone()
    }

    /// `config` from a data source string.
    pub async fn config_dsn(&self, dsn: &str) -> Result<ConnectionConfig, Error> {
        let patch = ConnectionConfig::from_dsn(dsn)?;
        Ok(self.config(patch).await)
    }

    pub async fn get_config(&self) -> ConnectionConfig {
        self.inner.lock().await.config.clone()
    }

    pub fn state(&self) -> State {
        State {
            connected: self.connected.load(Ordering::SeqCst),
            reuse_count: self.counter.load(Ordering::SeqCst),
            error_count: self.errors.load(Ordering::SeqCst),
            retry_count: self.retries.load(Ordering::SeqCst),
        }
    }

    /// Times the current session has been handed back via `end()`.
    pub fn get_counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Total session errors observed over the instance lifetime.
    pub fn get_error_count(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn client(&self) -> &M {
        &self.client
    }

    /// Set the default per-statement timeout, applied when a statement
    /// carries none of its own.
    pub fn set_statement_timeout(&self, timeout: Option<Duration>) {
        self.statement_timeout.store(timeout);
    }

    pub fn get_statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout.get()
    }
}
