use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use crate::config::ConnectionConfig;

/// Current state of the connection governor
#[derive(Debug, Eq, PartialEq)]
pub struct State {
    /// Whether a live session is currently held
    pub connected: bool,
    /// Times the current session was handed back without being closed
    pub reuse_count: u64,
    /// Total session errors observed over the instance lifetime
    pub error_count: u64,
    /// Consecutive connection-establishment retries
    pub retry_count: u32,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ connected: {}, reuse_count: {}, error_count: {}, retry_count: {} }}",
            self.connected, self.reuse_count, self.error_count, self.retry_count
        )
    }
}

/// Mutable connection state behind the governor's lock. `conn == None`
/// is the disconnected marker; a stored session is always fully
/// connected, never partially initialized.
pub(crate) struct ConnState<C> {
    pub conn: Option<C>,
    /// Bumped on every successful connect so stale error watchers cannot
    /// tear down a newer session.
    pub generation: u64,
    pub config: ConnectionConfig,
    pub max_conns: MaxConnsCache,
    pub used_conns: UsedConnsCache,
}

impl<C> ConnState<C> {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: None,
            generation: 0,
            config,
            max_conns: MaxConnsCache::default(),
            used_conns: UsedConnsCache::default(),
        }
    }
}

/// Time-boxed memo of the server's connection ceiling.
/// `updated == None` means never refreshed, i.e. always stale.
#[derive(Clone, Debug, Default)]
pub(crate) struct MaxConnsCache {
    pub total: u64,
    pub user_limit: bool,
    pub updated: Option<Instant>,
}

impl MaxConnsCache {
    pub fn fresh(&self, ttl: Duration) -> bool {
        self.updated.map(|at| at.elapsed() <= ttl).unwrap_or(false)
    }
}

/// Time-boxed memo of current connection usage: session count and the
/// longest idle time among this user's sleeping sessions (seconds).
#[derive(Clone, Debug, Default)]
pub(crate) struct UsedConnsCache {
    pub total: u64,
    pub max_age: u64,
    pub updated: Option<Instant>,
}

impl UsedConnsCache {
    pub fn fresh(&self, ttl: Duration) -> bool {
        self.updated.map(|at| at.elapsed() <= ttl).unwrap_or(false)
    }
}
