//! Process-wide table of in-flight connections
//!
//! Bookkeeping only: routing never consults it. Entries are added when a
//! connection's subprocess is spawned and removed exactly once in the
//! bridge's cleanup path, so an empty registry at shutdown means no
//! subprocess outlived its connection.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Interval for polling the drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// One active streaming connection
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique per-connection identifier
    pub id: Uuid,
    /// Direct peer address of the client
    pub client_addr: SocketAddr,
    /// Authenticated identity, absent when auth is disabled
    pub identity: Option<String>,
    /// OS pid of the backing subprocess
    pub pid: Option<u32>,
    /// When the connection was established
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: Uuid,
        client_addr: SocketAddr,
        identity: Option<String>,
        pid: Option<u32>,
    ) -> Self {
        Self {
            id,
            client_addr,
            identity,
            pid,
            started_at: Utc::now(),
        }
    }
}

/// Table of in-flight connections, shared by all connection tasks
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<Uuid, Session>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Entries from independent connections never collide:
    /// ids are generated per connection.
    pub fn register(&self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    /// Remove a session, returning it if it was present
    pub fn unregister(&self, id: Uuid) -> Option<Session> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Number of in-flight connections
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every in-flight session, for accounting and logs
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Wait until every connection has cleaned up, bounded by `timeout`
    ///
    /// Returns true when the registry drained in time.
    pub async fn drained(&self, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while !self.is_empty() {
            if start.elapsed() > timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
        true
    }
}
