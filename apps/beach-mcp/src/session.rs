use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    controller::{CloseHook, CloseReason, Session},
    dispatch::Dispatcher,
    event_store::EventStore,
};

pub const DEFAULT_CHANNEL_DEPTH: usize = 64;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Protocol revisions accepted by default, oldest first.
pub const DEFAULT_PROTOCOL_VERSIONS: [&str; 3] = ["2024-11-05", "2025-03-26", "2025-06-18"];

/// Opaque, unguessable session identifier handed out on `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Oldest first; the last entry is offered when negotiation fails.
    pub protocol_versions: Vec<String>,
    pub push_channel_depth: usize,
    /// `None` disables idle reaping.
    pub idle_timeout: Option<Duration>,
    pub reap_interval: Duration,
    pub server_name: String,
    pub server_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_versions: DEFAULT_PROTOCOL_VERSIONS
                .iter()
                .map(|version| version.to_string())
                .collect(),
            push_channel_depth: DEFAULT_CHANNEL_DEPTH,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            reap_interval: DEFAULT_REAP_INTERVAL,
            server_name: env!("CARGO_PKG_NAME").to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl SessionConfig {
    pub fn supports_protocol_version(&self, version: &str) -> bool {
        self.protocol_versions.iter().any(|known| known == version)
    }

    pub fn latest_protocol_version(&self) -> &str {
        self.protocol_versions
            .last()
            .map(String::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSIONS[DEFAULT_PROTOCOL_VERSIONS.len() - 1])
    }
}

/// Concurrent map of live sessions. Cloning is cheap and shares the table.
#[derive(Clone)]
pub struct SessionTable {
    inner: Arc<SessionTableInner>,
}

struct SessionTableInner {
    sessions: DashMap<SessionId, Arc<Session>>,
    events: Arc<dyn EventStore>,
    dispatcher: Arc<dyn Dispatcher>,
    config: Arc<SessionConfig>,
}

impl SessionTableInner {
    fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            gauge!("beach_mcp_sessions_active", self.sessions.len() as f64);
        }
        removed
    }
}

impl SessionTable {
    pub fn new(
        config: SessionConfig,
        events: Arc<dyn EventStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionTableInner {
                sessions: DashMap::new(),
                events,
                dispatcher,
                config: Arc::new(config),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.inner.events
    }

    /// Registers a fresh `Uninitialized` session under a new unique id.
    /// The session stays invisible to [`SessionTable::get`] until it is
    /// initialized, and removes itself from the table when it closes.
    pub fn create(&self) -> Arc<Session> {
        loop {
            let id = SessionId::generate();
            match self.inner.sessions.entry(id.clone()) {
                Entry::Occupied(_) => {
                    warn!(session_id = %id, "session id collision; regenerating");
                }
                Entry::Vacant(slot) => {
                    let session = Session::new(
                        id.clone(),
                        Arc::clone(&self.inner.config),
                        Arc::clone(&self.inner.events),
                        Arc::clone(&self.inner.dispatcher),
                        self.close_hook(),
                    );
                    slot.insert(Arc::clone(&session));
                    counter!("beach_mcp_sessions_created_total", 1);
                    gauge!("beach_mcp_sessions_active", self.inner.sessions.len() as f64);
                    debug!(session_id = %id, "session registered");
                    return session;
                }
            }
        }
    }

    fn close_hook(&self) -> CloseHook {
        let table = Arc::downgrade(&self.inner);
        Box::new(move |id, reason| {
            if let Some(table) = table.upgrade() {
                if table.remove(id) {
                    debug!(
                        session_id = %id,
                        reason = reason.metric_label(),
                        "session unregistered"
                    );
                }
            }
        })
    }

    /// Looks up an active session. Sessions still being initialized, or
    /// already closed, are reported as absent.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| session.is_active())
    }

    /// Drops the table entry without touching the session's state.
    pub fn remove(&self, id: &SessionId) -> bool {
        self.inner.remove(id)
    }

    /// Closes an active session on client request. `false` if there was no
    /// active session to close, including when a concurrent call won.
    pub fn terminate(&self, id: &SessionId) -> bool {
        match self.get(id) {
            Some(session) => session.close(CloseReason::Terminated),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Closes every active session that has had no traffic and no listener
    /// for at least the configured idle timeout.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let Some(timeout) = self.inner.config.idle_timeout else {
            return 0;
        };

        let mut reaped = 0usize;
        for session in self.snapshot() {
            let Some(idle) = session.idle_for(now) else {
                continue;
            };
            if idle >= timeout && session.close(CloseReason::IdleTimeout) {
                info!(
                    session_id = %session.id(),
                    idle_secs = idle.as_secs(),
                    "reaped idle session"
                );
                reaped += 1;
            }
        }
        reaped
    }

    pub fn spawn_reaper(&self) -> Option<JoinHandle<()>> {
        self.inner.config.idle_timeout?;
        let table = self.clone();
        let period = self.inner.config.reap_interval;
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let reaped = table.reap_idle(Instant::now());
                if reaped > 0 {
                    debug!(reaped, remaining = table.len(), "idle sweep complete");
                }
            }
        }))
    }

    /// Closes every session; used on shutdown so open streams end.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|session| session.close(reason))
            .count()
    }
}
