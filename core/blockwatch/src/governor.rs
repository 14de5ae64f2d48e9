//! Engine-wide limit on the requests in flight.
//!
//! Blocking queries keep their connection open for a long time, and the transport usually
//! limits the number of simultaneous connections per host. The [`ConnectionGovernor`] keeps
//! track of every request in flight and enforces a ceiling: when a new request arrives and the
//! ceiling is reached, an older connection is aborted with [`STATUS_PREEMPTED`] to make room.
//!
//! The governor also pauses everything while the host is hidden, see [`ConnectionGovernor::set_visibility`].

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{STATUS_HIDDEN, STATUS_PREEMPTED};

/// Request or response headers. Keys are lowercase.
pub type Headers = FxHashMap<String, String>;

/// Identifies the resource requested by a connection (the cache key of its source).
pub const REQUEST_ID: &str = "x-request-id";
pub const CONTENT_TYPE: &str = "content-type";
/// Content type of blocking requests.
pub const EVENT_STREAM: &str = "text/event-stream";
/// Content type of one-shot requests.
pub const JSON: &str = "application/json";
/// Response header that carries the cursor.
pub const CURSOR_HEADER: &str = "x-consul-index";

/// A request in flight, as seen by the governor.
pub trait Connection: Send + Sync + 'static {
    fn headers(&self) -> &Headers;

    /// Aborts the request. The party that awaits the request observes the given status.
    fn abort(&self, status: i32);
}

/// Connection of a request made by the engine.
///
/// The request is raced against [`aborted`](Self::aborted): when the governor aborts the connection,
/// the request future is dropped.
#[derive(Debug)]
pub struct InflightRequest {
    headers: Headers,
    token: CancellationToken,
    status: AtomicI32,
}

impl InflightRequest {
    pub fn new(headers: Headers) -> Self {
        Self {
            headers,
            token: CancellationToken::new(),
            status: AtomicI32::new(0),
        }
    }

    /// Waits for the connection to be aborted, and returns the abort status.
    pub async fn aborted(&self) -> i32 {
        self.token.cancelled().await;
        self.status.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Connection for InflightRequest {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn abort(&self, status: i32) {
        // the first abort wins
        if !self.token.is_cancelled() {
            self.status.store(status, Ordering::Release);
            self.token.cancel();
        }
    }
}

/// Identifies a connection admitted by [`ConnectionGovernor::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Visibility of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Reports the requests that nobody is interested in anymore.
pub trait ClosedRequests: Send + Sync {
    /// Returns the request ids (cache keys) whose connection can be reclaimed.
    fn closed_keys(&self) -> Vec<String>;
}

pub struct ConnectionGovernor {
    max_connections: usize,
    /// Live connections, oldest first.
    live: Mutex<Live>,
    visibility: watch::Sender<Visibility>,
    /// Notified when a connection leaves the set.
    vacancy: Notify,
    closed_requests: OnceLock<Weak<dyn ClosedRequests>>,
}

#[derive(Default)]
struct Live {
    next_id: u64,
    connections: IndexMap<ConnectionId, Arc<dyn Connection>>,
}

impl ConnectionGovernor {
    /// Creates a governor that admits at most `max_connections` connections at the same time.
    ///
    /// A ceiling of 0 is treated as 1.
    pub fn new(max_connections: usize) -> Self {
        let (visibility, _) = watch::channel(Visibility::Visible);
        Self {
            max_connections: max_connections.max(1),
            live: Mutex::new(Live::default()),
            visibility,
            vacancy: Notify::new(),
            closed_requests: OnceLock::new(),
        }
    }

    /// Sets the source of reclaimable requests. Can only be set once.
    pub fn set_closed_requests(&self, closed: Weak<dyn ClosedRequests>) {
        if self.closed_requests.set(closed).is_err() {
            log::warn!("the closed requests of the governor have already been set, ignoring");
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.live.lock().unwrap().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admits a new connection.
    ///
    /// If the ceiling is reached, a victim is chosen among the live connections: the oldest one whose
    /// request has been closed, or else the oldest one. The victim is removed from the set, then aborted
    /// with [`STATUS_PREEMPTED`].
    ///
    /// While the host is hidden, the connection is not admitted: it is aborted at once with [`STATUS_HIDDEN`].
    pub fn acquire(&self, connection: Arc<dyn Connection>) -> ConnectionId {
        // Query the closed requests before locking: the cache has its own lock.
        let closed: FxHashSet<String> = self
            .closed_requests
            .get()
            .and_then(Weak::upgrade)
            .map(|c| c.closed_keys().into_iter().collect())
            .unwrap_or_default();

        let mut victims = Vec::new();
        let id = {
            let mut live = self.live.lock().unwrap();
            let id = ConnectionId(live.next_id);
            live.next_id += 1;
            // set_visibility purges under this lock, after publishing the new visibility
            if self.visibility() == Visibility::Hidden {
                drop(live);
                log::debug!("host hidden, refusing request {:?}", connection.headers().get(REQUEST_ID));
                connection.abort(STATUS_HIDDEN);
                return id;
            }
            while live.connections.len() >= self.max_connections {
                let reclaimable = live.connections.iter().position(|(_, c)| {
                    c.headers()
                        .get(REQUEST_ID)
                        .is_some_and(|key| closed.contains(key))
                });
                let index = reclaimable.unwrap_or(0);
                match live.connections.shift_remove_index(index) {
                    Some((_, c)) => victims.push(c),
                    None => break,
                }
            }
            live.connections.insert(id, connection);
            id
        };

        for victim in victims {
            log::debug!(
                "connection limit ({}) reached, evicting request {:?}",
                self.max_connections,
                victim.headers().get(REQUEST_ID)
            );
            victim.abort(STATUS_PREEMPTED);
        }
        id
    }

    /// Admits a connection like [`acquire`](Self::acquire), and releases it when the guard is dropped.
    pub fn admit(&self, connection: Arc<dyn Connection>) -> ConnectionGuard<'_> {
        let id = self.acquire(connection);
        ConnectionGuard { governor: self, id }
    }

    /// Removes a connection that has completed. Does nothing if it has already been removed.
    pub fn release(&self, id: ConnectionId) {
        let removed = self.live.lock().unwrap().connections.shift_remove(&id).is_some();
        if removed {
            self.vacancy.notify_waiters();
        }
    }

    /// Aborts every live connection with the given status.
    pub fn purge(&self, status: i32) {
        let connections: Vec<_> = {
            let mut live = self.live.lock().unwrap();
            live.connections.drain(..).map(|(_, c)| c).collect()
        };
        if !connections.is_empty() {
            log::debug!("aborting {} connection(s) with status {status}", connections.len());
        }
        for c in connections {
            c.abort(status);
        }
        self.vacancy.notify_waiters();
    }

    /// Changes the visibility of the host.
    ///
    /// Hiding the host aborts every connection with [`STATUS_HIDDEN`]. The sources wait for
    /// [`when_available`](Self::when_available) before making new requests.
    pub fn set_visibility(&self, visibility: Visibility) {
        let previous = self.visibility.send_replace(visibility);
        if previous != visibility {
            log::info!("host visibility: {previous:?} -> {visibility:?}");
            if visibility == Visibility::Hidden {
                self.purge(STATUS_HIDDEN);
            }
        }
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility.borrow()
    }

    /// Waits until the host is visible. Returns immediately if it already is.
    pub async fn when_available(&self) {
        let mut rx = self.visibility.subscribe();
        // the sender lives as long as `self`, this cannot fail
        let _ = rx.wait_for(|v| *v == Visibility::Visible).await;
    }

    /// Waits until the number of live connections is below the ceiling.
    pub async fn when_vacant(&self) {
        loop {
            let notified = self.vacancy.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() < self.max_connections {
                return;
            }
            notified.await;
        }
    }
}

/// Connection admitted by [`ConnectionGovernor::admit`], released on drop.
///
/// The slot is given back even if the request future is dropped or panics.
#[must_use = "the connection is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ConnectionGuard<'a> {
    governor: &'a ConnectionGovernor,
    id: ConnectionId,
}

impl ConnectionGuard<'_> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.governor.release(self.id);
    }
}

impl std::fmt::Debug for ConnectionGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGovernor")
            .field("max_connections", &self.max_connections)
            .field("live", &self.len())
            .field("visibility", &self.visibility())
            .finish()
    }
}
