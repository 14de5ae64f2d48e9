//! Shared sources, one per resource.
//!
//! The [`SourceCache`] maps each cache key (a normalized URI) to at most one live source,
//! shared by all the consumers of the resource. It counts the consumers attached to each source
//! and closes the source when the last one detaches.
//!
//! When a source closes, its cursor and last event are saved. The next source created for the
//! same key resumes from there: late consumers immediately get the last event, and the first
//! request blocks on the saved cursor instead of fetching everything again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cursor::Cursor;
use crate::error::RouteError;
use crate::governor::ClosedRequests;
use crate::router::{SourceRouter, normalize};
use crate::source::blocking::BlockingSource;
use crate::source::{EventKind, MessageEvent, ReadyState, Source, SourceConfiguration};

/// Opaque handle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerRef(u64);

impl ConsumerRef {
    /// Returns a new, unique consumer reference.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What is left of a source after it has been closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedConfiguration {
    pub cursor: Option<Cursor>,
    pub last_event: Option<MessageEvent>,
}

struct LiveEntry {
    source: BlockingSource,
    refs: FxHashSet<ConsumerRef>,
}

#[derive(Default)]
struct CacheState {
    /// Incremented on reset, so that the sources of the previous generation do not save anything.
    generation: u64,
    live: FxHashMap<String, LiveEntry>,
    /// Saved configurations, least recently detached first.
    saved: IndexMap<String, SavedConfiguration>,
}

pub struct SourceCache {
    router: SourceRouter,
    state: Arc<Mutex<CacheState>>,
    capacity: usize,
}

impl SourceCache {
    /// Creates a cache that keeps at most `capacity` saved configurations.
    pub fn new(router: SourceRouter, capacity: usize) -> Self {
        Self {
            router,
            state: Arc::new(Mutex::new(CacheState::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn router(&self) -> &SourceRouter {
        &self.router
    }

    /// Returns the source of `uri`, creating it if necessary, and attaches `consumer` to it.
    ///
    /// `blocking` only applies to a new source: an existing source is shared as is.
    pub fn open(&self, uri: &str, consumer: ConsumerRef, blocking: bool) -> Result<BlockingSource, RouteError> {
        let key = normalize(uri);
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.live.get_mut(&key) {
            // revives the source if it is closing
            if entry.source.reopen() {
                entry.refs.insert(consumer);
                log::trace!("{key}: {} consumer(s)", entry.refs.len());
                return Ok(entry.source.clone());
            }
        }
        // Closed, but the Close listener has not run yet: it is waiting for the lock.
        if let Some(entry) = state.live.remove(&key) {
            let configuration = entry.source.configuration();
            save(&mut state, &key, configuration, self.capacity);
        }

        let saved = state.saved.shift_remove(&key).unwrap_or_default();
        let mut configuration = SourceConfiguration::new(key.clone());
        configuration.cursor = saved.cursor;
        configuration.last_event = saved.last_event;
        configuration.settings.enabled = blocking;

        let source = self.router.prepare(&key, configuration)?;
        let weak_state = Arc::downgrade(&self.state);
        let generation = state.generation;
        let capacity = self.capacity;
        let listener_key = key.clone();
        source.add_event_listener(Some(EventKind::Close), move |source, _| {
            if let Some(state) = weak_state.upgrade() {
                on_close(&state, generation, &listener_key, source, capacity);
            }
            Ok(())
        });

        log::debug!("{key}: new source (cursor {:?})", saved.cursor);
        state.live.insert(
            key,
            LiveEntry {
                source: source.clone(),
                refs: FxHashSet::from_iter([consumer]),
            },
        );
        drop(state);

        source.start();
        Ok(source)
    }

    /// Detaches `consumer` from `source`. When no consumer is left, the source is closed.
    pub fn close(&self, source: &Source, consumer: ConsumerRef) {
        let key = source.uri();
        let to_close = {
            let mut state = self.state.lock().unwrap();
            match state.live.get_mut(&key) {
                Some(entry) if entry.source.ptr_eq(source) => {
                    let removed = entry.refs.remove(&consumer);
                    debug_assert!(removed, "consumer {consumer:?} is not attached to {key}");
                    entry.refs.is_empty().then(|| entry.source.clone())
                }
                _ => {
                    log::debug!("{key}: the source is not cached anymore");
                    None
                }
            }
        };

        // Closing a source that has not started yet dispatches Close immediately, and the
        // listener needs the lock.
        if let Some(source) = to_close {
            log::debug!("{key}: no consumer left, closing");
            source.close();

            // a consumer may have attached in the meantime
            let state = self.state.lock().unwrap();
            if let Some(entry) = state.live.get(&key) {
                if entry.source.ptr_eq(&source) && !entry.refs.is_empty() {
                    entry.source.reopen();
                }
            }
        }
    }

    /// Closes every source and forgets everything.
    pub fn reset(&self) {
        let sources: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            state.saved.clear();
            state.live.drain().map(|(_, entry)| entry.source).collect()
        };
        log::debug!("reset: closing {} source(s)", sources.len());
        for source in sources {
            source.close();
        }
    }

    /// Returns the keys of the sources that have no consumer and are waiting for their last iteration to end.
    pub fn closed_keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .live
            .iter()
            .filter(|(_, entry)| entry.refs.is_empty() && entry.source.ready_state() == ReadyState::Closing)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of consumers attached to the source of `uri`.
    pub fn refcount(&self, uri: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.live.get(&normalize(uri)).map_or(0, |entry| entry.refs.len())
    }

    /// Returns the saved configuration of `uri`, if its source has been closed.
    pub fn saved(&self, uri: &str) -> Option<SavedConfiguration> {
        self.state.lock().unwrap().saved.get(&normalize(uri)).cloned()
    }

    pub fn live_sources(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn saved_entries(&self) -> usize {
        self.state.lock().unwrap().saved.len()
    }
}

impl ClosedRequests for SourceCache {
    fn closed_keys(&self) -> Vec<String> {
        SourceCache::closed_keys(self)
    }
}

fn on_close(state: &Mutex<CacheState>, generation: u64, key: &str, source: &Source, capacity: usize) {
    let mut state = state.lock().unwrap();
    if state.generation != generation {
        log::trace!("{key}: closed after a reset, nothing to save");
        return;
    }
    match state.live.get(key) {
        Some(entry) if entry.source.ptr_eq(source) => {
            if !entry.refs.is_empty() {
                log::warn!("{key} stopped with {} consumer(s) attached", entry.refs.len());
            }
            state.live.remove(key);
        }
        // already replaced by a new source
        _ => return,
    }
    save(&mut state, key, source.configuration(), capacity);
}

/// Saves the configuration as the most recently detached one, evicting the least recently detached ones.
fn save(state: &mut CacheState, key: &str, configuration: SourceConfiguration, capacity: usize) {
    log::debug!("{key}: saving cursor {:?}", configuration.cursor);
    state.saved.shift_remove(key);
    state.saved.insert(
        key.to_owned(),
        SavedConfiguration {
            cursor: configuration.cursor,
            last_event: configuration.last_event,
        },
    );
    while state.saved.len() > capacity {
        if let Some((evicted, _)) = state.saved.shift_remove_index(0) {
            log::trace!("{evicted}: saved configuration evicted");
        }
    }
}

/// Handle given to the governor, which must not keep the cache alive.
pub(crate) fn as_closed_requests(cache: &Arc<SourceCache>) -> Weak<dyn ClosedRequests> {
    let weak: Weak<SourceCache> = Arc::downgrade(cache);
    weak
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::error::FetchError;
    use crate::governor::ConnectionGovernor;
    use crate::router::{Request, Resource, Response};

    /// Never answers.
    struct Silent;

    impl Resource for Silent {
        fn fetch(&self, _request: Request) -> BoxFuture<'static, Result<Response, FetchError>> {
            futures::future::pending().boxed()
        }
    }

    fn cache(capacity: usize) -> SourceCache {
        let governor = Arc::new(ConnectionGovernor::new(10));
        let mut router = SourceRouter::new(governor, &EngineConfig::default());
        router.route("kv", Arc::new(Silent));
        SourceCache::new(router, capacity)
    }

    #[tokio::test]
    async fn one_source_per_key() {
        let cache = cache(8);
        let (a, b) = (ConsumerRef::next(), ConsumerRef::next());
        let s1 = cache.open("/dc1/kv/foo", a, true).unwrap();
        let s2 = cache.open("dc1/kv/foo/", b, true).unwrap();
        let s3 = cache.open("/dc1/kv/foo", b, true).unwrap();
        assert!(s1.ptr_eq(&s2) && s2.ptr_eq(&s3));
        assert_eq!(cache.refcount("/dc1/kv/foo"), 2, "the same consumer is counted once");
        assert_eq!(cache.live_sources(), 1);

        cache.close(&s1, a);
        assert_eq!(cache.refcount("/dc1/kv/foo"), 1);
        assert_eq!(s1.ready_state(), ReadyState::Connecting);

        cache.close(&s1, b);
        // not started yet: closed immediately, and saved
        assert_eq!(s1.ready_state(), ReadyState::Closed);
        assert_eq!(cache.live_sources(), 0);
        assert_eq!(cache.saved("/dc1/kv/foo"), Some(SavedConfiguration::default()));
    }

    #[tokio::test]
    async fn reopen_while_closing() {
        let cache = cache(8);
        let (a, b) = (ConsumerRef::next(), ConsumerRef::next());
        let s1 = cache.open("/dc1/kv/foo", a, true).unwrap();
        // let the source open, its first fetch never completes
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(s1.ready_state(), ReadyState::Open);

        cache.close(&s1, a);
        assert_eq!(s1.ready_state(), ReadyState::Closing);
        assert_eq!(cache.closed_keys(), vec!["/dc1/kv/foo".to_owned()]);

        let s2 = cache.open("/dc1/kv/foo", b, true).unwrap();
        assert!(s1.ptr_eq(&s2));
        assert_eq!(s2.ready_state(), ReadyState::Open);
        assert!(cache.closed_keys().is_empty());
    }

    #[tokio::test]
    async fn saved_configurations_are_bounded() {
        let cache = cache(2);
        let consumer = ConsumerRef::next();
        for (i, uri) in ["/dc1/kv/a", "/dc1/kv/b", "/dc1/kv/c"].into_iter().enumerate() {
            let source = cache.open(uri, consumer, true).unwrap();
            source.update_configuration(|c| c.cursor = Some(Cursor(i as u64 + 1)));
            source.dispatch(crate::source::SourceEvent::Message(MessageEvent::new("message", json!(i))));
            cache.close(&source, consumer);
        }
        assert_eq!(cache.saved_entries(), 2);
        assert_eq!(cache.saved("/dc1/kv/a"), None, "least recently detached");
        assert_eq!(cache.saved("/dc1/kv/c").unwrap().cursor, Some(Cursor(3)));

        // reopening resumes from the saved configuration
        let source = cache.open("/dc1/kv/b", consumer, true).unwrap();
        assert_eq!(source.configuration().cursor, Some(Cursor(2)));
        assert_eq!(source.current_event().unwrap().data, json!(1));
        assert_eq!(cache.saved_entries(), 1);
    }

    #[tokio::test]
    async fn reset_forgets_everything() {
        let cache = cache(8);
        let consumer = ConsumerRef::next();
        let old = cache.open("/dc1/kv/a", consumer, true).unwrap();
        old.update_configuration(|c| c.cursor = Some(Cursor(9)));
        let other = cache.open("/dc1/kv/b", consumer, true).unwrap();
        cache.close(&other, consumer);
        assert_eq!(cache.saved_entries(), 1);

        cache.reset();
        assert_eq!(old.ready_state(), ReadyState::Closed);
        assert_eq!(cache.live_sources(), 0);
        assert_eq!(cache.saved_entries(), 0, "the close of the old generation is not saved");

        let new = cache.open("/dc1/kv/a", consumer, true).unwrap();
        assert!(!new.ptr_eq(&old));
        assert_eq!(new.configuration().cursor, None);
    }

    #[tokio::test]
    async fn unknown_routes_leave_no_entry() {
        let cache = cache(8);
        let err = cache.open("/dc1/nodes", ConsumerRef::next(), true).unwrap_err();
        assert!(matches!(err, RouteError::UnknownKind { .. }));
        assert_eq!(cache.live_sources(), 0);
    }
}
