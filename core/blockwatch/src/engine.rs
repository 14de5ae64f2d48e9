//! The root object of the library.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cache::{ConsumerRef, SourceCache, as_closed_requests};
use crate::config::{ConfigError, EngineConfig};
use crate::error::{RouteError, STATUS_RESET};
use crate::governor::{ConnectionGovernor, Visibility};
use crate::router::{Resource, SourceRouter};
use crate::source::Source;
use crate::source::blocking::BlockingSource;

/// Owns the cache, the router and the governor of a set of streams.
///
/// Dropping the engine closes every source and aborts every request in flight.
///
/// # Example
/// ```no_run
/// # use std::sync::Arc;
/// # use blockwatch::{StreamingEngine, EngineConfig, ConsumerRef, Resource};
/// # fn example(kv: Arc<dyn Resource>) -> anyhow::Result<()> {
/// let engine = StreamingEngine::builder(EngineConfig::default())
///     .route("kv", kv)
///     .build()?;
///
/// let consumer = ConsumerRef::next();
/// let source = engine.open("/dc1/kv/foo", consumer)?;
/// let events = source.subscribe();
/// // ...
/// engine.close(&source, consumer);
/// # Ok(())
/// # }
/// ```
pub struct StreamingEngine {
    config: EngineConfig,
    governor: Arc<ConnectionGovernor>,
    cache: Arc<SourceCache>,
    blocking: AtomicBool,
}

/// Builder for [`StreamingEngine`].
pub struct Builder {
    config: EngineConfig,
    routes: Vec<(String, Arc<dyn Resource>)>,
}

/// Snapshot of the state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Sources that are running, or closing.
    pub live_sources: usize,
    /// Saved configurations of closed sources.
    pub saved_entries: usize,
    /// Requests in flight.
    pub connections: usize,
}

impl Builder {
    /// Serves the URIs `/<dc>/<kind>/...` with `resource`.
    pub fn route(mut self, kind: impl Into<String>, resource: Arc<dyn Resource>) -> Self {
        self.routes.push((kind.into(), resource));
        self
    }

    pub fn build(self) -> Result<StreamingEngine, ConfigError> {
        self.config.validate()?;

        let governor = Arc::new(ConnectionGovernor::new(self.config.max_connections));
        let mut router = SourceRouter::new(governor.clone(), &self.config);
        for (kind, resource) in self.routes {
            router.route(kind, resource);
        }
        let cache = Arc::new(SourceCache::new(router, self.config.cache_capacity));
        governor.set_closed_requests(as_closed_requests(&cache));

        log::debug!("streaming engine created with {:?}", self.config);
        Ok(StreamingEngine {
            blocking: AtomicBool::new(self.config.blocking),
            config: self.config,
            governor,
            cache,
        })
    }
}

impl StreamingEngine {
    pub fn builder(config: EngineConfig) -> Builder {
        Builder {
            config,
            routes: Vec::new(),
        }
    }

    /// Returns the source of `uri`, shared with the other consumers of the same resource.
    ///
    /// Call [`close`](Self::close) with the same consumer when it is not needed anymore.
    ///
    /// # Panics
    /// Panics if a new source must be created outside of a Tokio runtime.
    pub fn open(&self, uri: &str, consumer: ConsumerRef) -> Result<BlockingSource, RouteError> {
        self.cache.open(uri, consumer, self.is_blocking())
    }

    /// Detaches a consumer from a source.
    pub fn close(&self, source: &Source, consumer: ConsumerRef) {
        self.cache.close(source, consumer);
    }

    /// Closes every source, forgets every saved cursor and aborts every request in flight.
    pub fn reset(&self) {
        log::info!("resetting the streaming engine");
        self.cache.reset();
        self.governor.purge(STATUS_RESET);
    }

    /// Changes the visibility of the host. While hidden, no request is made.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.governor.set_visibility(visibility);
    }

    /// Enables or disables blocking queries for the sources opened from now on.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn governor(&self) -> &ConnectionGovernor {
        &self.governor
    }

    pub fn cache(&self) -> &SourceCache {
        &self.cache
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            live_sources: self.cache.live_sources(),
            saved_entries: self.cache.saved_entries(),
            connections: self.governor.len(),
        }
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        self.cache.reset();
        self.governor.purge(STATUS_RESET);
    }
}
