//! From URIs to backend calls.
//!
//! The [`SourceRouter`] knows how to reach the backend, but not what the resources mean: each kind
//! of resource is implemented by a [`Resource`], registered with [`SourceRouter::route`].
//! The router binds a resource to a [`ResourceQuery`] and makes every call go through the
//! [`ConnectionGovernor`].

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::cursor::Cursor;
use crate::error::{ErrorClass, FetchError, RouteError, SourceError};
use crate::governor::{
    CONTENT_TYPE, CURSOR_HEADER, Connection, ConnectionGovernor, EVENT_STREAM, Headers, InflightRequest, JSON,
    REQUEST_ID,
};
use crate::source::blocking::{BlockingSource, BlockingWork, CreateEvent, ErrorPolicy, Fetch};
use crate::source::{MessageEvent, ReadyState, Source, SourceConfiguration, SourceEvent};

/// Normalizes a URI into a cache key: no surrounding whitespace, no empty segment, a leading slash.
///
/// ```
/// use blockwatch::router::normalize;
///
/// assert_eq!(normalize(" /dc1//kv/foo/ "), "/dc1/kv/foo");
/// ```
pub fn normalize(uri: &str) -> String {
    let mut key = String::with_capacity(uri.len() + 1);
    for segment in uri.trim().split('/').filter(|s| !s.is_empty()) {
        key.push('/');
        key.push_str(segment);
    }
    if key.is_empty() {
        key.push('/');
    }
    key
}

/// What a URI points to: `/<dc>/<kind>[/<id>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuery {
    pub dc: String,
    pub kind: String,
    /// Rest of the path, may contain slashes (e.g. a key in the KV store).
    pub id: Option<String>,
}

impl ResourceQuery {
    pub fn parse(uri: &str) -> Result<Self, RouteError> {
        let invalid = |reason| RouteError::InvalidUri {
            uri: uri.to_owned(),
            reason,
        };
        let path = normalize(uri);
        let mut parts = path.trim_start_matches('/').splitn(3, '/');
        let dc = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| invalid("missing datacenter"))?;
        let kind = parts.next().ok_or_else(|| invalid("missing resource kind"))?;
        let id = parts.next().map(ToOwned::to_owned);
        Ok(Self {
            dc: dc.to_owned(),
            kind: kind.to_owned(),
            id,
        })
    }
}

/// A call to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Normalized URI of the source.
    pub uri: String,
    pub query: ResourceQuery,
    /// Cursor of the previous response. If set, the backend should block until it has something newer.
    pub cursor: Option<Cursor>,
    /// How long the backend may block, if set.
    pub wait: Option<Duration>,
    pub headers: Headers,
}

impl Request {
    pub fn is_blocking(&self) -> bool {
        self.cursor.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub body: Value,
    pub meta: ResponseMeta,
}

/// Metadata of a [`Response`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMeta {
    /// Cursor of the response, to use in the next request.
    pub cursor: Option<Cursor>,
    pub headers: Headers,
}

impl Response {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            meta: ResponseMeta::default(),
        }
    }

    pub fn with_cursor(mut self, cursor: u64) -> Self {
        self.meta.cursor = Some(Cursor(cursor));
        self
    }
}

impl ResponseMeta {
    /// Builds the metadata from the response headers, reading the cursor from the index header.
    pub fn from_headers(headers: Headers) -> Self {
        let cursor = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(CURSOR_HEADER))
            .and_then(|(_, v)| Cursor::parse(v));
        Self { cursor, headers }
    }
}

/// A kind of resource served by the backend.
pub trait Resource: Send + Sync + 'static {
    /// Performs the call. The future is dropped if the connection is aborted.
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, FetchError>>;

    /// Turns a response body into a message.
    fn create_event(&self, body: &Value, configuration: &SourceConfiguration) -> MessageEvent {
        let _ = configuration;
        MessageEvent::new("message", body.clone())
    }
}

#[derive(Debug, Clone)]
struct RouterSettings {
    wait: Option<Duration>,
    retry_backoff: Duration,
    min_interval: Duration,
}

/// Creates the sources from their URIs.
pub struct SourceRouter {
    routes: FxHashMap<String, Arc<dyn Resource>>,
    governor: Arc<ConnectionGovernor>,
    settings: RouterSettings,
}

impl SourceRouter {
    pub fn new(governor: Arc<ConnectionGovernor>, config: &EngineConfig) -> Self {
        Self {
            routes: FxHashMap::default(),
            governor,
            settings: RouterSettings {
                wait: config.wait,
                retry_backoff: config.retry_backoff,
                min_interval: config.min_interval,
            },
        }
    }

    /// Registers the resource that serves the URIs of the given kind.
    pub fn route(&mut self, kind: impl Into<String>, resource: Arc<dyn Resource>) {
        let kind = kind.into();
        if self.routes.insert(kind.clone(), resource).is_some() {
            log::warn!("resource kind {kind:?} registered twice, the last one wins");
        }
    }

    pub fn governor(&self) -> &Arc<ConnectionGovernor> {
        &self.governor
    }

    /// Creates and starts the source of a URI.
    pub fn source(&self, uri: &str, configuration: SourceConfiguration) -> Result<BlockingSource, RouteError> {
        let source = self.prepare(uri, configuration)?;
        source.start();
        Ok(source)
    }

    /// Creates the source of a URI without starting it, so that the caller can register its listeners first.
    pub(crate) fn prepare(
        &self,
        uri: &str,
        mut configuration: SourceConfiguration,
    ) -> Result<BlockingSource, RouteError> {
        let query = ResourceQuery::parse(uri)?;
        let resource = self
            .routes
            .get(&query.kind)
            .ok_or_else(|| RouteError::UnknownKind {
                uri: uri.to_owned(),
                kind: query.kind.clone(),
            })?
            .clone();

        configuration.uri = normalize(uri);
        let create_event: CreateEvent = {
            let resource = resource.clone();
            Arc::new(move |body: &Value, configuration: &SourceConfiguration| {
                resource.create_event(body, configuration)
            })
        };
        let fetch = RoutedFetch {
            resource,
            query,
            governor: self.governor.clone(),
            wait: self.settings.wait,
        };
        let policy = RetryPolicy {
            governor: self.governor.clone(),
            retry_backoff: self.settings.retry_backoff,
        };
        let work = BlockingWork {
            fetch: Arc::new(fetch),
            create_event,
            policy: Arc::new(policy),
            min_interval: self.settings.min_interval,
        };
        Ok(BlockingSource::new(work, configuration))
    }
}

/// Fetch bound to a resource and a query, going through the governor.
struct RoutedFetch {
    resource: Arc<dyn Resource>,
    query: ResourceQuery,
    governor: Arc<ConnectionGovernor>,
    wait: Option<Duration>,
}

impl Fetch for RoutedFetch {
    fn fetch(&self, configuration: &SourceConfiguration) -> BoxFuture<'static, Result<Response, FetchError>> {
        let resource = self.resource.clone();
        let governor = self.governor.clone();
        let query = self.query.clone();
        let uri = configuration.uri.clone();
        let cursor = configuration.cursor;
        let wait = cursor.and(self.wait);

        async move {
            governor.when_available().await;

            let mut headers = Headers::default();
            headers.insert(REQUEST_ID.to_owned(), uri.clone());
            let content_type = if cursor.is_some() { EVENT_STREAM } else { JSON };
            headers.insert(CONTENT_TYPE.to_owned(), content_type.to_owned());

            let connection = Arc::new(InflightRequest::new(headers.clone()));
            let request = Request {
                uri,
                query,
                cursor,
                wait,
                headers,
            };
            let _slot = governor.admit(connection.clone() as Arc<dyn Connection>);
            tokio::select! {
                biased;
                status = connection.aborted() => Err(FetchError::Aborted(status)),
                res = resource.fetch(request) => res,
            }
        }
        .boxed()
    }
}

/// Decides whether a source survives a failed fetch, depending on the [`ErrorClass`].
struct RetryPolicy {
    governor: Arc<ConnectionGovernor>,
    retry_backoff: Duration,
}

impl ErrorPolicy for RetryPolicy {
    fn recover(&self, error: FetchError, source: &Source) -> BoxFuture<'static, Result<(), SourceError>> {
        let class = error.class();
        if class != ErrorClass::Fatal && source.ready_state() != ReadyState::Open {
            // nobody wants the data anymore, let the loop finish
            log::debug!("{}: {error} while closing", source.uri());
            return futures::future::ready(Ok(())).boxed();
        }

        let governor = self.governor.clone();
        let backoff = self.retry_backoff;
        match class {
            ErrorClass::Fatal => futures::future::ready(Err(error.into())).boxed(),
            ErrorClass::Preempted => {
                log::debug!("{} was preempted, waiting for a free connection", source.uri());
                async move {
                    tokio::select! {
                        _ = governor.when_vacant() => (),
                        _ = tokio::time::sleep(backoff) => (),
                    }
                    governor.when_available().await;
                    Ok(())
                }
                .boxed()
            }
            ErrorClass::Paused => async move {
                governor.when_available().await;
                Ok(())
            }
            .boxed(),
            ErrorClass::Unavailable => {
                log::warn!("{}: {error}, retrying in {backoff:?}", source.uri());
                source.dispatch(SourceEvent::Error(error.into()));
                async move {
                    tokio::time::sleep(backoff).await;
                    governor.when_available().await;
                    Ok(())
                }
                .boxed()
            }
        }
    }
}
