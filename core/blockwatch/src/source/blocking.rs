//! Sources backed by blocking queries.
//!
//! A blocking query carries the cursor of the previous response. The backend holds the request
//! until it has something newer than that cursor, then responds with fresh data and a new cursor.
//! Threading the cursor from one iteration to the next turns a simple fetch into a stream of changes.

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::cursor::Cursor;
use crate::error::{FetchError, SourceError};
use crate::router::Response;

use super::reopen::LoopMode;
use super::{EventKind, MessageEvent, Source, SourceConfiguration, SourceEvent, UnitOfWork};

/// Performs one backend call for a source.
///
/// The configuration passed to `fetch` has no cursor when blocking is disabled.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(&self, configuration: &SourceConfiguration) -> BoxFuture<'static, Result<Response, FetchError>>;
}

/// Decides what to do when a fetch fails.
pub trait ErrorPolicy: Send + Sync + 'static {
    /// Returns `Ok(())` to run the next iteration, or an error to stop the source.
    fn recover(&self, error: FetchError, source: &Source) -> BoxFuture<'static, Result<(), SourceError>>;
}

/// Error policy that never recovers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFast;

impl ErrorPolicy for FailFast {
    fn recover(&self, error: FetchError, _source: &Source) -> BoxFuture<'static, Result<(), SourceError>> {
        futures::future::ready(Err(error.into())).boxed()
    }
}

/// Turns a response body into a message.
pub type CreateEvent = Arc<dyn Fn(&Value, &SourceConfiguration) -> MessageEvent + Send + Sync>;

/// Default [`CreateEvent`]: a `message` event whose data is the body.
pub fn default_create_event() -> CreateEvent {
    Arc::new(|body: &Value, _: &SourceConfiguration| MessageEvent::new("message", body.clone()))
}

/// Everything a [`BlockingSource`] needs to run.
#[derive(Clone)]
pub struct BlockingWork {
    pub fetch: Arc<dyn Fetch>,
    pub create_event: CreateEvent,
    pub policy: Arc<dyn ErrorPolicy>,
    /// Minimum delay before the next request when the cursor did not move.
    pub min_interval: Duration,
}

impl BlockingWork {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self {
            fetch,
            create_event: default_create_event(),
            policy: Arc::new(FailFast),
            min_interval: Duration::ZERO,
        }
    }
}

impl UnitOfWork for BlockingWork {
    fn run(&self, source: &Source) -> BoxFuture<'static, Result<(), SourceError>> {
        let work = self.clone();
        let source = source.clone();
        async move { work.iteration(source).await }.boxed()
    }
}

impl BlockingWork {
    async fn iteration(self, source: Source) -> Result<(), SourceError> {
        let configuration = source.configuration();
        let enabled = configuration.settings.enabled;
        let previous = configuration.cursor;

        let mut request_configuration = configuration;
        if !enabled {
            request_configuration.cursor = None;
        }
        let response = match self.fetch.fetch(&request_configuration).await {
            Ok(response) => response,
            Err(e) => {
                log::debug!("fetch of {} failed: {e}", request_configuration.uri);
                return self.policy.recover(e, &source).await;
            }
        };

        if !enabled {
            // one-shot fetch: no cursor, and no other iteration
            let mut event = (self.create_event)(&response.body, &request_configuration);
            event.cursor = None;
            source.dispatch(SourceEvent::Message(event));
            source.close();
            return Ok(());
        }

        let Some(raw) = response.meta.cursor else {
            // nothing to block on: the next request would return at once
            log::debug!("{}: no cursor in the response, stopping", request_configuration.uri);
            let mut event = (self.create_event)(&response.body, &request_configuration);
            event.cursor = previous;
            source.dispatch(SourceEvent::Message(event));
            source.close();
            return Ok(());
        };
        let cursor = Some(Cursor::validate(raw.0, previous));
        let configuration = source.update_configuration(|c| {
            c.cursor = cursor;
            c.clone()
        });
        let mut event = (self.create_event)(&response.body, &configuration);
        event.cursor = cursor;
        source.dispatch(SourceEvent::Message(event));

        if cursor == previous && !self.min_interval.is_zero() {
            log::trace!("{}: cursor did not move, waiting {:?}", configuration.uri, self.min_interval);
            tokio::time::sleep(self.min_interval).await;
        }
        Ok(())
    }
}

/// A [`Source`] that runs blocking queries.
///
/// `BlockingSource` dereferences to [`Source`], which provides the event API.
#[derive(Clone, Debug)]
pub struct BlockingSource {
    source: Source,
    /// Taken when the source starts.
    work: Arc<Mutex<Option<BlockingWork>>>,
}

impl BlockingSource {
    /// Creates a blocking source and starts it.
    ///
    /// If the configuration contains a `last_event` (restored from a previous source),
    /// it is replayed to the listeners when the source opens.
    ///
    /// # Panics
    /// Panics if not called in the context of a Tokio runtime.
    pub fn spawn(work: BlockingWork, configuration: SourceConfiguration) -> Self {
        let source = Self::new(work, configuration);
        source.start();
        source
    }

    /// Creates a blocking source without starting it. Call [`start`](Self::start) to start it.
    pub(crate) fn new(work: BlockingWork, configuration: SourceConfiguration) -> Self {
        let source = Source::new(configuration);
        source.add_event_listener(Some(EventKind::Open), |source, _| {
            source.replay_to_listeners();
            Ok(())
        });
        Self {
            source,
            work: Arc::new(Mutex::new(Some(work))),
        }
    }

    pub(crate) fn start(&self) {
        let work = self.work.lock().unwrap().take();
        if let Some(work) = work {
            self.source.start(Arc::new(work), LoopMode::Reopen);
        }
    }

    /// Returns the last message, so that a late consumer can catch up without waiting for the next poll.
    pub fn current_event(&self) -> Option<MessageEvent> {
        self.source.current_event()
    }

    pub fn source(&self) -> &Source {
        &self.source
    }
}

impl Deref for BlockingSource {
    type Target = Source;

    fn deref(&self) -> &Self::Target {
        &self.source
    }
}

impl std::fmt::Debug for BlockingWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingWork")
            .field("min_interval", &self.min_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use serde_json::json;
    use tokio_stream::StreamExt;

    use super::{BlockingSource, BlockingWork, Fetch};
    use crate::cursor::Cursor;
    use crate::error::FetchError;
    use crate::router::{Response, ResponseMeta};
    use crate::source::{EventKind, MessageEvent, ReadyState, SourceConfiguration, SourceEvent};

    /// Replies with the queued responses, then waits forever.
    #[derive(Default)]
    struct Queue {
        responses: Mutex<VecDeque<Response>>,
        seen: Mutex<Vec<Option<Cursor>>>,
    }

    impl Fetch for Queue {
        fn fetch(&self, configuration: &SourceConfiguration) -> BoxFuture<'static, Result<Response, FetchError>> {
            self.seen.lock().unwrap().push(configuration.cursor);
            match self.responses.lock().unwrap().pop_front() {
                Some(res) => futures::future::ready(Ok(res)).boxed(),
                None => futures::future::pending().boxed(),
            }
        }
    }

    fn response(body: serde_json::Value, cursor: u64) -> Response {
        Response {
            body,
            meta: ResponseMeta {
                cursor: Some(Cursor(cursor)),
                ..Default::default()
            },
        }
    }

    fn queue(responses: Vec<Response>) -> Arc<Queue> {
        Arc::new(Queue {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn threads_the_cursor() {
        let fetch = queue(vec![response(json!("a"), 10), response(json!("b"), 12), response(json!("c"), 3)]);
        let source = BlockingSource::spawn(BlockingWork::new(fetch.clone()), SourceConfiguration::new("/dc1/kv/a"));
        let mut events = source.subscribe();

        assert_eq!(events.next().await.map(|e| e.kind()), Some(EventKind::Open));
        let mut data = Vec::new();
        for _ in 0..3 {
            match events.next().await {
                Some(SourceEvent::Message(msg)) => data.push((msg.data, msg.cursor)),
                e => panic!("unexpected event {e:?}"),
            }
        }
        assert_eq!(
            data,
            vec![
                (json!("a"), Some(Cursor(10))),
                (json!("b"), Some(Cursor(12))),
                // the cursor went backwards: reset
                (json!("c"), Some(Cursor(1))),
            ]
        );
        tokio::task::yield_now().await;
        assert_eq!(
            *fetch.seen.lock().unwrap(),
            vec![None, Some(Cursor(10)), Some(Cursor(12)), Some(Cursor(1))]
        );
        assert_eq!(source.current_event().unwrap().data, json!("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_fetches_once() {
        let fetch = queue(vec![response(json!("a"), 10), response(json!("b"), 12)]);
        let mut configuration = SourceConfiguration::new("/dc1/kv/a");
        configuration.cursor = Some(Cursor(5));
        configuration.settings.enabled = false;
        let source = BlockingSource::spawn(BlockingWork::new(fetch.clone()), configuration);

        source.closed().await;
        assert_eq!(*fetch.seen.lock().unwrap(), vec![None], "one fetch, without cursor");
        assert_eq!(source.current_event().unwrap().data, json!("a"));
        assert_eq!(source.configuration().cursor, Some(Cursor(5)), "cursor left untouched");
    }

    #[tokio::test(start_paused = true)]
    async fn restored_event_is_replayed_on_open() {
        let fetch = queue(vec![]);
        let mut configuration = SourceConfiguration::new("/dc1/kv/a");
        configuration.last_event = Some(MessageEvent::new("message", json!("restored")));
        configuration.cursor = Some(Cursor(42));

        let source = BlockingSource::new(BlockingWork::new(fetch.clone()), configuration);
        let replayed = Arc::new(Mutex::new(Vec::new()));
        let r = replayed.clone();
        source.add_event_listener(Some(EventKind::Message), move |_, e| {
            if let SourceEvent::Message(msg) = e {
                r.lock().unwrap().push(msg.data.clone());
            }
            Ok(())
        });
        source.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*replayed.lock().unwrap(), vec![json!("restored")]);
        assert_eq!(*fetch.seen.lock().unwrap(), vec![Some(Cursor(42))]);
        assert_eq!(source.ready_state(), ReadyState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_error_stops_the_source() {
        struct Broken;
        impl Fetch for Broken {
            fn fetch(&self, _: &SourceConfiguration) -> BoxFuture<'static, Result<Response, FetchError>> {
                futures::future::ready(Err(FetchError::Status {
                    status: 404,
                    message: "not found".into(),
                }))
                .boxed()
            }
        }
        let source = BlockingSource::spawn(BlockingWork::new(Arc::new(Broken)), SourceConfiguration::new("/dc1/kv/x"));
        let events: Vec<EventKind> = source.subscribe().map(|e| e.kind()).take(3).collect().await;
        assert_eq!(events, vec![EventKind::Open, EventKind::Error, EventKind::Close]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_cursor_stops_the_source() {
        let fetch = queue(vec![
            response(json!("a"), 4),
            Response::new(json!("b")),
            Response::new(json!("c")),
        ]);
        let source = BlockingSource::spawn(BlockingWork::new(fetch.clone()), SourceConfiguration::new("/dc1/kv/n"));
        let events: Vec<EventKind> = source.subscribe().map(|e| e.kind()).take(4).collect().await;
        assert_eq!(
            events,
            vec![EventKind::Open, EventKind::Message, EventKind::Message, EventKind::Close]
        );
        assert_eq!(*fetch.seen.lock().unwrap(), vec![None, Some(Cursor(4))]);
        let last = source.current_event().unwrap();
        assert_eq!((last.data, last.cursor), (json!("b"), Some(Cursor(4))));
    }

    #[tokio::test(start_paused = true)]
    async fn same_cursor_is_throttled() {
        let fetch = queue(vec![response(json!(1), 7), response(json!(2), 7), response(json!(3), 7)]);
        let mut work = BlockingWork::new(fetch.clone());
        work.min_interval = Duration::from_secs(10);
        let _source = BlockingSource::spawn(work, SourceConfiguration::new("/dc1/kv/t"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        // first response moves the cursor from None to 7, second one does not move it
        assert_eq!(fetch.seen.lock().unwrap().len(), 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetch.seen.lock().unwrap().len(), 3);
    }
}
