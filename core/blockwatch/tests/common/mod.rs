#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use blockwatch::error::FetchError;
use blockwatch::source::EventStream;
use blockwatch::{EngineConfig, MessageEvent, Request, Resource, Response, SourceEvent, StreamingEngine};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio_stream::StreamExt;

/// How long the helpers wait before giving up. The tests run with a paused clock: this is never
/// reached unless something is wrong.
const TIMEOUT: Duration = Duration::from_secs(600);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Creates an engine whose resources of kind "kv" and "services" are served by a scripted backend.
pub fn engine(config: EngineConfig) -> (StreamingEngine, Arc<Backend>) {
    init_logger();
    let backend = Arc::new(Backend::default());
    let engine = StreamingEngine::builder(config)
        .route("kv", backend.clone())
        .route("services", backend.clone())
        .build()
        .expect("the config should be valid");
    (engine, backend)
}

/// Lets every task run until it waits for something.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// In-memory backend: every request waits until the test replies to it.
#[derive(Default)]
pub struct Backend {
    state: Mutex<BackendState>,
    arrived: Notify,
}

#[derive(Default)]
struct BackendState {
    history: Vec<Request>,
    pending: Vec<PendingFetch>,
}

struct PendingFetch {
    uri: String,
    reply: oneshot::Sender<Result<Response, FetchError>>,
}

impl Resource for Backend {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, FetchError>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            state.pending.push(PendingFetch {
                uri: request.uri.clone(),
                reply: tx,
            });
            state.history.push(request);
        }
        self.arrived.notify_waiters();
        async move {
            rx.await
                .unwrap_or_else(|_| Err(FetchError::Network(String::from("the test backend went away"))))
        }
        .boxed()
    }
}

impl Backend {
    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn requests_for(&self, uri: &str) -> Vec<Request> {
        self.requests().into_iter().filter(|r| r.uri == uri).collect()
    }

    /// URIs of the requests that are waiting for a reply and have not been aborted, oldest first.
    pub fn in_flight(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state.pending.retain(|p| !p.reply.is_closed());
        state.pending.iter().map(|p| p.uri.clone()).collect()
    }

    /// Waits for the `n`-th request (starting at 1) to `uri`, and returns it.
    pub async fn wait_request(&self, uri: &str, n: usize) -> Request {
        let wait = async {
            loop {
                let notified = self.arrived.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(r) = self.requests_for(uri).into_iter().nth(n - 1) {
                    return r;
                }
                notified.await;
            }
        };
        tokio::time::timeout(TIMEOUT, wait)
            .await
            .unwrap_or_else(|_| panic!("request #{n} to {uri} never arrived"))
    }

    /// Replies to the oldest request to `uri` that is still in flight.
    pub fn reply(&self, uri: &str, result: Result<Response, FetchError>) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.pending.retain(|p| !p.reply.is_closed());
            let index = state
                .pending
                .iter()
                .position(|p| p.uri == uri)
                .unwrap_or_else(|| panic!("no request to {uri} in flight"));
            state.pending.remove(index)
        };
        let _ = pending.reply.send(result);
    }

    /// Replies with a body and a cursor.
    pub fn respond(&self, uri: &str, body: Value, cursor: u64) {
        self.reply(uri, Ok(Response::new(body).with_cursor(cursor)));
    }
}

pub async fn next_event(events: &mut EventStream) -> SourceEvent {
    tokio::time::timeout(TIMEOUT, events.next())
        .await
        .expect("no event received")
        .expect("the event stream has ended")
}

/// Returns the next message, skipping the `Open` event.
pub async fn next_message(events: &mut EventStream) -> MessageEvent {
    loop {
        match next_event(events).await {
            SourceEvent::Open => continue,
            SourceEvent::Message(msg) => return msg,
            e => panic!("expected a message, got {e:?}"),
        }
    }
}
