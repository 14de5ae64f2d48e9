//! Pollable event sources.
//!
//! A [`Source`] wraps an asynchronous unit of work and reports its progress as events
//! ([`SourceEvent`]): `Open`, then any number of `Message` and `Error`, then `Close`.
//!
//! - [`Source::spawn_once`] runs the unit of work once.
//! - [`Source::spawn_reopenable`] runs it again and again until [`Source::close`] is called,
//!   see the [`reopen`] module.
//! - [`blocking::BlockingSource`] specializes the unit of work for blocking queries.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting --(task starts)--> Open --(close)--> Closing --(iteration ends)--> Closed
//!      |                         |  ^                 |
//!      +-------(close)-----------|--|-----------------+--> Closed
//!                                |  +----(reopen)-----+
//!                                +--(error / once)-------> Closed
//! ```
//!
//! `close()` is cooperative: work already in flight is never interrupted.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use num_enum::{FromPrimitive, IntoPrimitive};
use tokio::sync::Notify;

use crate::cursor::Cursor;
use crate::error::SourceError;

pub mod blocking;
pub(crate) mod coop;
mod event;
pub mod reopen;

pub use event::{EventKind, EventStream, ListenerId, MessageEvent, SourceEvent};
use event::{Listeners, call_listeners};

/// State of the connection of a source.
#[derive(Clone, Debug, PartialEq, Eq, Copy, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    #[num_enum(default)]
    Closed,
}

/// User-controlled settings of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Whether long-polling is desired at all.
    pub enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Mutable configuration of a source, passed to each iteration of its unit of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceConfiguration {
    /// Identity of the resource polled by the source.
    pub uri: String,
    /// Cursor echoed from the last response.
    pub cursor: Option<Cursor>,
    pub settings: Settings,
    /// Last dispatched message, replayed to late consumers.
    pub last_event: Option<MessageEvent>,
}

impl SourceConfiguration {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }
}

/// Asynchronous unit of work run by a source.
///
/// The returned future must be `'static`: clone the source (cheap) if you need it inside.
pub trait UnitOfWork: Send + Sync + 'static {
    fn run(&self, source: &Source) -> BoxFuture<'static, Result<(), SourceError>>;
}

impl<F, Fut> UnitOfWork for F
where
    F: Fn(Source) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SourceError>> + Send + 'static,
{
    fn run(&self, source: &Source) -> BoxFuture<'static, Result<(), SourceError>> {
        self(source.clone()).boxed()
    }
}

/// A live or dormant polling loop.
///
/// `Source` is a cheap handle: clones refer to the same source.
#[derive(Clone)]
pub struct Source {
    inner: Arc<Inner>,
}

/// Weak handle to a [`Source`], which does not keep it alive.
#[derive(Clone)]
pub struct WeakSource {
    inner: Weak<Inner>,
}

struct Inner {
    ready_state: AtomicU8,
    shared: Mutex<Shared>,
    /// Notified when the source becomes `Closed`.
    closed: Notify,
}

struct Shared {
    configuration: SourceConfiguration,
    listeners: Listeners,
}

impl Source {
    /// Creates a source in the `Connecting` state, without starting it.
    pub(crate) fn new(configuration: SourceConfiguration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ready_state: AtomicU8::new(ReadyState::Connecting.into()),
                shared: Mutex::new(Shared {
                    configuration,
                    listeners: Listeners::default(),
                }),
                closed: Notify::new(),
            }),
        }
    }

    /// Creates a source that runs `work` exactly once, then closes itself.
    ///
    /// # Panics
    /// Panics if not called in the context of a Tokio runtime.
    pub fn spawn_once(work: impl UnitOfWork, configuration: SourceConfiguration) -> Self {
        let source = Self::new(configuration);
        source.start(Arc::new(work), reopen::LoopMode::Once);
        source
    }

    /// Creates a source that runs `work` until it is closed.
    ///
    /// # Panics
    /// Panics if not called in the context of a Tokio runtime.
    pub fn spawn_reopenable(work: impl UnitOfWork, configuration: SourceConfiguration) -> Self {
        let source = Self::new(configuration);
        source.start(Arc::new(work), reopen::LoopMode::Reopen);
        source
    }

    pub(crate) fn start(&self, work: Arc<dyn UnitOfWork>, mode: reopen::LoopMode) {
        let task = reopen::run_loop(self.clone(), work, mode);
        tokio::spawn(task);
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.ready_state.load(Ordering::Acquire).into()
    }

    pub fn uri(&self) -> String {
        self.inner.shared.lock().unwrap().configuration.uri.clone()
    }

    /// Returns a snapshot of the current configuration.
    pub fn configuration(&self) -> SourceConfiguration {
        self.inner.shared.lock().unwrap().configuration.clone()
    }

    /// Modifies the configuration. The next iteration of the unit of work will see the change.
    pub fn update_configuration<R>(&self, f: impl FnOnce(&mut SourceConfiguration) -> R) -> R {
        let mut shared = self.inner.shared.lock().unwrap();
        f(&mut shared.configuration)
    }

    /// Returns the last dispatched message, if any.
    pub fn current_event(&self) -> Option<MessageEvent> {
        self.inner.shared.lock().unwrap().configuration.last_event.clone()
    }

    /// Requests the source to stop.
    ///
    /// - `Connecting`: the source is closed immediately, and the `Close` event is dispatched.
    /// - `Open`: the source becomes `Closing`, and will be closed at the end of the current iteration.
    /// - `Closing` or `Closed`: does nothing.
    pub fn close(&self) {
        if self.transition(ReadyState::Connecting, ReadyState::Closed) {
            log::trace!("{} closed before opening", self.uri());
            self.inner.closed.notify_waiters();
            self.dispatch(SourceEvent::Close);
        } else if self.transition(ReadyState::Open, ReadyState::Closing) {
            log::trace!("{} is closing", self.uri());
        }
    }

    /// Cancels a pending [`close`](Self::close).
    ///
    /// Returns `false` if the source is already `Closed`: it cannot be reopened, create a new one.
    pub fn reopen(&self) -> bool {
        if self.transition(ReadyState::Closing, ReadyState::Open) {
            log::trace!("{} reopened while closing", self.uri());
        }
        self.ready_state() != ReadyState::Closed
    }

    /// Waits for the source to become `Closed`.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.ready_state() == ReadyState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Registers a listener, called on each event of the given kind (or every event if `kind` is `None`).
    ///
    /// Listeners are called in the task that runs the source: they should only perform a minimal
    /// amount of work, and must not block.
    pub fn add_event_listener<F>(&self, kind: Option<EventKind>, listener: F) -> ListenerId
    where
        F: Fn(&Source, &SourceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut shared = self.inner.shared.lock().unwrap();
        shared.listeners.add(kind, Arc::new(listener))
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.shared.lock().unwrap().listeners.remove(id)
    }

    /// Subscribes to the events of the source.
    ///
    /// If the source has a current event, it is the first item of the stream,
    /// followed by every event dispatched after the subscription, in order.
    pub fn subscribe(&self) -> EventStream {
        let mut shared = self.inner.shared.lock().unwrap();
        let replay = shared.configuration.last_event.clone().map(SourceEvent::Message);
        shared.listeners.subscribe(replay)
    }

    /// Removes every listener and ends every subscription.
    pub fn clear_listeners(&self) {
        self.inner.shared.lock().unwrap().listeners.clear();
    }

    /// Dispatches an event to every listener and subscriber.
    ///
    /// A `Message` also becomes the current event of the source.
    pub fn dispatch(&self, event: SourceEvent) {
        let listeners = {
            let mut shared = self.inner.shared.lock().unwrap();
            if let SourceEvent::Message(msg) = &event {
                shared.configuration.last_event = Some(msg.clone());
            }
            shared.listeners.prepare(&event)
        };
        call_listeners(&listeners, self, &event);
    }

    /// Dispatches the current event to the callback listeners only.
    ///
    /// Subscribers already got it when they subscribed.
    pub(crate) fn replay_to_listeners(&self) {
        let (listeners, event) = {
            let shared = self.inner.shared.lock().unwrap();
            match &shared.configuration.last_event {
                Some(msg) => (
                    shared.listeners.matching(EventKind::Message),
                    SourceEvent::Message(msg.clone()),
                ),
                None => return,
            }
        };
        call_listeners(&listeners, self, &event);
    }

    pub fn downgrade(&self) -> WeakSource {
        WeakSource {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns `true` if the two handles refer to the same source.
    pub fn ptr_eq(&self, other: &Source) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.inner
            .ready_state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Terminal transition: becomes `Closed` and dispatches `Close`.
    pub(crate) fn finalize(&self) {
        let prev: ReadyState = self
            .inner
            .ready_state
            .swap(ReadyState::Closed.into(), Ordering::AcqRel)
            .into();
        if prev != ReadyState::Closed {
            self.inner.closed.notify_waiters();
            self.dispatch(SourceEvent::Close);
        }
    }
}

impl WeakSource {
    pub fn upgrade(&self) -> Option<Source> {
        self.inner.upgrade().map(|inner| Source { inner })
    }
}

impl Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("uri", &self.uri())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}
