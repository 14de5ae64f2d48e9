//! Events emitted by sources, and their listeners.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::cursor::Cursor;
use crate::error::SourceError;

use super::Source;

/// Kind of a [`SourceEvent`], used to filter listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Message,
    Error,
    Close,
}

/// Normalized payload produced from a backend response.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub event_type: String,
    pub data: Value,
    /// Cursor of the response that produced this event.
    pub cursor: Option<Cursor>,
}

impl MessageEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            cursor: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SourceEvent {
    Open,
    Message(MessageEvent),
    Error(SourceError),
    Close,
}

impl SourceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SourceEvent::Open => EventKind::Open,
            SourceEvent::Message(_) => EventKind::Message,
            SourceEvent::Error(_) => EventKind::Error,
            SourceEvent::Close => EventKind::Close,
        }
    }
}

/// Identifies a listener, in order to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) type Listener = Arc<dyn Fn(&Source, &SourceEvent) -> anyhow::Result<()> + Send + Sync>;

/// Listeners and subscribers of one source.
///
/// Callbacks are called in the task that dispatches the event, one after the other,
/// outside of any lock. Subscribers receive a copy of each event through a channel.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    callbacks: Vec<(ListenerId, Option<EventKind>, Listener)>,
    subscribers: Vec<mpsc::UnboundedSender<SourceEvent>>,
}

impl Listeners {
    pub fn add(&mut self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.callbacks.push((id, kind, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let len_before = self.callbacks.len();
        self.callbacks.retain(|(l, _, _)| *l != id);
        self.callbacks.len() != len_before
    }

    pub fn subscribe(&mut self, replay: Option<SourceEvent>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(event) = replay {
            // cannot fail, we hold the receiver
            let _ = tx.send(event);
        }
        self.subscribers.push(tx);
        EventStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Sends the event to the subscribers, dropping those that have gone away,
    /// and returns the callbacks that must be called.
    pub fn prepare(&mut self, event: &SourceEvent) -> Vec<Listener> {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        self.matching(event.kind())
    }

    pub fn matching(&self, kind: EventKind) -> Vec<Listener> {
        self.callbacks
            .iter()
            .filter(|(_, k, _)| k.is_none_or(|k| k == kind))
            .map(|(_, _, l)| Arc::clone(l))
            .collect()
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
        self.subscribers.clear();
    }
}

/// Calls every listener with the event.
///
/// An error or a panic in a listener is logged, and does not prevent the other listeners from running.
pub(crate) fn call_listeners(listeners: &[Listener], source: &Source, event: &SourceEvent) {
    for listener in listeners {
        match catch_unwind(AssertUnwindSafe(|| listener(source, event))) {
            Ok(Ok(())) => (),
            Ok(Err(e)) => log::error!("Error in {:?} listener of {}: {e:?}", event.kind(), source.uri()),
            Err(_) => log::error!("Panic in {:?} listener of {}", event.kind(), source.uri()),
        }
    }
}

/// Stream of the events of a source, obtained with [`Source::subscribe`].
///
/// The stream ends when the source is dropped or when [`Source::clear_listeners`] is called.
#[derive(Debug)]
pub struct EventStream {
    inner: UnboundedReceiverStream<SourceEvent>,
}

impl EventStream {
    /// Returns the next event without waiting, if there is one.
    pub fn try_next(&mut self) -> Option<SourceEvent> {
        self.inner.as_mut().try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = SourceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
