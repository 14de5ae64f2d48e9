//! Shared event streams on top of blocking queries.
//!
//! Some HTTP APIs (Consul is the typical example) support _blocking queries_: a request carries the
//! index (cursor) of the data the client already has, and the server holds it until something newer
//! exists. By repeating such a request forever, one gets a stream of changes.
//!
//! `blockwatch` turns a blocking-query API into event streams that many consumers can share:
//!
//! - every resource (URI) is polled by at most one loop, whatever the number of consumers,
//!   see [`cache`];
//! - the number of requests in flight is bounded, older connections are evicted when needed,
//!   see [`governor`];
//! - polling pauses while the host is hidden, and resumes where it left off;
//! - transient failures of the backend are retried with a backoff.
//!
//! # Getting started
//! Implement [`Resource`] for each kind of resource of your backend, register them with a
//! [`StreamingEngine`], then [open](StreamingEngine::open) the URIs you need and
//! [subscribe](source::Source::subscribe) to their events.
//!
//! The engine runs on Tokio: each source is a task.

pub mod cache;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod governor;
pub mod router;
pub mod source;

pub use cache::ConsumerRef;
pub use config::EngineConfig;
pub use engine::StreamingEngine;
pub use router::{Request, Resource, Response};
pub use source::blocking::BlockingSource;
pub use source::{EventKind, MessageEvent, ReadyState, Source, SourceEvent};
