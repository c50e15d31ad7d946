//! A simple crate providing ordered media segment loading.
//!
//! A generic and lightweight crate providing features dedicated to:
//! - fetching named chunks of bytes, over HTTP or from the local storage,
//! - delivering them to an append target accepting a single pending append at a time,
//! - awaiting one-shot event notifications as futures,
//! - pacing or bounding asynchronous operations.
//!
//! Loading a sequence of segments happens in two phases:
//!
//! ```text
//!     fetch  ──┬── prefix + init + suffix ──┐
//!              ├── prefix + seg1 + suffix ──┼── join ── append(init) ── ack ── append(seg1) ── ack ── append(seg2) ── ack
//!              └── prefix + seg2 + suffix ──┘
//! ```
//!
//! Fetches run concurrently, and must all succeed before anything is delivered. Deliveries are then strictly serialized
//! in the requested order, the next append being issued only once the previous one has been acknowledged by the sink.
//!
//! As a **strong hypothesis**, we can assume that:
//! - a sink is driven by a single load at a time, which is enforced by exclusively borrowing it;
//! - retries and rollbacks are **out-of-scope**, and left to callers.
//!
//! A sink built on top of a [`SourceBuffer`](sink::SourceBuffer) acknowledges appends through its `update` event: the
//! acknowledgment is awaited with a one-shot [`Once`](event::Once) subscription, registered before appending and
//! released as soon as it fired.

pub mod event;
pub mod fetch;
pub mod loader;
pub mod sink;
pub mod time;

pub use fetch::{Fetch, FetchError, FsFetcher, HttpFetcher};
pub use loader::{Error, SegmentLoader};
pub use sink::{load_segment, AppendError, MemorySourceBuffer, Sink, SourceBuffer};
