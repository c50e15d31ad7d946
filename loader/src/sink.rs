//! This module provides the append targets fetched segments are delivered to.

use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::future;
use thiserror::Error;

use crate::event::{Event, EventTarget};

#[derive(Debug, Error)]
pub enum AppendError {
    #[error("an append is already pending on this source buffer")]
    InvalidState,
    #[error("appended data has been rejected")]
    Rejected,
    #[error("pending append has been aborted")]
    Aborted,
    #[error("source buffer closed before acknowledging the append")]
    Closed,
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Ordered append target.
///
/// A sink accepts one buffer at a time: [`Sink::append_and_await()`] must resolve exactly once per call, and only
/// after the buffer has been accepted. Callers must not issue another append before the pending one resolved.
pub trait Sink: Send {
    /// Append `buffer` and wait for its acknowledgment.
    fn append_and_await(&mut self, buffer: Bytes) -> impl Future<Output = Result<(), AppendError>> + Send;
}

/// Events fired by a [`SourceBuffer`] while processing an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceBufferEvent {
    /// An append started.
    UpdateStart,
    /// An append has been successfully processed.
    Update,
    /// An append ended, whatever its outcome.
    UpdateEnd,
    /// An append failed.
    Error,
    /// A pending append has been aborted.
    Abort,
}

impl SourceBufferEvent {
    pub const UPDATE_START: &'static str = "updatestart";
    pub const UPDATE: &'static str = "update";
    pub const UPDATE_END: &'static str = "updateend";
    pub const ERROR: &'static str = "error";
    pub const ABORT: &'static str = "abort";
}

impl Event for SourceBufferEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::UpdateStart => Self::UPDATE_START,
            Self::Update => Self::UPDATE,
            Self::UpdateEnd => Self::UPDATE_END,
            Self::Error => Self::ERROR,
            Self::Abort => Self::ABORT,
        }
    }
}

/// Media source buffer interface.
///
/// Appending only schedules the data to be processed: its outcome is notified later on through [`SourceBuffer::events()`],
/// by either an `update`, an `error` or an `abort` event.
pub trait SourceBuffer: Send + Sync {
    /// Schedule `data` to be appended.
    fn append_buffer(&self, data: Bytes) -> Result<(), AppendError>;

    /// The events fired by this source buffer.
    fn events(&self) -> &EventTarget<SourceBufferEvent>;
}

/// Append `data` to `sb` and wait for the append to be processed.
///
/// Listeners are subscribed before appending so that no notification can be missed, and are all released once the
/// first of them fired.
pub async fn load_segment<B: SourceBuffer + ?Sized>(sb: &B, data: impl Into<Bytes>) -> Result<(), AppendError> {
    let events = sb.events();
    let outcomes = [
        events.once(SourceBufferEvent::UPDATE),
        events.once(SourceBufferEvent::ERROR),
        events.once(SourceBufferEvent::ABORT),
    ];

    sb.append_buffer(data.into())?;

    let (outcome, _, _) = future::select_all(outcomes).await;

    match outcome {
        Ok(SourceBufferEvent::Update) => Ok(()),
        Ok(SourceBufferEvent::Abort) => Err(AppendError::Aborted),
        Ok(_) => Err(AppendError::Rejected),
        Err(_) => Err(AppendError::Closed),
    }
}

#[derive(Debug, Default)]
struct State {
    buffered: BytesMut,
    appends: usize,
    updating: bool,
    /// Incremented on abort, so that a pending append knows it has been superseded.
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    events: EventTarget<SourceBufferEvent>,
    quota: Option<usize>,
}

/// In-memory source buffer.
///
/// Appended data is processed in the background, then accumulated in memory. Clones share the same buffer.
///
/// _Note: appending must be done from within a Tokio runtime._
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use segment_loader::sink::{load_segment, MemorySourceBuffer};
/// let sb = MemorySourceBuffer::new();
///
/// load_segment(&sb, &b"ftyp"[..]).await.unwrap();
/// load_segment(&sb, vec![0; 4]).await.unwrap();
///
/// assert_eq!(sb.buffered_len(), 8);
/// assert_eq!(sb.append_count(), 2);
/// # })
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemorySourceBuffer {
    inner: Arc<Inner>,
}

impl MemorySourceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a new `MemorySourceBuffer` rejecting any append which would make it hold more than `quota` bytes.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                quota: Some(quota),
                ..Default::default()
            }),
        }
    }

    /// Return a copy of all the data accepted so far.
    pub fn buffered(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.state.lock().unwrap().buffered)
    }

    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.inner.state.lock().unwrap().buffered.len()
    }

    /// Return the number of appends accepted so far.
    #[inline]
    pub fn append_count(&self) -> usize {
        self.inner.state.lock().unwrap().appends
    }

    #[inline]
    pub fn is_updating(&self) -> bool {
        self.inner.state.lock().unwrap().updating
    }

    /// Abort the pending append, if any.
    ///
    /// Its data is discarded, and both `abort` and `updateend` events are fired.
    pub fn abort(&self) {
        let aborted = {
            let mut state = self.inner.state.lock().unwrap();
            let aborted = state.updating;

            if aborted {
                state.updating = false;
                state.generation = state.generation.wrapping_add(1);
            }

            aborted
        };

        if aborted {
            tracing::debug!("Aborting pending append...");

            self.inner.events.dispatch(SourceBufferEvent::Abort);
            self.inner.events.dispatch(SourceBufferEvent::UpdateEnd);
        }
    }
}

impl SourceBuffer for MemorySourceBuffer {
    fn append_buffer(&self, data: Bytes) -> Result<(), AppendError> {
        let generation = {
            let mut state = self.inner.state.lock().unwrap();

            if state.updating {
                return Err(AppendError::InvalidState);
            }

            state.updating = true;
            state.generation
        };

        self.inner.events.dispatch(SourceBufferEvent::UpdateStart);

        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            tokio::task::yield_now().await;

            let accepted = {
                let mut state = inner.state.lock().unwrap();

                // aborted in the meantime
                if !state.updating || state.generation != generation {
                    return;
                }

                state.updating = false;

                if inner.quota.is_some_and(|quota| state.buffered.len() + data.len() > quota) {
                    false
                } else {
                    state.buffered.extend_from_slice(&data);
                    state.appends += 1;
                    true
                }
            };

            if accepted {
                tracing::trace!("Appended {} bytes", data.len());

                inner.events.dispatch(SourceBufferEvent::Update);
            } else {
                tracing::debug!("Rejected {} bytes exceeding quota", data.len());

                inner.events.dispatch(SourceBufferEvent::Error);
            }

            inner.events.dispatch(SourceBufferEvent::UpdateEnd);
        });

        Ok(())
    }

    #[inline]
    fn events(&self) -> &EventTarget<SourceBufferEvent> {
        &self.inner.events
    }
}

impl Sink for MemorySourceBuffer {
    #[inline]
    fn append_and_await(&mut self, buffer: Bytes) -> impl Future<Output = Result<(), AppendError>> + Send {
        load_segment(&*self, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A source buffer acknowledging appends synchronously with predefined events.
    struct Scripted {
        events: EventTarget<SourceBufferEvent>,
        script: Vec<SourceBufferEvent>,
    }

    impl SourceBuffer for Scripted {
        fn append_buffer(&self, _: Bytes) -> Result<(), AppendError> {
            for event in &self.script {
                self.events.dispatch(*event);
            }
            Ok(())
        }

        fn events(&self) -> &EventTarget<SourceBufferEvent> {
            &self.events
        }
    }

    #[tokio::test]
    async fn test_load_segment_outcomes() {
        let scripted = |outcome| Scripted {
            events: EventTarget::default(),
            script: vec![outcome],
        };

        let sb = scripted(SourceBufferEvent::Update);
        assert!(load_segment(&sb, Bytes::new()).await.is_ok());
        let sb = scripted(SourceBufferEvent::Error);
        assert!(matches!(load_segment(&sb, Bytes::new()).await, Err(AppendError::Rejected)));
        let sb = scripted(SourceBufferEvent::Abort);
        assert!(matches!(load_segment(&sb, Bytes::new()).await, Err(AppendError::Aborted)));

        for name in ["update", "error", "abort"] {
            assert_eq!(sb.events.listener_count(name), 0);
        }
    }

    #[tokio::test]
    async fn test_load_segment_ignores_lifecycle_events() {
        use SourceBufferEvent::*;

        let sb = Scripted {
            events: EventTarget::default(),
            script: vec![UpdateStart, UpdateEnd, Update, UpdateEnd],
        };
        assert!(load_segment(&sb, Bytes::new()).await.is_ok());

        let sb = Scripted {
            events: EventTarget::default(),
            script: vec![UpdateStart, Error, UpdateEnd],
        };
        assert!(matches!(load_segment(&sb, Bytes::new()).await, Err(AppendError::Rejected)));
    }

    #[tokio::test]
    async fn test_load_segment_unsubscribes_on_sync_failure() {
        let sb = MemorySourceBuffer::new();
        sb.append_buffer(Bytes::from_static(b"pending")).unwrap();

        let err = load_segment(&sb, &b"overlap"[..]).await.unwrap_err();

        assert!(matches!(err, AppendError::InvalidState), "{err:?}");
        assert_eq!(sb.events().listener_count("update"), 0);
        assert_eq!(sb.events().listener_count("error"), 0);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_memory_source_buffer() {
        let mut sb = MemorySourceBuffer::new();

        let update_end = sb.events().once(SourceBufferEvent::UPDATE_END);
        sb.append_and_await(Bytes::from_static(b"init")).await.unwrap();
        assert_eq!(update_end.await, Ok(SourceBufferEvent::UpdateEnd));

        sb.append_and_await(Bytes::from_static(b"seg1")).await.unwrap();

        assert!(!sb.is_updating());
        assert_eq!(sb.append_count(), 2);
        assert_eq!(sb.buffered(), Bytes::from_static(b"initseg1"));
    }

    #[tokio::test]
    async fn test_memory_source_buffer_rejects_overlap() {
        let sb = MemorySourceBuffer::new();

        sb.append_buffer(Bytes::from_static(b"first")).unwrap();
        assert!(sb.is_updating());
        assert!(matches!(sb.append_buffer(Bytes::from_static(b"second")), Err(AppendError::InvalidState)));

        sb.events().once(SourceBufferEvent::UPDATE).await.unwrap();
        assert_eq!(sb.buffered(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn test_memory_source_buffer_quota() {
        let mut sb = MemorySourceBuffer::with_quota(6);

        sb.append_and_await(Bytes::from_static(b"1234")).await.unwrap();
        let err = sb.append_and_await(Bytes::from_static(b"567")).await.unwrap_err();

        assert!(matches!(err, AppendError::Rejected), "{err:?}");
        assert!(!sb.is_updating());
        assert_eq!(sb.buffered_len(), 4);

        sb.append_and_await(Bytes::from_static(b"56")).await.unwrap();
        assert_eq!(sb.buffered_len(), 6);
    }

    #[tokio::test]
    async fn test_memory_source_buffer_abort() {
        let sb = MemorySourceBuffer::new();

        let mut pending = Box::pin(load_segment(&sb, &b"dropped"[..]));
        assert!(futures::poll!(&mut pending).is_pending());
        assert!(sb.is_updating());

        sb.abort();
        let result = pending.await;

        assert!(matches!(result, Err(AppendError::Aborted)), "{result:?}");

        // let the superseded append task run
        tokio::task::yield_now().await;

        assert_eq!(sb.buffered_len(), 0);
        assert_eq!(sb.append_count(), 0);
        assert!(!sb.is_updating());
    }
}
