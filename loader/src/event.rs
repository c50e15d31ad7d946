//! This module provides one-shot event subscriptions as futures.
//!
//! An [`EventTarget`] keeps track of listeners waiting for named events. Subscribing with [`EventTarget::once()`] returns
//! a [`Once`] future owning its subscription: the listener is removed from the target as soon as the event fires, or
//! when the future is dropped beforehand, so that no listener is ever leaked.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{ready, Context, Poll};

use futures::future::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;

type ListenerId = u64;

/// An event which can be dispatched by an [`EventTarget`].
pub trait Event: Clone + Send + 'static {
    /// The name listeners subscribe to.
    fn name(&self) -> &'static str;
}

/// The target has been dropped before the awaited event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event target closed before the event fired")]
pub struct Closed;

#[derive(Debug)]
struct Listeners<E> {
    by_name: HashMap<&'static str, Vec<(ListenerId, oneshot::Sender<E>)>>,
}

impl<E> Listeners<E> {
    fn remove(&mut self, name: &'static str, id: ListenerId) {
        if let Some(listeners) = self.by_name.get_mut(name) {
            listeners.retain(|(listener_id, _)| *listener_id != id);

            if listeners.is_empty() {
                self.by_name.remove(name);
            }
        }
    }
}

/// A registry of one-shot listeners keyed by event name.
///
/// Clones share the same listeners.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use segment_loader::event::{Event, EventTarget};
/// #[derive(Debug, Clone, PartialEq)]
/// struct Loaded(usize);
///
/// impl Event for Loaded {
///     fn name(&self) -> &'static str {
///         "load"
///     }
/// }
///
/// let target = EventTarget::default();
/// let loaded = target.once("load");
///
/// assert_eq!(target.dispatch(Loaded(42)), 1);
/// assert_eq!(loaded.await, Ok(Loaded(42)));
/// assert_eq!(target.listener_count("load"), 0);
/// # })
/// ```
#[derive(Debug)]
pub struct EventTarget<E> {
    listeners: Arc<Mutex<Listeners<E>>>,
}

impl<E> Default for EventTarget<E> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners { by_name: HashMap::new() })),
        }
    }
}

impl<E> Clone for EventTarget<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<E: Event> EventTarget<E> {
    /// Subscribe to the next occurrence of the `name` event.
    ///
    /// The subscription is registered right away, before the returned future is ever polled, so an event dispatched
    /// in between is not missed.
    pub fn once(&self, name: &'static str) -> Once<E> {
        static LISTENER_ID: AtomicU64 = AtomicU64::new(0);
        let id = LISTENER_ID.fetch_add(1, Ordering::Relaxed);

        let (sender, receiver) = oneshot::channel();

        self.listeners
            .lock()
            .unwrap()
            .by_name
            .entry(name)
            .or_default()
            .push((id, sender));

        Once {
            id,
            name,
            receiver,
            target: Arc::downgrade(&self.listeners),
            fired: false,
        }
    }

    /// Dispatch `event` to every listener subscribed to its name and unsubscribe them.
    ///
    /// Return the number of listeners notified.
    pub fn dispatch(&self, event: E) -> usize {
        let name = event.name();
        let listeners = self.listeners.lock().unwrap().by_name.remove(name).unwrap_or_default();

        tracing::trace!("Dispatching `{name}` event to {} listener(s)", listeners.len());

        listeners
            .into_iter()
            .filter_map(|(_, sender)| sender.send(event.clone()).ok())
            .count()
    }

    /// Return the number of listeners currently subscribed to `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.lock().unwrap().by_name.get(name).map_or(0, Vec::len)
    }
}

/// A future resolving with the first occurrence of an event.
///
/// Dropping it before the event fires cancels the subscription.
#[derive(Debug)]
#[must_use = "the subscription is cancelled when dropped"]
pub struct Once<E> {
    id: ListenerId,
    name: &'static str,
    receiver: oneshot::Receiver<E>,
    target: Weak<Mutex<Listeners<E>>>,
    fired: bool,
}

impl<E> Once<E> {
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<E> Future for Once<E> {
    type Output = Result<E, Closed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(self.receiver.poll_unpin(cx));
        self.fired = true;

        Poll::Ready(result.map_err(|_| Closed))
    }
}

impl<E> Drop for Once<E> {
    fn drop(&mut self) {
        if !self.fired {
            if let Some(listeners) = self.target.upgrade() {
                listeners.lock().unwrap().remove(self.name, self.id);
            }
        }
    }
}
