//! Bridges the push-based discovery feed to callers waiting for a property.
//!
//! One [`SubscriptionManager`] exists per [`PropertyKind`]. It keeps a waiter
//! queue per property name, registers interest upstream at most once per
//! name, and runs the kind's handlers on the event queue whenever discovery
//! delivers data.

use crate::error::HandlerError;
use crate::executor::{catch, PropertyEventExecutor};
use crate::properties::PropertyKind;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// Invoked once the property it waits for has been delivered (or removed).
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// The discovery feed for one property kind.
///
/// After `register`, the source reports the current value of every name
/// through [`PropertySubscriber::on_initialize`] (with `None` if it has no
/// data) and later changes through `on_add`/`on_remove`.
pub trait PropertySource<T>: Send + Sync {
    fn register(&self, names: &[String], subscriber: PropertySubscriber<T>);

    fn unregister(&self, names: &[String], subscriber: &PropertySubscriber<T>);
}

/// Closable queue of callbacks waiting for the first delivery of a property.
struct WaiterQueue {
    // `None` once closed.
    pending: Mutex<Option<Vec<Callback>>>,
}

impl WaiterQueue {
    fn new() -> Self {
        Self {
            pending: Mutex::new(Some(Vec::new())),
        }
    }

    /// Hands the callback back if the queue is already closed.
    fn push(&self, callback: Callback) -> Result<(), Callback> {
        match self.pending.lock().as_mut() {
            Some(pending) => {
                pending.push(callback);
                Ok(())
            }
            None => Err(callback),
        }
    }

    fn close(&self) -> Vec<Callback> {
        self.pending.lock().take().unwrap_or_default()
    }

    fn is_closed(&self) -> bool {
        self.pending.lock().is_none()
    }
}

pub(crate) type PutHandler<T> = Box<dyn Fn(&str, Option<T>) -> Result<(), HandlerError> + Send + Sync>;
pub(crate) type RemoveHandler = Box<dyn Fn(&str) + Send + Sync>;

struct Inner<T> {
    kind: PropertyKind,
    waiters: DashMap<String, Arc<WaiterQueue>>,
    source: Arc<dyn PropertySource<T>>,
    executor: PropertyEventExecutor,
    on_put: PutHandler<T>,
    on_remove: RemoveHandler,
}

/// Waiter queues and handlers of one property kind.
pub struct SubscriptionManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> fmt::Debug for SubscriptionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("kind", &self.inner.kind)
            .field("waiters", &self.inner.waiters.len())
            .finish()
    }
}

impl<T: Send + 'static> SubscriptionManager<T> {
    pub(crate) fn new(
        kind: PropertyKind,
        source: Arc<dyn PropertySource<T>>,
        executor: PropertyEventExecutor,
        on_put: PutHandler<T>,
        on_remove: RemoveHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                waiters: DashMap::new(),
                source,
                executor,
                on_put,
                on_remove,
            }),
        }
    }

    /// Make sure discovery is asked for `name` and run `callback` once a value
    /// for it has been delivered.
    ///
    /// Only the caller creating the waiter queue registers upstream, and it
    /// does so after queueing its callback so the first delivery cannot be
    /// missed. Once the queue is closed the callback runs right away.
    pub fn ensure_listening(&self, name: &str, callback: Callback) {
        // The map guard must be released before the callback or the source
        // can run: either may call back into this manager.
        let (queue, registrar) = match self.inner.waiters.entry(name.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let queue = Arc::new(WaiterQueue::new());
                entry.insert(queue.clone());
                (queue, true)
            }
        };

        if let Err(callback) = queue.push(callback) {
            callback();
        }

        if registrar {
            tracing::debug!(kind = %self.inner.kind, name, "registering with discovery");
            self.inner
                .source
                .register(&[name.to_string()], self.subscriber());
        }
    }

    /// Whether a value for `name` has been delivered since listening started.
    pub fn is_listening(&self, name: &str) -> bool {
        self.inner
            .waiters
            .get(name)
            .map_or(false, |queue| queue.is_closed())
    }

    /// Unregister from discovery, unless a registration for `name` is still
    /// waiting for its first value. `callback` always runs.
    pub fn try_stop_listening(&self, name: &str, callback: Callback) {
        if self
            .inner
            .waiters
            .remove_if(name, |_, queue| queue.is_closed())
            .is_some()
        {
            tracing::debug!(kind = %self.inner.kind, name, "unregistering from discovery");
            self.inner
                .source
                .unregister(&[name.to_string()], &self.subscriber());
        } else {
            tracing::debug!(kind = %self.inner.kind, name, "not listening or registration in flight, ignoring stop");
        }
        callback();
    }

    /// Number of names with a waiter queue.
    pub fn listen_count(&self) -> usize {
        self.inner.waiters.len()
    }

    /// The handle discovery uses to deliver events to this manager.
    pub fn subscriber(&self) -> PropertySubscriber<T> {
        PropertySubscriber {
            kind: self.inner.kind,
            inner: Arc::downgrade(&self.inner),
            executor: self.inner.executor.clone(),
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    fn handle_put(&self, name: &str, value: Option<T>) {
        match catch(|| (self.on_put)(name, value)) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(kind = %self.kind, name, error = %error, "failed to apply property update")
            }
            Err(panic) => {
                tracing::error!(kind = %self.kind, name, panic = %panic, "property handler panicked")
            }
        }
        self.release_waiters(name);
    }

    fn handle_remove(&self, name: &str) {
        if let Err(panic) = catch(|| (self.on_remove)(name)) {
            tracing::error!(kind = %self.kind, name, panic = %panic, "property removal handler panicked");
        }
        self.release_waiters(name);
    }

    /// Close the queue of `name` and run every callback it held. The closed
    /// queue stays in place until listening stops.
    fn release_waiters(&self, name: &str) {
        let queue = match self.waiters.get(name) {
            Some(queue) => queue.clone(),
            None => return,
        };
        for callback in queue.close() {
            if let Err(panic) = catch(callback) {
                tracing::error!(kind = %self.kind, name, panic = %panic, "waiter callback panicked");
            }
        }
    }
}

/// Handed to a [`PropertySource`] on registration. Every event it receives
/// is queued on the event-processing task.
pub struct PropertySubscriber<T> {
    kind: PropertyKind,
    inner: Weak<Inner<T>>,
    executor: PropertyEventExecutor,
}

impl<T> Clone for PropertySubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            inner: self.inner.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<T> fmt::Debug for PropertySubscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySubscriber")
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T: Send + 'static> PropertySubscriber<T> {
    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Whether both handles deliver to the same manager.
    pub fn same_subscriber(&self, other: &PropertySubscriber<T>) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }

    /// The first value for `name` after registration, `None` if discovery has no data.
    pub fn on_initialize(&self, name: &str, value: Option<T>) {
        tracing::debug!(kind = %self.kind, name, has_value = value.is_some(), "initialize");
        self.put(name, value);
    }

    pub fn on_add(&self, name: &str, value: Option<T>) {
        tracing::debug!(kind = %self.kind, name, has_value = value.is_some(), "add");
        self.put(name, value);
    }

    pub fn on_remove(&self, name: &str) {
        tracing::debug!(kind = %self.kind, name, "remove");
        let inner = self.inner.clone();
        let name = name.to_string();
        self.executor.execute(move || {
            if let Some(inner) = inner.upgrade() {
                inner.handle_remove(&name);
            }
        });
    }

    fn put(&self, name: &str, value: Option<T>) {
        let inner = self.inner.clone();
        let name = name.to_string();
        self.executor.execute(move || {
            if let Some(inner) = inner.upgrade() {
                inner.handle_put(&name, value);
            }
        });
    }
}
