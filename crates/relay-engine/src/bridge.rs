//! Uniform publish/subscribe over a session transport's raw `(error, payload)`
//! callbacks.
//!
//! Transports offer `on(name, callback)` with no way to remove a callback.
//! On every bind the bridge registers one forwarding callback for each
//! transport event name, tagged with the bind generation. Rebinding bumps the generation,
//! so anything the previous handle still emits is dropped instead of being
//! delivered twice.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use relay_core::errors::TransportError;
use relay_core::events::TransportEventName;
use relay_core::ids::SubscriptionId;
use relay_core::transport::{RawCallback, SessionHandle};

use crate::error::HandlerError;

/// One normalized transport event.
#[derive(Clone, Debug, PartialEq)]
pub struct BridgeEvent {
    pub name: TransportEventName,
    pub payload: Value,
    /// Bind generation of the handle that emitted it.
    pub generation: u64,
}

pub type EventHandler = Arc<dyn Fn(&BridgeEvent) -> Result<(), HandlerError> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    name: TransportEventName,
    handler: EventHandler,
}

#[derive(Default)]
struct Inner {
    subscriptions: Vec<Subscription>,
    next_id: u64,
    generation: u64,
    handle: Option<Arc<dyn SessionHandle>>,
}

#[derive(Clone, Default)]
pub struct SessionEventBridge {
    inner: Arc<Mutex<Inner>>,
}

impl SessionEventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`. Handlers for the same name run in
    /// registration order.
    pub fn subscribe<F>(&self, name: TransportEventName, handler: F) -> SubscriptionId
    where
        F: Fn(&BridgeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = SubscriptionId::from_raw(inner.next_id);
        inner.subscriptions.push(Subscription {
            id,
            name,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove exactly one subscription. Returns `false` when it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id);
        inner.subscriptions.len() != before
    }

    /// Point the bridge at a new handle (or none), keeping every subscription.
    ///
    /// Returns the generation events from `handle` will carry. Binding the
    /// handle that is already bound is a no-op.
    pub fn rebind(&self, handle: Option<Arc<dyn SessionHandle>>) -> u64 {
        let wire = {
            let mut inner = self.inner.lock();
            if let (Some(current), Some(next)) = (&inner.handle, &handle) {
                if same_handle(current, next) {
                    return inner.generation;
                }
            }

            inner.generation += 1;
            inner.handle = handle;
            Wiring {
                handle: inner.handle.clone(),
                generation: inner.generation,
            }
        };
        debug!(generation = wire.generation, bound = wire.handle.is_some(), "bridge rebound");
        let generation = wire.generation;
        self.wire(wire);
        generation
    }

    /// Drop the current handle. Later emissions from it are ignored.
    pub fn detach(&self) -> u64 {
        self.rebind(None)
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn is_bound(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    pub fn subscriber_count(&self, name: TransportEventName) -> usize {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.name == name)
            .count()
    }

    // Registration happens outside the lock: a transport may emit from
    // inside `on`.
    fn wire(&self, wire: Wiring) {
        let Some(handle) = wire.handle else { return };
        for name in TransportEventName::ALL {
            handle.on(name, self.forwarder(name, wire.generation));
        }
    }

    fn forwarder(&self, name: TransportEventName, generation: u64) -> RawCallback {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |error, payload| dispatch(&inner, name, generation, error, payload))
    }
}

impl Inner {
    fn handlers_for(&self, name: TransportEventName) -> Vec<(SubscriptionId, EventHandler)> {
        self.subscriptions
            .iter()
            .filter(|s| s.name == name)
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect()
    }
}

struct Wiring {
    handle: Option<Arc<dyn SessionHandle>>,
    generation: u64,
}

fn same_handle(a: &Arc<dyn SessionHandle>, b: &Arc<dyn SessionHandle>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn dispatch(
    inner: &Weak<Mutex<Inner>>,
    name: TransportEventName,
    generation: u64,
    error: Option<TransportError>,
    payload: Value,
) {
    let Some(inner) = inner.upgrade() else { return };

    let (event, handlers) = {
        let inner = inner.lock();
        if inner.generation != generation {
            debug!(event = %name, generation, current = inner.generation, "dropping event from replaced session");
            return;
        }
        let event = match error {
            Some(err) => {
                warn!(event = %name, generation, kind = err.error_kind(), error = %err, "transport error");
                BridgeEvent {
                    name: TransportEventName::Error,
                    payload: json!({ "event": name, "message": err.to_string() }),
                    generation,
                }
            }
            None => BridgeEvent {
                name,
                payload,
                generation,
            },
        };
        let handlers = inner.handlers_for(event.name);
        (event, handlers)
    };

    debug!(event = %event.name, generation, subscribers = handlers.len(), "bridging transport event");
    for (id, handler) in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(event = %event.name, subscription = %id, error = %e, "event handler failed");
            }
            Err(_) => {
                error!(event = %event.name, subscription = %id, "event handler panicked");
            }
        }
    }
}
