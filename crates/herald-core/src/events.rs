//! In-process publish/subscribe for pipeline lifecycle notifications.
//!
//! Delivery is synchronous and in subscription order. Handlers may subscribe
//! or unsubscribe while being dispatched: publishing iterates a snapshot.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    messaging::types::{Fields, Message, StatusUpdate},
    ports::Endpoint,
    service::Service,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeforeSend,
    AfterSend,
    SessionOpened,
    SessionClosed,
    ReceiveMessage,
    StatusCallback,
    ServiceRegistered,
    ServiceUnregistered,
}

/// Lets a `BeforeSend` subscriber take over a send so no driver runs.
#[derive(Debug, Default)]
pub struct Intercept(AtomicBool);

impl Intercept {
    pub fn claim(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub enum Event<'a> {
    BeforeSend {
        service: &'a Service,
        fields: &'a Fields,
        /// The caller forced suppression for this send (an enclosing
        /// manager is suppressed). Does not reflect the service's own flag.
        suppressed: bool,
        intercept: &'a Intercept,
    },
    AfterSend {
        service: &'a Service,
        message: &'a Message,
    },
    SessionOpened {
        service: &'a Service,
    },
    SessionClosed {
        service: &'a Service,
    },
    ReceiveMessage {
        service: &'a Service,
        message: &'a Message,
    },
    StatusCallback {
        service: &'a Service,
        update: &'a StatusUpdate,
    },
    ServiceRegistered {
        manager: &'a str,
        name: &'a str,
        service: &'a Arc<dyn Endpoint>,
    },
    ServiceUnregistered {
        manager: &'a str,
        name: &'a str,
        service: &'a Arc<dyn Endpoint>,
    },
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::BeforeSend { .. } => EventKind::BeforeSend,
            Event::AfterSend { .. } => EventKind::AfterSend,
            Event::SessionOpened { .. } => EventKind::SessionOpened,
            Event::SessionClosed { .. } => EventKind::SessionClosed,
            Event::ReceiveMessage { .. } => EventKind::ReceiveMessage,
            Event::StatusCallback { .. } => EventKind::StatusCallback,
            Event::ServiceRegistered { .. } => EventKind::ServiceRegistered,
            Event::ServiceUnregistered { .. } => EventKind::ServiceUnregistered,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event<'_>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    muted: Mutex<HashMap<EventKind, usize>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide bus shared by every service built without an explicit one.
    pub fn global() -> Arc<EventBus> {
        static GLOBAL: OnceLock<Arc<EventBus>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(EventBus::new())).clone()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event<'_>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn is_muted(&self, kind: EventKind) -> bool {
        self.muted.lock().get(&kind).copied().unwrap_or(0) > 0
    }

    /// Suppress delivery of `kind` until the guard is dropped.
    pub fn muted(&self, kind: EventKind) -> MuteGuard<'_> {
        *self.muted.lock().entry(kind).or_default() += 1;
        MuteGuard { bus: self, kind }
    }

    pub fn publish(&self, event: &Event<'_>) {
        let kind = event.kind();
        if self.is_muted(kind) {
            return;
        }
        let snapshot: Vec<Handler> = match self.handlers.read().get(&kind) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for handler in snapshot {
            handler(event);
        }
    }
}

pub struct MuteGuard<'a> {
    bus: &'a EventBus,
    kind: EventKind,
}

impl Drop for MuteGuard<'_> {
    fn drop(&mut self) {
        let mut muted = self.bus.muted.lock();
        if let Some(count) = muted.get_mut(&self.kind) {
            *count = count.saturating_sub(1);
        }
    }
}
