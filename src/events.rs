use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::error;
use parking_lot::RwLock;

use crate::errors::RejectionReason;
use crate::transfer::Transfer;

/// Lifecycle notification emitted by the plugin core.
#[derive(Clone, Debug)]
pub enum PluginEvent {
    IncomingPrepare(Transfer),
    IncomingFulfill(Transfer, [u8; 32]),
    IncomingReject(Transfer, RejectionReason),
    IncomingCancel(Transfer),
    OutgoingPrepare(Transfer),
    OutgoingFulfill(Transfer, [u8; 32]),
    OutgoingReject(Transfer, RejectionReason),
    OutgoingCancel(Transfer),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    IncomingPrepare,
    IncomingFulfill,
    IncomingReject,
    IncomingCancel,
    OutgoingPrepare,
    OutgoingFulfill,
    OutgoingReject,
    OutgoingCancel,
}

impl PluginEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PluginEvent::IncomingPrepare(_) => EventKind::IncomingPrepare,
            PluginEvent::IncomingFulfill(..) => EventKind::IncomingFulfill,
            PluginEvent::IncomingReject(..) => EventKind::IncomingReject,
            PluginEvent::IncomingCancel(_) => EventKind::IncomingCancel,
            PluginEvent::OutgoingPrepare(_) => EventKind::OutgoingPrepare,
            PluginEvent::OutgoingFulfill(..) => EventKind::OutgoingFulfill,
            PluginEvent::OutgoingReject(..) => EventKind::OutgoingReject,
            PluginEvent::OutgoingCancel(_) => EventKind::OutgoingCancel,
        }
    }
}

type Observer = Arc<dyn Fn(&PluginEvent) + Send + Sync>;
type Registry = RwLock<HashMap<EventKind, Vec<(u64, Observer)>>>;

/// Per-event observer registry. Observer failures are contained: a panicking
/// observer is logged and the remaining observers still run, so a bad handler
/// can never corrupt a balance update in progress.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe; call
/// `cancel` to remove the observer.
pub struct Subscription {
    id: u64,
    kind: EventKind,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn cancel(self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Some(observers) = registry.write().get_mut(&self.kind) {
                observers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, observer: F) -> Subscription
    where
        F: Fn(&PluginEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(observer)));
        Subscription {
            id,
            kind,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn emit(&self, event: PluginEvent) {
        let observers: Vec<Observer> = {
            let registry = self.registry.read();
            match registry.get(&event.kind()) {
                Some(observers) => observers.iter().map(|(_, o)| o.clone()).collect(),
                None => return,
            }
        };
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                error!("observer for {:?} panicked; continuing", event.kind());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use uuid::Uuid;

    fn transfer() -> Transfer {
        Transfer {
            id: Uuid::new_v4(),
            amount: "1".to_string(),
            execution_condition: [0; 32],
            expires_at: Utc::now(),
            ilp: None,
            custom: BTreeMap::new(),
            from: "a".to_string(),
            to: "b".to_string(),
            ledger: "l.".to_string(),
        }
    }

    #[test]
    fn delivers_to_matching_kind_only() {
        let dispatcher = EventDispatcher::new();
        let prepares = Arc::new(AtomicUsize::new(0));
        let cancels = Arc::new(AtomicUsize::new(0));

        let p = prepares.clone();
        let _sub1 = dispatcher.subscribe(EventKind::IncomingPrepare, move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        let c = cancels.clone();
        let _sub2 = dispatcher.subscribe(EventKind::IncomingCancel, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(PluginEvent::IncomingPrepare(transfer()));
        dispatcher.emit(PluginEvent::IncomingPrepare(transfer()));

        assert_eq!(prepares.load(Ordering::SeqCst), 2);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_subscriptions_stop_firing() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = dispatcher.subscribe(EventKind::OutgoingPrepare, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(PluginEvent::OutgoingPrepare(transfer()));
        sub.cancel();
        dispatcher.emit(PluginEvent::OutgoingPrepare(transfer()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_observer_does_not_stop_the_rest() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _bad = dispatcher.subscribe(EventKind::IncomingFulfill, |_| {
            panic!("misbehaving observer");
        });
        let c = count.clone();
        let _good = dispatcher.subscribe(EventKind::IncomingFulfill, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(PluginEvent::IncomingFulfill(transfer(), [0; 32]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
