//! Fan-out for the four application-visible event points. Subscriptions may
//! be added and removed from any thread; invocation is serialized on the
//! dispatch loop, so a slow handler delays deliveries but never the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::identity::ClientId;

/// Frames delivered to (or refused by) the application, tagged with the
/// owning client's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub client_id: ClientId,
    pub frames: Vec<Vec<u8>>,
}

impl Message {
    /// Convenience view of one frame as UTF-8 text.
    pub fn frame_as_utf8(&self, index: usize) -> Option<&str> {
        self.frames
            .get(index)
            .and_then(|frame| std::str::from_utf8(frame).ok())
    }
}

/// Payload of the `protocol-failed` event point.
#[derive(Debug, Clone)]
pub struct ProtocolFailure {
    pub client_id: ClientId,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    MessageReceived,
    InvalidMessage,
    Established,
    Failed,
}

/// Handle returned by the subscribe calls; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId {
    kind: EventKind,
    id: u64,
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Handlers<T> {
    list: Mutex<Vec<(u64, Handler<T>)>>,
}

impl<T> Handlers<T> {
    fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: u64, handler: Handler<T>) {
        self.list.lock().push((id, handler));
    }

    fn remove(&self, id: u64) -> bool {
        let mut list = self.list.lock();
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    /// Snapshots the list so handlers run without the lock held.
    fn emit(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = self
            .list
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }
}

/// Subscription registry for the four event points.
pub struct EventHub {
    next: AtomicU64,
    message_received: Handlers<Message>,
    invalid_message: Handlers<Message>,
    established: Handlers<ClientId>,
    failed: Handlers<ProtocolFailure>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            message_received: Handlers::new(),
            invalid_message: Handlers::new(),
            established: Handlers::new(),
            failed: Handlers::new(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn on_message_received(
        &self,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.message_received.add(id, Arc::new(handler));
        SubscriptionId {
            kind: EventKind::MessageReceived,
            id,
        }
    }

    pub fn on_invalid_message(
        &self,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.invalid_message.add(id, Arc::new(handler));
        SubscriptionId {
            kind: EventKind::InvalidMessage,
            id,
        }
    }

    pub fn on_protocol_established(
        &self,
        handler: impl Fn(&ClientId) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.established.add(id, Arc::new(handler));
        SubscriptionId {
            kind: EventKind::Established,
            id,
        }
    }

    pub fn on_protocol_failed(
        &self,
        handler: impl Fn(&ProtocolFailure) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.failed.add(id, Arc::new(handler));
        SubscriptionId {
            kind: EventKind::Failed,
            id,
        }
    }

    /// Removes a subscription; false when the handle was already removed.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        match subscription.kind {
            EventKind::MessageReceived => self.message_received.remove(subscription.id),
            EventKind::InvalidMessage => self.invalid_message.remove(subscription.id),
            EventKind::Established => self.established.remove(subscription.id),
            EventKind::Failed => self.failed.remove(subscription.id),
        }
    }

    pub(crate) fn emit_message(&self, message: &Message) {
        self.message_received.emit(message);
    }

    pub(crate) fn emit_invalid(&self, message: &Message) {
        self.invalid_message.emit(message);
    }

    pub(crate) fn emit_established(&self, client_id: &ClientId) {
        self.established.emit(client_id);
    }

    pub(crate) fn emit_failed(&self, failure: &ProtocolFailure) {
        self.failed.emit(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn handlers_fire_until_unsubscribed() {
        let hub = EventHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let subscription = hub.on_message_received(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let message = Message {
            client_id: ClientId::mint(),
            frames: vec![vec![1]],
        };
        hub.emit_message(&message);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(hub.unsubscribe(subscription));
        assert!(!hub.unsubscribe(subscription));
        hub.emit_message(&message);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_points_are_independent() {
        let hub = EventHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        hub.on_protocol_failed(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit_established(&ClientId::mint());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        hub.emit_failed(&ProtocolFailure {
            client_id: ClientId::mint(),
            reason: "denied".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn utf8_frame_view() {
        let message = Message {
            client_id: ClientId::mint(),
            frames: vec![b"text".to_vec(), vec![0xff, 0xfe]],
        };
        assert_eq!(message.frame_as_utf8(0), Some("text"));
        assert_eq!(message.frame_as_utf8(1), None);
        assert_eq!(message.frame_as_utf8(2), None);
    }
}
