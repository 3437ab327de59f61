// Session-scoped observer primitive and the events that flow through it.
//
// `EventEmitter<E>` replaces process-wide static delegates: subscribers are
// owned by one controller and dropped with it (or explicitly with `clear`).
// Emission is synchronous, in subscription order.
//
// `SyncEvent`s are produced by the synchronizers into the session context's
// event queue; the controller drains that queue after each tick and forwards
// each event to the scene downloader (where relevant) and to UI subscribers
// wrapped in `UiEvent::Sync`.

use serde_json::Value;

use terrainview_protocol::types::{JoinCode, PeerId};

use crate::context::Role;
use crate::error::UiMessage;
use crate::variables::VariableId;

/// Handle returned by `EventEmitter::subscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Box<dyn FnMut(&E) + Send>;

pub struct EventEmitter<E> {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Callback<E>)>,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&E) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    pub fn emit(&mut self, event: &E) {
        for (_, callback) in &mut self.subscribers {
            callback(event);
        }
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// A replicated variable took a new value on this peer.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableChange {
    pub id: VariableId,
    pub owner: PeerId,
    /// `None` the first time this peer learns of the variable.
    pub previous: Option<Value>,
    pub current: Value,
}

/// Something the synchronizers want the rest of the application to know.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// Load a pre-packaged dataset directly.
    LoadSample { url: String },
    /// Fetch a dataset out of band; terrain sync is `Streaming` until the
    /// downloader reports `Done`.
    BeginDownload { url: String },
    /// The client received the host's terrain and is now in the shared view.
    EnteredSharedView,
    LayerChanged {
        field: String,
        value: f32,
        enabled: bool,
    },
    VariableChanged(VariableChange),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    PinPlaced { sequence: u32 },
    PinsRemoved { sequences: Vec<u32> },
    PinsCleared,
    PinsVisible(bool),
    /// The host closed the session.
    SessionEnded { reason: String },
}

/// Events delivered to UI subscribers of the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    SessionStarted {
        role: Role,
        join_code: JoinCode,
    },
    SessionEnded,
    Error(UiMessage),
    Sync(SyncEvent),
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn subscribers_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut emitter = EventEmitter::<u32>::new();
        let a = seen.clone();
        emitter.subscribe(move |v| a.lock().unwrap().push(("a", *v)));
        let b = seen.clone();
        emitter.subscribe(move |v| b.lock().unwrap().push(("b", *v)));

        emitter.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let count = Arc::new(Mutex::new(0));
        let mut emitter = EventEmitter::<()>::new();
        let c = count.clone();
        let id = emitter.subscribe(move |_| *c.lock().unwrap() += 1);

        emitter.emit(&());
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        emitter.emit(&());
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(emitter.is_empty());
    }

    #[test]
    fn clear_drops_everyone() {
        let mut emitter = EventEmitter::<u8>::new();
        emitter.subscribe(|_| {});
        emitter.subscribe(|_| {});
        assert_eq!(emitter.len(), 2);
        emitter.clear();
        assert!(emitter.is_empty());
    }
}
