//! Listener registry used by the streams to publish notifications.
//!
//! Emission works on a snapshot of the registered listeners taken before any
//! callback runs, so a listener may subscribe or unsubscribe (on this or any
//! other stream) without deadlocking. Changes take effect from the next
//! emission.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned when subscribing, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A notification carrying its own kind.
pub trait Event {
    type Kind: Copy + Eq + Debug + Send;

    fn kind(&self) -> Self::Kind;
}

/// A subscribed callback.
pub type Listener<E> = Box<dyn FnMut(&E) + Send>;

struct Entry<E: Event> {
    id: ListenerId,
    kind: E::Kind,
    callback: Arc<Mutex<Listener<E>>>,
}

pub(crate) struct Emitter<E: Event> {
    entries: Mutex<Vec<Entry<E>>>,
}

impl<E: Event> Emitter<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn on(&self, kind: E::Kind, callback: Listener<E>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Entry {
            id,
            kind,
            callback: Arc::new(Mutex::new(callback)),
        });
        id
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub(crate) fn listener_count(&self, kind: E::Kind) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    /// Invoke every listener subscribed to the event's kind. Returns how many
    /// listeners were called.
    pub(crate) fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.callback.clone())
            .collect();

        for callback in &snapshot {
            let mut listener = callback.lock();
            (*listener)(event);
        }
        snapshot.len()
    }

    /// Drop every listener. Called once a stream has closed so that callbacks
    /// holding handles to other streams are released.
    pub(crate) fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        drop(entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Ping,
        Pong,
    }

    struct Ping(u32);

    impl Event for Ping {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            if self.0 == 0 {
                Kind::Pong
            } else {
                Kind::Ping
            }
        }
    }

    #[test]
    fn only_matching_listeners_run() {
        let emitter = Emitter::<Ping>::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let pongs = Arc::new(AtomicUsize::new(0));

        let p = pings.clone();
        emitter.on(
            Kind::Ping,
            Box::new(move |ev| {
                p.fetch_add(ev.0 as usize, Ordering::SeqCst);
            }),
        );
        let q = pongs.clone();
        emitter.on(
            Kind::Pong,
            Box::new(move |_| {
                q.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(emitter.emit(&Ping(3)), 1);
        assert_eq!(emitter.emit(&Ping(0)), 1);
        assert_eq!(pings.load(Ordering::SeqCst), 3);
        assert_eq!(pongs.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(Kind::Ping), 1);
    }

    #[test]
    fn listeners_can_unsubscribe_themselves() {
        let emitter = Arc::new(Emitter::<Ping>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None));

        let (e, c, slot) = (emitter.clone(), calls.clone(), own_id.clone());
        let id = emitter.on(
            Kind::Ping,
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *slot.lock() {
                    e.off(id);
                }
            }),
        );
        *own_id.lock() = Some(id);

        emitter.emit(&Ping(1));
        emitter.emit(&Ping(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!emitter.off(id));
    }

    #[test]
    fn clear_drops_everything() {
        let emitter = Emitter::<Ping>::new();
        emitter.on(Kind::Ping, Box::new(|_| {}));
        emitter.on(Kind::Pong, Box::new(|_| {}));
        emitter.clear();
        assert_eq!(emitter.emit(&Ping(1)), 0);
        assert_eq!(emitter.listener_count(Kind::Pong), 0);
    }
}
