//! Synchronous observer lists.
//!
//! Every notifier in the crate (unit status, frame-ready, description
//! added/removed, chain structure) keeps a [`Listeners`] list and invokes
//! callbacks in registration order on the notifying thread. Callbacks are
//! boxed closures of whatever signature the event needs:
//!
//! ```rust,ignore
//! let mut on_status: Listeners<dyn FnMut(&StatusChange) + Send> = Listeners::new();
//! let id = on_status.subscribe(Box::new(|change| println!("{change:?}")));
//! for cb in on_status.iter_mut() {
//!     cb(&change);
//! }
//! on_status.unsubscribe(id);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Token returned by [`Listeners::subscribe`]; pass it back to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Registration-ordered list of boxed callbacks.
pub struct Listeners<F: ?Sized> {
    entries: Vec<(ListenerId, Box<F>)>,
}

impl<F: ?Sized> Listeners<F> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a callback.
    pub fn subscribe(&mut self, callback: Box<F>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.push((id, callback));
        id
    }

    /// Remove a callback. Returns `false` if the id is unknown.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Callbacks in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<F>> {
        self.entries.iter_mut().map(|(_, cb)| cb)
    }

    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every callback.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for Listeners<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}
