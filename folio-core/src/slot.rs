//! Event slots and subscription handles.
//!
//! ```text
//!  emitter ──emit(&T)──▸ Slot<T> ──▸ listener 1
//!                                 ──▸ listener 2
//!                           │
//!                      Disposable (per listener)
//! ```
//!
//! Listeners are cloned out of the registry before dispatch, so a listener
//! may subscribe, unsubscribe or emit on the same slot without deadlocking.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::locks::lock;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Teardown = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------
// Disposable
// ---------------------------------------------------------------

/// Handle that tears down one subscription.
///
/// Dropping the handle does **not** unsubscribe; call [`Disposable::dispose`].
/// Disposing twice is a no-op.
pub struct Disposable {
    teardown: Mutex<Option<Teardown>>,
}

impl Disposable {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Mutex::new(Some(Box::new(teardown))),
        }
    }

    /// A handle with nothing to tear down.
    pub fn noop() -> Self {
        Self {
            teardown: Mutex::new(None),
        }
    }

    pub fn dispose(&self) {
        let teardown = lock(&self.teardown).take();
        if let Some(f) = teardown {
            f();
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.teardown).is_none()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A bag of handles disposed together.
///
/// Handles added after the group was disposed are disposed immediately.
#[derive(Default)]
pub struct DisposableGroup {
    items: Mutex<Vec<Disposable>>,
    disposed: AtomicBool,
}

impl DisposableGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, item: Disposable) {
        if self.disposed.load(Ordering::Acquire) {
            item.dispose();
            return;
        }
        lock(&self.items).push(item);
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let items: Vec<Disposable> = lock(&self.items).drain(..).collect();
        for item in items {
            item.dispose();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------
// Slot
// ---------------------------------------------------------------

struct SlotInner<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

/// Multi-listener event emitter.
pub struct Slot<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Slot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a listener. On a disposed slot this returns an
    /// already-disposed handle and the listener is never called.
    pub fn on(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Disposable {
        if self.is_disposed() {
            return Disposable::noop();
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));

        let weak: Weak<SlotInner<T>> = Arc::downgrade(&self.inner);
        Disposable::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.listeners).retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Invoke every listener registered at the time of the call.
    pub fn emit(&self, value: &T) {
        if self.is_disposed() {
            return;
        }
        let snapshot: Vec<Listener<T>> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    /// Drop all listeners and refuse new ones.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        lock(&self.inner.listeners).clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("listeners", &lock(&self.inner.listeners).len())
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

// ---------------------------------------------------------------
// LifecycleSlot
// ---------------------------------------------------------------

/// One-shot notification: dispatches on the first [`fire`](Self::fire) only.
#[derive(Debug, Default)]
pub struct LifecycleSlot {
    slot: Slot<()>,
    fired: AtomicBool,
}

impl LifecycleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, listener: impl Fn(&()) + Send + Sync + 'static) -> Disposable {
        self.slot.on(listener)
    }

    /// Returns `false` (and dispatches nothing) if already fired.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            log::debug!("Lifecycle slot already fired, ignoring");
            return false;
        }
        self.slot.emit(&());
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        self.slot.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&u32) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &u32| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_emit_reaches_all_listeners() {
        let slot = Slot::<u32>::new();
        let (a, la) = counter();
        let (b, lb) = counter();
        let _da = slot.on(la);
        let _db = slot.on(lb);

        slot.emit(&1);
        slot.emit(&2);

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disposed_listener_is_not_called() {
        let slot = Slot::<u32>::new();
        let (count, listener) = counter();
        let handle = slot.on(listener);

        slot.emit(&1);
        handle.dispose();
        handle.dispose();
        slot.emit(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(slot.listener_count(), 0);
        assert!(handle.is_disposed());
    }

    #[test]
    fn test_disposed_slot_ignores_emit_and_on() {
        let slot = Slot::<u32>::new();
        let (count, listener) = counter();
        let _h = slot.on(listener);
        slot.dispose();
        slot.emit(&1);

        let (late, late_listener) = counter();
        let handle = slot.on(late_listener);
        slot.emit(&2);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert!(handle.is_disposed());
    }

    #[test]
    fn test_listener_can_subscribe_during_emit() {
        let slot = Slot::<u32>::new();
        let inner = slot.clone();
        let _h = slot.on(move |_| {
            // Leaked on purpose: only checks that registration does not deadlock.
            let _late = inner.on(|_| {});
        });
        slot.emit(&1);
        assert_eq!(slot.listener_count(), 2);
    }

    #[test]
    fn test_lifecycle_fires_once() {
        let lifecycle = LifecycleSlot::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _h = lifecycle.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(lifecycle.fire());
        assert!(!lifecycle.fire());
        assert!(lifecycle.has_fired());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_group_disposes_everything() {
        let slot = Slot::<u32>::new();
        let group = DisposableGroup::new();
        let (count, l1) = counter();
        group.add(slot.on(l1));
        group.add(slot.on(|_| {}));
        assert_eq!(group.len(), 2);

        group.dispose();
        slot.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(group.is_empty());

        // Late additions are torn down on the spot.
        let (late, l2) = counter();
        group.add(slot.on(l2));
        slot.emit(&2);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }
}
