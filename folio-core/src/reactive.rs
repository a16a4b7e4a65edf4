//! Observable cells and pull-based derived values.
//!
//! `Signal` is push: `set` notifies subscribers synchronously.
//! `Derived` is pull: it stores the dependency stamp it was computed from
//! and recomputes on the next read once the stamp moves.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::locks::{lock, read, write};
use crate::slot::{Disposable, Slot};

struct SignalInner<T> {
    value: RwLock<T>,
    version: AtomicU64,
    changed: Slot<T>,
}

/// Shared observable cell. Clones observe the same value.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Default + Clone + PartialEq + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + PartialEq + 'static> Signal<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                value: RwLock::new(value),
                version: AtomicU64::new(0),
                changed: Slot::new(),
            }),
        }
    }

    pub fn get(&self) -> T {
        read(&self.inner.value).clone()
    }

    /// Borrow the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&read(&self.inner.value))
    }

    /// Store `value`. Subscribers run only when it differs from the old one.
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool {
        if !self.stage(value) {
            return false;
        }
        self.notify();
        true
    }

    /// Store `value` and bump the version without running subscribers.
    /// Pair with [`notify`](Self::notify) once it is safe to call out.
    pub(crate) fn stage(&self, value: T) -> bool {
        let mut current = write(&self.inner.value);
        if *current == value {
            return false;
        }
        *current = value;
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Run subscribers with the current value.
    pub(crate) fn notify(&self) {
        let value = self.get();
        self.inner.changed.emit(&value);
    }

    /// Monotonic change counter, bumped on every effective `set`.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Disposable {
        self.inner.changed.on(listener)
    }

    /// Detach every subscriber. The value stays readable.
    pub fn dispose(&self) {
        self.inner.changed.dispose();
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("value", &*read(&self.inner.value))
            .field("version", &self.inner.version.load(Ordering::Acquire))
            .finish()
    }
}

/// Cache that recomputes when its dependency stamp changes.
///
/// The stamp is whatever the owner can cheaply observe about its inputs,
/// typically a tuple of [`Signal::version`] values.
pub struct Derived<S, T> {
    cache: Mutex<Option<(S, T)>>,
}

impl<S, T> Default for Derived<S, T> {
    fn default() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }
}

impl<S: PartialEq + Copy, T: Clone> Derived<S, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `stamp`, or run `compute` and cache it.
    ///
    /// `compute` runs without the cache lock held, so it may read other
    /// derived values, including ones that depend on this one's owner.
    pub fn get(&self, stamp: S, compute: impl FnOnce() -> T) -> T {
        if let Some((cached_stamp, value)) = lock(&self.cache).as_ref() {
            if *cached_stamp == stamp {
                return value.clone();
            }
        }
        let value = compute();
        *lock(&self.cache) = Some((stamp, value.clone()));
        value
    }

    pub fn invalidate(&self) {
        lock(&self.cache).take();
    }

    pub fn is_dirty(&self, stamp: S) -> bool {
        !matches!(lock(&self.cache).as_ref(), Some((s, _)) if *s == stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_signal_notifies_on_change_only() {
        let signal = Signal::new(1u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _h = signal.subscribe(move |v| s.lock().unwrap().push(*v));

        assert!(signal.set(2));
        assert!(!signal.set(2));
        assert!(signal.set(3));

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
        assert_eq!(signal.version(), 2);
        assert_eq!(signal.get(), 3);
    }

    #[test]
    fn test_staged_value_is_visible_before_notify() {
        let signal = Signal::new(0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _h = signal.subscribe(move |v| s.lock().unwrap().push(*v));

        assert!(signal.stage(4));
        assert!(!signal.stage(4));
        assert_eq!(signal.get(), 4);
        assert_eq!(signal.version(), 1);
        assert!(seen.lock().unwrap().is_empty());

        signal.notify();
        assert_eq!(*seen.lock().unwrap(), vec![4]);
    }

    #[test]
    fn test_signal_clones_share_state() {
        let a = Signal::new(String::from("x"));
        let b = a.clone();
        b.set("y".to_string());
        assert_eq!(a.get(), "y");
        assert_eq!(a.with(|s| s.len()), 1);
    }

    #[test]
    fn test_disposed_signal_stops_notifying() {
        let signal = Signal::new(0u32);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _h = signal.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        signal.dispose();
        signal.set(5);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(signal.get(), 5);
    }

    #[test]
    fn test_derived_recomputes_when_stamp_moves() {
        let derived: Derived<u64, u64> = Derived::new();
        let runs = AtomicUsize::new(0);
        let compute = |v: u64| {
            runs.fetch_add(1, Ordering::SeqCst);
            v * 10
        };

        assert_eq!(derived.get(1, || compute(1)), 10);
        assert_eq!(derived.get(1, || compute(1)), 10);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(derived.is_dirty(2));
        assert_eq!(derived.get(2, || compute(2)), 20);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_derived_invalidate_forces_recompute() {
        let derived: Derived<(u64, u64), &'static str> = Derived::new();
        assert_eq!(derived.get((0, 0), || "first"), "first");
        derived.invalidate();
        assert!(derived.is_dirty((0, 0)));
        assert_eq!(derived.get((0, 0), || "second"), "second");
    }
}
