//! Observable value that can mirror another one.
//!
//! Card-present flags are plain [`Signal<bool>`]s. The fleet flag is bound to
//! one terminal's flag while a result of that terminal is handled, and set
//! from the aggregate of all terminals otherwise.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cell::ListenerId;

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

struct Source<T> {
    signal: Signal<T>,
    binding: u64,
    listener: ListenerId,
}

struct State<T> {
    value: T,
    source: Option<Source<T>>,
    bindings: u64,
    listeners: Vec<(ListenerId, Listener<T>)>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

/// Observable value.
///
/// Cloning yields another handle to the same signal.
///
/// # Examples
///
/// ```
/// use cardgate_fleet::Signal;
///
/// let terminal = Signal::new(false);
/// let fleet = Signal::new(false);
///
/// fleet.bind(&terminal);
/// terminal.set(true);
/// assert!(fleet.get());
///
/// fleet.unbind();
/// fleet.set(false);
/// assert!(terminal.get());
/// ```
pub struct Signal<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Signal")
            .field("value", &state.value)
            .field("bound", &state.source.is_some())
            .finish()
    }
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an unbound signal.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    value,
                    source: None,
                    bindings: 0,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.inner.state.lock().value.clone()
    }

    /// Set the value.
    ///
    /// Ignored while the signal is bound: the source owns the value until
    /// [`unbind`](Self::unbind).
    pub fn set(&self, value: T) {
        let fire = {
            let mut state = self.inner.state.lock();
            if state.source.is_some() {
                return;
            }
            let old = state.value.clone();
            Self::store(old, value, &mut state)
        };
        if let Some(fire) = fire {
            fire();
        }
    }

    /// Register a change listener, called with `(old, new)`.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.inner
            .state
            .lock()
            .listeners
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a change listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(other, _)| *other != id);
        state.listeners.len() != before
    }

    /// Mirror `source` until [`unbind`](Self::unbind).
    ///
    /// The current value of the source is adopted right away. Binding an
    /// already bound signal replaces the previous source.
    pub fn bind(&self, source: &Signal<T>) {
        self.unbind();

        let target = Arc::downgrade(&self.inner);
        let fire = {
            let mut state = self.inner.state.lock();
            state.bindings += 1;
            let binding = state.bindings;

            let listener = source.subscribe(move |_, new| {
                if let Some(inner) = target.upgrade() {
                    Signal { inner }.mirror(binding, new.clone());
                }
            });
            let value = source.get();
            state.source = Some(Source {
                signal: source.clone(),
                binding,
                listener,
            });

            let old = state.value.clone();
            Self::store(old, value, &mut state)
        };
        if let Some(fire) = fire {
            fire();
        }
    }

    /// Stop mirroring. The last mirrored value is kept.
    ///
    /// Returns `false` if the signal was not bound.
    pub fn unbind(&self) -> bool {
        let Some(source) = self.inner.state.lock().source.take() else {
            return false;
        };
        source.signal.unsubscribe(source.listener);
        true
    }

    /// Whether the signal mirrors another one.
    pub fn is_bound(&self) -> bool {
        self.inner.state.lock().source.is_some()
    }

    fn mirror(&self, binding: u64, value: T) {
        let mut state = self.inner.state.lock();
        match &state.source {
            Some(source) if source.binding == binding => {}
            _ => return,
        }
        let old = state.value.clone();
        if let Some(fire) = Self::store(old, value, &mut state) {
            drop(state);
            fire();
        }
    }

    // Stores `value` and returns the listener calls to run once the state lock is released.
    fn store(old: T, value: T, state: &mut State<T>) -> Option<impl FnOnce() + use<T>> {
        if old == value {
            return None;
        }
        state.value = value.clone();
        let listeners: Vec<Listener<T>> = state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
        Some(move || {
            for listener in listeners {
                listener(&old, &value);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_notifies_changes() {
        let signal = Signal::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        signal.subscribe(move |old, new| sink.lock().push((*old, *new)));

        signal.set(true);
        signal.set(true);
        signal.set(false);

        assert_eq!(*seen.lock(), vec![(false, true), (true, false)]);
    }

    #[test]
    fn test_bound_signal_mirrors_source() {
        let source = Signal::new(true);
        let mirror = Signal::new(false);

        mirror.bind(&source);
        assert!(mirror.is_bound());
        assert!(mirror.get());

        source.set(false);
        assert!(!mirror.get());

        mirror.set(true);
        assert!(!mirror.get(), "set is ignored while bound");
    }

    #[test]
    fn test_unbind_stops_mirroring() {
        let source = Signal::new(false);
        let mirror = Signal::new(false);
        mirror.bind(&source);

        source.set(true);
        assert!(mirror.unbind());
        assert!(!mirror.unbind());
        assert!(mirror.get());

        source.set(false);
        assert!(mirror.get());

        mirror.set(false);
        assert!(!mirror.get());
    }

    #[test]
    fn test_rebind_switches_source() {
        let first = Signal::new(1);
        let second = Signal::new(2);
        let mirror = Signal::new(0);

        mirror.bind(&first);
        mirror.bind(&second);
        assert_eq!(mirror.get(), 2);

        first.set(10);
        assert_eq!(mirror.get(), 2);
        second.set(20);
        assert_eq!(mirror.get(), 20);
    }
}
