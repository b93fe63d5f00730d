//! Gated status cell.
//!
//! A [`GatedCell`] holds a value that observers read with [`get`](GatedCell::get)
//! and follow through value listeners. While the cell is *locked*, readers see
//! a constant frozen substitute instead, writers keep updating the real value
//! silently, and value listeners are held back. On unlock the listeners fire
//! once, with the value from before the lock and the value current at unlock.
//!
//! The lock can be owned by the cell itself or *delegated*: a cell bound to
//! another [`Lockable`] mirrors that one's lock state, reports every lock edge
//! of the delegate to its own lock listeners, and refuses to be locked or
//! unlocked directly. Binding is how the fleet status borrows the lock
//! lifecycle of one terminal while a result of that terminal is handled.
//!
//! # Examples
//!
//! ```
//! use cardgate_fleet::GatedCell;
//!
//! let cell = GatedCell::new("ready", "please wait");
//! cell.lock().unwrap();
//! cell.set("done");
//!
//! assert_eq!(cell.get(), "please wait");
//! assert_eq!(cell.real(), "done");
//!
//! cell.unlock().unwrap();
//! assert_eq!(cell.get(), "done");
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::CellError;

/// Value listener, called with `(old, new)`.
pub type ValueListener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// Lock listener, called with the new lock state on every edge.
pub type LockListener = Arc<dyn Fn(bool) + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Registration handle returned when a listener is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Something with a lock lifecycle that other cells can be bound to.
pub trait Lockable: Send + Sync {
    /// Whether the lock is held.
    fn is_locked(&self) -> bool;

    /// Register a listener for lock edges.
    fn add_lock_listener(&self, listener: LockListener) -> ListenerId;

    /// Remove a lock listener. Returns `false` if it was not registered.
    fn remove_lock_listener(&self, id: ListenerId) -> bool;

    /// Take the lock.
    fn lock(&self) -> Result<(), CellError>;

    /// Release the lock.
    fn unlock(&self) -> Result<(), CellError>;
}

struct Delegate {
    target: Arc<dyn Lockable>,
    forward: ListenerId,
    binding: u64,
    locked: bool,
}

struct State<T> {
    value: T,
    locked: bool,
    value_at_lock: Option<T>,
    delegate: Option<Delegate>,
    bindings: u64,
    unlock_generation: u64,
    value_listeners: Vec<(ListenerId, ValueListener<T>)>,
    lock_listeners: Vec<(ListenerId, LockListener)>,
}

impl<T: Clone + PartialEq> State<T> {
    fn is_locked(&self) -> bool {
        match &self.delegate {
            Some(delegate) => delegate.locked,
            None => self.locked,
        }
    }

    fn lock_listeners(&self) -> Vec<LockListener> {
        self.lock_listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn value_listeners(&self) -> Vec<ValueListener<T>> {
        self.value_listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    // Called right after the effective lock went from unlocked to locked.
    fn entered_lock(&mut self) -> Notifications<T> {
        self.value_at_lock = Some(self.value.clone());
        Notifications {
            lock_edge: Some((true, self.lock_listeners())),
            change: None,
        }
    }

    // Called right after the effective lock went from locked to unlocked.
    fn left_lock(&mut self) -> Notifications<T> {
        let change = match self.value_at_lock.take() {
            Some(old) if old != self.value => {
                Some((old, self.value.clone(), self.value_listeners()))
            }
            _ => None,
        };
        Notifications {
            lock_edge: Some((false, self.lock_listeners())),
            change,
        }
    }
}

/// Listener calls collected under the state lock and run after it is released.
struct Notifications<T> {
    lock_edge: Option<(bool, Vec<LockListener>)>,
    change: Option<(T, T, Vec<ValueListener<T>>)>,
}

impl<T> Notifications<T> {
    fn none() -> Self {
        Self {
            lock_edge: None,
            change: None,
        }
    }

    fn fire(self) {
        if let Some((locked, listeners)) = self.lock_edge {
            for listener in listeners {
                listener(locked);
            }
        }
        if let Some((old, new, listeners)) = self.change {
            for listener in listeners {
                listener(&old, &new);
            }
        }
    }
}

struct Inner<T> {
    frozen: T,
    state: Mutex<State<T>>,
}

/// Observable value that can be frozen while it is being consumed.
///
/// Cloning yields another handle to the same cell.
pub struct GatedCell<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for GatedCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for GatedCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("GatedCell")
            .field("value", &state.value)
            .field("frozen", &self.inner.frozen)
            .field("locked", &state.locked)
            .field("bound", &state.delegate.is_some())
            .finish()
    }
}

impl<T> GatedCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an unlocked cell holding `value` that shows `frozen` while locked.
    pub fn new(value: T, frozen: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                frozen,
                state: Mutex::new(State {
                    value,
                    locked: false,
                    value_at_lock: None,
                    delegate: None,
                    bindings: 0,
                    unlock_generation: 0,
                    value_listeners: Vec::new(),
                    lock_listeners: Vec::new(),
                }),
            }),
        }
    }

    /// The visible value: the frozen substitute while locked, the real value otherwise.
    pub fn get(&self) -> T {
        self.get_real_or_frozen(false)
    }

    /// Like [`get`](Self::get), but `peek_real` returns the real value even while locked.
    pub fn get_real_or_frozen(&self, peek_real: bool) -> T {
        let state = self.inner.state.lock();
        if !peek_real && state.is_locked() {
            self.inner.frozen.clone()
        } else {
            state.value.clone()
        }
    }

    /// The real value, regardless of the lock.
    pub fn real(&self) -> T {
        self.get_real_or_frozen(true)
    }

    /// The substitute shown while locked.
    pub fn frozen(&self) -> &T {
        &self.inner.frozen
    }

    /// Update the real value.
    ///
    /// Value listeners fire with `(old, new)` if the cell is unlocked and the
    /// value actually changed. While locked the value is stored silently.
    pub fn set(&self, value: T) {
        let notifications = {
            let mut state = self.inner.state.lock();
            if state.value == value {
                return;
            }
            let old = std::mem::replace(&mut state.value, value);
            if state.is_locked() {
                trace!("Value stored while locked");
                return;
            }
            Notifications {
                lock_edge: None,
                change: Some((old, state.value.clone(), state.value_listeners())),
            }
        };
        notifications.fire();
    }

    /// Register a value listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.inner
            .state
            .lock()
            .value_listeners
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a value listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.value_listeners.len();
        state.value_listeners.retain(|(other, _)| *other != id);
        state.value_listeners.len() != before
    }

    /// Whether the cell is locked, directly or through its delegate.
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().is_locked()
    }

    /// Whether the cell is bound to a delegate.
    pub fn is_bound(&self) -> bool {
        self.inner.state.lock().delegate.is_some()
    }

    /// Lock the cell. Locking a locked cell only cancels a pending delayed unlock.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::LockedThroughDelegate`] while the cell is bound.
    pub fn lock(&self) -> Result<(), CellError> {
        let notifications = {
            let mut state = self.inner.state.lock();
            if state.delegate.is_some() {
                return Err(CellError::LockedThroughDelegate);
            }
            state.unlock_generation += 1;
            if state.locked {
                return Ok(());
            }
            state.locked = true;
            state.entered_lock()
        };
        notifications.fire();
        Ok(())
    }

    /// Unlock the cell now, cancelling any pending delayed unlock.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::LockedThroughDelegate`] while the cell is bound.
    pub fn unlock(&self) -> Result<(), CellError> {
        let notifications = {
            let mut state = self.inner.state.lock();
            if state.delegate.is_some() {
                return Err(CellError::LockedThroughDelegate);
            }
            state.unlock_generation += 1;
            if !state.locked {
                return Ok(());
            }
            state.locked = false;
            state.left_lock()
        };
        notifications.fire();
        Ok(())
    }

    /// Unlock the cell once `delay` has elapsed.
    ///
    /// A later [`lock`](Self::lock), [`unlock`](Self::unlock) or
    /// `unlock_after` supersedes this one.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::LockedThroughDelegate`] while the cell is bound and
    /// [`CellError::NoTimer`] when called outside a Tokio runtime.
    pub fn unlock_after(&self, delay: Duration) -> Result<(), CellError> {
        if delay.is_zero() {
            return self.unlock();
        }

        let runtime = tokio::runtime::Handle::try_current().ok();

        let (runtime, generation) = {
            let mut state = self.inner.state.lock();
            if state.delegate.is_some() {
                return Err(CellError::LockedThroughDelegate);
            }
            let Some(runtime) = runtime else {
                return Err(CellError::NoTimer);
            };
            state.unlock_generation += 1;
            (runtime, state.unlock_generation)
        };

        let cell: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = cell.upgrade() {
                GatedCell { inner }.scheduled_unlock(generation);
            }
        });
        Ok(())
    }

    fn scheduled_unlock(&self, generation: u64) {
        let notifications = {
            let mut state = self.inner.state.lock();
            if state.delegate.is_some() || state.unlock_generation != generation || !state.locked {
                return;
            }
            state.locked = false;
            state.left_lock()
        };
        notifications.fire();
    }

    /// Delegate the lock of this cell to `delegate`.
    ///
    /// From now on the cell is locked exactly when the delegate is, and its
    /// lock listeners fire on the delegate's edges.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::AlreadyBound`] if a delegate is already set and
    /// [`CellError::LockedDirectly`] if the cell holds its own lock.
    pub fn bind_locking<L>(&self, delegate: L) -> Result<(), CellError>
    where
        L: Lockable + 'static,
    {
        let target: Arc<dyn Lockable> = Arc::new(delegate);
        let cell = Arc::downgrade(&self.inner);

        let notifications = {
            let mut state = self.inner.state.lock();
            if state.delegate.is_some() {
                return Err(CellError::AlreadyBound);
            }
            if state.locked {
                return Err(CellError::LockedDirectly);
            }

            state.bindings += 1;
            let binding = state.bindings;
            let forward = target.add_lock_listener(Arc::new(move |_locked: bool| {
                if let Some(inner) = cell.upgrade() {
                    GatedCell { inner }.delegate_changed(binding);
                }
            }));
            let locked = target.is_locked();
            state.delegate = Some(Delegate {
                target,
                forward,
                binding,
                locked,
            });

            if locked {
                state.entered_lock()
            } else {
                Notifications::none()
            }
        };
        notifications.fire();
        Ok(())
    }

    /// Drop the delegate and return to an independent, unlocked cell.
    ///
    /// Returns `false` if the cell was not bound.
    pub fn unbind_locking(&self) -> bool {
        let (delegate, notifications) = {
            let mut state = self.inner.state.lock();
            let Some(delegate) = state.delegate.take() else {
                return false;
            };
            let notifications = if delegate.locked {
                state.left_lock()
            } else {
                Notifications::none()
            };
            (delegate, notifications)
        };
        delegate.target.remove_lock_listener(delegate.forward);
        notifications.fire();
        true
    }

    fn delegate_changed(&self, binding: u64) {
        let notifications = {
            let mut state = self.inner.state.lock();
            let Some(delegate) = state.delegate.as_mut() else {
                return;
            };
            if delegate.binding != binding {
                return;
            }
            // Edges may be reported out of order; the delegate itself is the truth.
            let locked = delegate.target.is_locked();
            if delegate.locked == locked {
                return;
            }
            delegate.locked = locked;
            if locked {
                state.entered_lock()
            } else {
                state.left_lock()
            }
        };
        notifications.fire();
    }
}

impl<T> Lockable for GatedCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn is_locked(&self) -> bool {
        GatedCell::is_locked(self)
    }

    fn add_lock_listener(&self, listener: LockListener) -> ListenerId {
        let id = ListenerId::next();
        self.inner.state.lock().lock_listeners.push((id, listener));
        id
    }

    fn remove_lock_listener(&self, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.lock_listeners.len();
        state.lock_listeners.retain(|(other, _)| *other != id);
        state.lock_listeners.len() != before
    }

    fn lock(&self) -> Result<(), CellError> {
        GatedCell::lock(self)
    }

    fn unlock(&self) -> Result<(), CellError> {
        GatedCell::unlock(self)
    }
}
