//! Lock wrappers with scoped access.
//!
//! [`Guarded`] and [`RwGuarded`] wrap a value in a mutex or read-write lock
//! and expose it only through closures, so the lock is released on every
//! exit path (including early returns and panics) and guards can never be
//! held across an `await` or stashed in a struct.

use parking_lot::{Mutex, RwLock};

/// A value protected by a mutex, accessible only through scoped closures.
#[derive(Debug, Default)]
pub struct Guarded<T> {
    inner: Mutex<T>,
}

impl<T> Guarded<T> {
    /// Wrap `value` in a mutex.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Run `f` with exclusive access to the value.
    ///
    /// The lock is held exactly for the duration of `f`.
    pub fn locked<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Clone the current value out from under the lock.
    pub fn cloned(&self) -> T
    where
        T: Clone,
    {
        self.inner.lock().clone()
    }

    /// Consume the wrapper and return the inner value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// A value protected by a read-write lock, accessible only through scoped
/// closures. Use when reads vastly outnumber writes.
#[derive(Debug, Default)]
pub struct RwGuarded<T> {
    inner: RwLock<T>,
}

impl<T> RwGuarded<T> {
    /// Wrap `value` in a read-write lock.
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Run `f` with shared read access to the value.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.read();
        f(&guard)
    }

    /// Run `f` with exclusive write access to the value.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.write();
        f(&mut guard)
    }

    /// Consume the wrapper and return the inner value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
