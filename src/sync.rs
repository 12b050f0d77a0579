//! A reader-writer lock that shrugs off poisoning.
//!
//! The pool map, the client defaults and the cookie jar only need
//! shared/exclusive access, and a panicked holder must not wedge every
//! later exchange: lock results are unwrapped into the inner guard instead
//! of surfacing `PoisonError`.

use std::ops::{Deref, DerefMut};
use std::sync::{self, PoisonError};

pub(crate) struct RwLock<T>(sync::RwLock<T>);

impl<T> RwLock<T> {
    pub(crate) fn new(value: T) -> RwLock<T> {
        RwLock(sync::RwLock::new(value))
    }

    pub(crate) fn read(&self) -> ReadGuard<'_, T> {
        ReadGuard(self.0.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn write(&self) -> WriteGuard<'_, T> {
        WriteGuard(self.0.write().unwrap_or_else(PoisonError::into_inner))
    }
}

#[must_use]
pub(crate) struct ReadGuard<'a, T>(sync::RwLockReadGuard<'a, T>);

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

#[must_use]
pub(crate) struct WriteGuard<'a, T>(sync::RwLockWriteGuard<'a, T>);

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::RwLock;

    #[test]
    fn survives_a_panicked_writer() {
        let lock = Arc::new(RwLock::new(0u32));

        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.write();
            panic!("dropped while holding the lock");
        })
        .join();

        *lock.write() += 1;
        assert_eq!(*lock.read(), 1);
    }
}
