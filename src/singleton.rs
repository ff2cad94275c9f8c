//! Shared-ownership slot holding at most one live instance of a type.
//!
//! The slot keeps only a weak reference. The first caller of
//! [`Singleton::get_or_try_create`] builds the instance under the slot's lock;
//! later callers get a promoted strong reference while it is alive. When the
//! last strong reference drops the instance is destroyed and the next request
//! builds a fresh one.
//!
//! Arguments passed to the factory are only honoured by the call that actually
//! creates the instance. Callers asking for a reconfigured instance while one
//! is alive get the existing one unchanged.

use std::sync::{Arc, Mutex, PoisonError, Weak};

pub struct Singleton<T> {
    slot: Mutex<Weak<T>>,
}

impl<T> Singleton<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(Weak::new()),
        }
    }

    /// Return the live instance, or build one with `create` while holding the lock.
    pub fn get_or_try_create<E>(
        &self,
        create: impl FnOnce() -> Result<Arc<T>, E>,
    ) -> Result<Arc<T>, E> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slot.upgrade() {
            return Ok(existing);
        }

        let shared = create()?;
        *slot = Arc::downgrade(&shared);
        Ok(shared)
    }

    pub fn get_or_create(&self, create: impl FnOnce() -> Arc<T>) -> Arc<T> {
        match self.get_or_try_create(|| Ok::<_, std::convert::Infallible>(create())) {
            Ok(shared) => shared,
            Err(never) => match never {},
        }
    }

    pub fn get_weak(&self) -> Weak<T> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The live instance, without creating one.
    pub fn get(&self) -> Option<Arc<T>> {
        self.get_weak().upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.get_weak().strong_count() > 0
    }
}

impl<T> Default for Singleton<T> {
    fn default() -> Self {
        Self::new()
    }
}
