//! Single-consumer handoff queue fed from interrupt or task context.
//!
//! Items live in a fixed-capacity FIFO guarded by a critical section, so the
//! ISR side never allocates and never blocks. A binary semaphore wakes the
//! consumer. [`HandoffQueue::pop_wait`] checks the FIFO before and after
//! waiting so that an item pushed just before the consumer blocks is never
//! lost.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Deque;

use super::semaphore::BinarySemaphore;
use super::Timeout;

pub const DEFAULT_CAPACITY: usize = 16;

pub struct HandoffQueue<T, const N: usize = DEFAULT_CAPACITY> {
    items: Mutex<CriticalSectionRawMutex, RefCell<Deque<T, N>>>,
    semaphore: BinarySemaphore,
    dropped: AtomicU32,
}

impl<T: Send, const N: usize> HandoffQueue<T, N> {
    pub fn new() -> Option<Self> {
        Some(Self {
            items: Mutex::new(RefCell::new(Deque::new())),
            semaphore: BinarySemaphore::new()?,
            dropped: AtomicU32::new(0),
        })
    }

    /// Shared queue, the usual shape when an ISR sender is handed out.
    pub fn new_shared() -> Option<Arc<Self>> {
        Self::new().map(Arc::new)
    }

    fn enqueue(&self, item: T) -> Result<(), T> {
        let result = self.items.lock(|items| items.borrow_mut().push_back(item));
        if result.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Append from task context and wake the consumer. A full queue hands the item back.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.enqueue(item)?;
        self.semaphore.give();
        Ok(())
    }

    /// Interrupt-context push. Reached through [`IsrSender`] or the GPIO ISR
    /// argument block, which only holds a weak reference to the queue.
    pub fn push_from_isr(&self, item: T) -> Result<(), T> {
        self.enqueue(item)?;
        self.semaphore.give_from_isr();
        Ok(())
    }

    /// Non-blocking pop.
    pub fn pop(&self) -> Option<T> {
        self.items.lock(|items| items.borrow_mut().pop_front())
    }

    /// Pop the front item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, or when woken with nothing to take. Only one
    /// task may consume from a queue.
    pub fn pop_wait(&self, timeout: Timeout) -> Option<T> {
        if let Some(waiting) = self.pop() {
            return Some(waiting);
        }

        if !self.semaphore.take(timeout) {
            return None;
        }

        self.pop()
    }

    pub fn len(&self) -> usize {
        self.items.lock(|items| items.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Items rejected because the queue was full.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn isr_sender(self: &Arc<Self>) -> IsrSender<T, N> {
        IsrSender {
            queue: self.clone(),
        }
    }
}

/// Interrupt-context side of a [`HandoffQueue`]: push only, never blocks.
pub struct IsrSender<T, const N: usize = DEFAULT_CAPACITY> {
    queue: Arc<HandoffQueue<T, N>>,
}

impl<T: Send, const N: usize> IsrSender<T, N> {
    /// Append from interrupt context. A full queue hands the item back.
    pub fn push_from_isr(&self, item: T) -> Result<(), T> {
        self.queue.push_from_isr(item)
    }
}

impl<T, const N: usize> Clone for IsrSender<T, N> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}
