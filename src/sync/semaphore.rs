//! Binary semaphore that can be given from interrupt context.
//!
//! On device this is a FreeRTOS binary semaphore. On the host there are no
//! interrupts, so the ISR give is the task give.

use super::Timeout;

pub(crate) use imp::BinarySemaphore;

#[cfg(target_os = "espidf")]
mod imp {
    use core::ptr;

    use esp_idf_svc::sys::{
        pdTRUE, queueQUEUE_TYPE_BINARY_SEMAPHORE, queueSEND_TO_BACK, vQueueDelete,
        xQueueGenericCreate, xQueueGenericSend, xQueueGiveFromISR, xQueueSemaphoreTake,
        BaseType_t, QueueHandle_t,
    };

    use super::Timeout;

    pub(crate) struct BinarySemaphore {
        handle: QueueHandle_t,
    }

    // FreeRTOS queue handles are safe to use from any task or ISR.
    unsafe impl Send for BinarySemaphore {}
    unsafe impl Sync for BinarySemaphore {}

    impl BinarySemaphore {
        pub(crate) fn new() -> Option<Self> {
            let handle =
                unsafe { xQueueGenericCreate(1, 0, queueQUEUE_TYPE_BINARY_SEMAPHORE as u8) };
            if handle.is_null() {
                None
            } else {
                Some(Self { handle })
            }
        }

        pub(crate) fn give(&self) {
            unsafe {
                xQueueGenericSend(self.handle, ptr::null(), 0, queueSEND_TO_BACK as BaseType_t);
            }
        }

        /// Returns true when a higher-priority task was woken and a yield was requested.
        pub(crate) fn give_from_isr(&self) -> bool {
            let mut woken: BaseType_t = 0;
            unsafe {
                xQueueGiveFromISR(self.handle, &mut woken);
            }
            let yield_requested = woken == pdTRUE as BaseType_t;
            if yield_requested {
                esp_idf_hal::task::do_yield();
            }
            yield_requested
        }

        pub(crate) fn take(&self, timeout: Timeout) -> bool {
            unsafe { xQueueSemaphoreTake(self.handle, timeout.ticks()) == pdTRUE as BaseType_t }
        }
    }

    impl Drop for BinarySemaphore {
        fn drop(&mut self) {
            unsafe { vQueueDelete(self.handle) };
        }
    }
}

#[cfg(not(target_os = "espidf"))]
mod imp {
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::time::Instant;

    use super::Timeout;

    pub(crate) struct BinarySemaphore {
        given: Mutex<bool>,
        cond: Condvar,
    }

    impl BinarySemaphore {
        pub(crate) fn new() -> Option<Self> {
            Some(Self {
                given: Mutex::new(false),
                cond: Condvar::new(),
            })
        }

        pub(crate) fn give(&self) {
            *self.given.lock().unwrap_or_else(PoisonError::into_inner) = true;
            self.cond.notify_one();
        }

        pub(crate) fn give_from_isr(&self) -> bool {
            self.give();
            false
        }

        pub(crate) fn take(&self, timeout: Timeout) -> bool {
            let mut given = self.given.lock().unwrap_or_else(PoisonError::into_inner);
            let deadline = timeout.duration().map(|d| Instant::now() + d);

            while !*given {
                match deadline {
                    None => {
                        given = self.cond.wait(given).unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return false;
                        }
                        given = self
                            .cond
                            .wait_timeout(given, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                }
            }

            *given = false;
            true
        }
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn take_times_out_when_not_given() {
        let sem = BinarySemaphore::new().unwrap();
        assert!(!sem.take(Timeout::from_millis(10)));
    }

    #[test]
    fn gives_latch_once() {
        let sem = BinarySemaphore::new().unwrap();
        sem.give();
        sem.give();
        assert!(sem.take(Timeout::NONE));
        assert!(!sem.take(Timeout::NONE));
    }

    #[test]
    fn give_wakes_blocked_taker() {
        let sem = Arc::new(BinarySemaphore::new().unwrap());
        let taker = {
            let sem = sem.clone();
            std::thread::spawn(move || sem.take(Timeout::after(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(20));
        sem.give_from_isr();
        assert!(taker.join().unwrap());
    }
}
