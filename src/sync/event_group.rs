//! Event-group bitset signal.
//!
//! Tasks block in [`EventGroup::wait_bits`] until any or all of a mask are
//! set. Bits can be set and cleared from tasks, and from interrupt context
//! through the separate [`IsrEventGroup`] handle.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::Arc;

use super::Timeout;

/// FreeRTOS reserves the top byte of an event group for its own flags.
pub const USABLE_BITS: u32 = 24;
const USABLE_MASK: u32 = (1 << USABLE_BITS) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventBits(u32);

impl EventBits {
    pub const NONE: Self = Self(0);

    pub const fn bit(n: u32) -> Self {
        assert!(n < USABLE_BITS);
        Self(1 << n)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & USABLE_MASK)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn any(&self) -> bool {
        self.0 != 0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether `self`, as observed by a waiter, satisfies a wait on `mask`.
    pub const fn satisfies(&self, mask: Self, wait_for_all: bool) -> bool {
        if wait_for_all {
            self.contains(mask)
        } else {
            self.intersects(mask)
        }
    }
}

impl BitOr for EventBits {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventBits {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventBits {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for EventBits {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0 & USABLE_MASK)
    }
}

impl fmt::Debug for EventBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBits({:#026b})", self.0)
    }
}

/// Result of a blocking wait: the bits seen, and whether the wait condition held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitResult {
    pub bits: EventBits,
    pub success: bool,
}

/// Result of an interrupt-context bit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsrBits {
    /// Bits before the operation was applied.
    pub bits: EventBits,
    pub success: bool,
    /// A higher-priority task was woken; the scheduler was asked to yield.
    pub yield_requested: bool,
}

#[derive(Clone)]
pub struct EventGroup {
    raw: Arc<imp::RawEventGroup>,
}

impl EventGroup {
    pub fn new() -> Option<Self> {
        imp::RawEventGroup::new().map(|raw| Self { raw: Arc::new(raw) })
    }

    pub fn get_bits(&self) -> EventBits {
        self.raw.get()
    }

    /// Returns the bits after setting.
    pub fn set_bits(&self, bits: EventBits) -> EventBits {
        self.raw.set(bits)
    }

    /// Returns the bits before clearing.
    pub fn clear_bits(&self, bits: EventBits) -> EventBits {
        debug_assert!(bits.any());
        self.raw.clear(bits)
    }

    /// Block until all (`wait_for_all`) or any of `mask` is set, or `timeout` passes.
    ///
    /// With `clear_on_exit`, the bits in `mask` are cleared atomically when the
    /// condition was met. `success` reflects the condition, not merely that
    /// the call returned.
    pub fn wait_bits(
        &self,
        mask: EventBits,
        clear_on_exit: bool,
        wait_for_all: bool,
        timeout: Timeout,
    ) -> WaitResult {
        debug_assert!(mask.any());
        let bits = self.raw.wait(mask, clear_on_exit, wait_for_all, timeout);
        WaitResult {
            bits,
            success: bits.satisfies(mask, wait_for_all),
        }
    }

    pub fn isr_handle(&self) -> IsrEventGroup {
        IsrEventGroup {
            raw: self.raw.clone(),
        }
    }
}

/// Interrupt-context side of an [`EventGroup`]. Never blocks.
#[derive(Clone)]
pub struct IsrEventGroup {
    raw: Arc<imp::RawEventGroup>,
}

impl IsrEventGroup {
    pub fn get_bits_from_isr(&self) -> EventBits {
        self.raw.get_from_isr()
    }

    pub fn set_bits_from_isr(&self, bits: EventBits) -> IsrBits {
        self.raw.set_from_isr(bits)
    }

    pub fn clear_bits_from_isr(&self, bits: EventBits) -> IsrBits {
        debug_assert!(bits.any());
        self.raw.clear_from_isr(bits)
    }
}

#[cfg(target_os = "espidf")]
mod imp {
    use core::ffi::c_void;

    use esp_idf_svc::sys::{
        pdFALSE, pdPASS, pdTRUE, vEventGroupClearBitsCallback, vEventGroupDelete,
        vEventGroupSetBitsCallback, xEventGroupClearBits, xEventGroupCreate,
        xEventGroupGetBitsFromISR, xEventGroupSetBits, xEventGroupWaitBits,
        xTimerPendFunctionCallFromISR, BaseType_t, EventGroupHandle_t,
    };

    use super::{EventBits, IsrBits, Timeout};

    pub(super) struct RawEventGroup {
        handle: EventGroupHandle_t,
    }

    // FreeRTOS event groups are designed for concurrent use from tasks and ISRs.
    unsafe impl Send for RawEventGroup {}
    unsafe impl Sync for RawEventGroup {}

    impl RawEventGroup {
        pub(super) fn new() -> Option<Self> {
            let handle = unsafe { xEventGroupCreate() };
            (!handle.is_null()).then_some(Self { handle })
        }

        pub(super) fn get(&self) -> EventBits {
            // xEventGroupGetBits is a macro over a zero-mask clear
            EventBits::from_raw(unsafe { xEventGroupClearBits(self.handle, 0) })
        }

        pub(super) fn set(&self, bits: EventBits) -> EventBits {
            EventBits::from_raw(unsafe { xEventGroupSetBits(self.handle, bits.raw()) })
        }

        pub(super) fn clear(&self, bits: EventBits) -> EventBits {
            EventBits::from_raw(unsafe { xEventGroupClearBits(self.handle, bits.raw()) })
        }

        pub(super) fn wait(
            &self,
            mask: EventBits,
            clear_on_exit: bool,
            wait_for_all: bool,
            timeout: Timeout,
        ) -> EventBits {
            let flag = |b: bool| if b { pdTRUE } else { pdFALSE } as BaseType_t;
            EventBits::from_raw(unsafe {
                xEventGroupWaitBits(
                    self.handle,
                    mask.raw(),
                    flag(clear_on_exit),
                    flag(wait_for_all),
                    timeout.ticks(),
                )
            })
        }

        pub(super) fn get_from_isr(&self) -> EventBits {
            EventBits::from_raw(unsafe { xEventGroupGetBitsFromISR(self.handle) })
        }

        // The FromISR set/clear calls are macros that defer the operation to
        // the timer daemon task; the daemon wakes any waiter once it runs.
        pub(super) fn set_from_isr(&self, bits: EventBits) -> IsrBits {
            self.pend_from_isr(vEventGroupSetBitsCallback, bits)
        }

        pub(super) fn clear_from_isr(&self, bits: EventBits) -> IsrBits {
            self.pend_from_isr(vEventGroupClearBitsCallback, bits)
        }

        fn pend_from_isr(
            &self,
            callback: unsafe extern "C" fn(*mut c_void, u32),
            bits: EventBits,
        ) -> IsrBits {
            let before = self.get_from_isr();
            let mut woken: BaseType_t = pdFALSE as BaseType_t;
            let status = unsafe {
                xTimerPendFunctionCallFromISR(
                    Some(callback),
                    self.handle as *mut c_void,
                    bits.raw(),
                    &mut woken,
                )
            };
            let yield_requested = woken == pdTRUE as BaseType_t;
            if yield_requested {
                esp_idf_hal::task::do_yield();
            }
            IsrBits {
                bits: before,
                success: status == pdPASS as BaseType_t,
                yield_requested,
            }
        }
    }

    impl Drop for RawEventGroup {
        fn drop(&mut self) {
            log::debug!("Deleting event group");
            unsafe { vEventGroupDelete(self.handle) };
        }
    }
}

#[cfg(not(target_os = "espidf"))]
mod imp {
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::time::Instant;

    use super::{EventBits, IsrBits, Timeout};

    pub(super) struct RawEventGroup {
        bits: Mutex<EventBits>,
        changed: Condvar,
    }

    impl RawEventGroup {
        pub(super) fn new() -> Option<Self> {
            Some(Self {
                bits: Mutex::new(EventBits::NONE),
                changed: Condvar::new(),
            })
        }

        pub(super) fn get(&self) -> EventBits {
            *self.bits.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(super) fn set(&self, bits: EventBits) -> EventBits {
            let mut current = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
            *current |= bits;
            self.changed.notify_all();
            *current
        }

        pub(super) fn clear(&self, bits: EventBits) -> EventBits {
            let mut current = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
            let before = *current;
            *current = before & !bits;
            before
        }

        pub(super) fn wait(
            &self,
            mask: EventBits,
            clear_on_exit: bool,
            wait_for_all: bool,
            timeout: Timeout,
        ) -> EventBits {
            let deadline = timeout.duration().map(|d| Instant::now() + d);
            let mut current = self.bits.lock().unwrap_or_else(PoisonError::into_inner);

            loop {
                if current.satisfies(mask, wait_for_all) {
                    let observed = *current;
                    if clear_on_exit {
                        *current = observed & !mask;
                    }
                    return observed;
                }

                current = match deadline {
                    None => self
                        .changed
                        .wait(current)
                        .unwrap_or_else(PoisonError::into_inner),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return *current;
                        }
                        self.changed
                            .wait_timeout(current, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                };
            }
        }

        pub(super) fn get_from_isr(&self) -> EventBits {
            self.get()
        }

        pub(super) fn set_from_isr(&self, bits: EventBits) -> IsrBits {
            let before = self.get();
            self.set(bits);
            IsrBits {
                bits: before,
                success: true,
                yield_requested: false,
            }
        }

        pub(super) fn clear_from_isr(&self, bits: EventBits) -> IsrBits {
            IsrBits {
                bits: self.clear(bits),
                success: true,
                yield_requested: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const A: EventBits = EventBits::bit(0);
    const B: EventBits = EventBits::bit(1);
    const C: EventBits = EventBits::bit(5);

    #[test]
    fn set_clear_and_snapshot() {
        let group = EventGroup::new().unwrap();
        assert_eq!(group.set_bits(A | C), A | C);
        assert_eq!(group.clear_bits(A), A | C);
        assert_eq!(group.get_bits(), C);
    }

    #[test]
    fn wait_any_succeeds_on_first_bit() {
        let group = EventGroup::new().unwrap();
        let waiter = {
            let group = group.clone();
            std::thread::spawn(move || {
                group.wait_bits(A | B, false, false, Timeout::after(Duration::from_secs(5)))
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        group.set_bits(B);

        let result = waiter.join().unwrap();
        assert!(result.success);
        assert!(result.bits.contains(B));
    }

    #[test]
    fn wait_all_needs_every_bit() {
        let group = EventGroup::new().unwrap();
        group.set_bits(A);

        let partial = group.wait_bits(A | B, false, true, Timeout::from_millis(20));
        assert!(!partial.success);
        assert_eq!(partial.bits, A);

        let waiter = {
            let group = group.clone();
            std::thread::spawn(move || {
                group.wait_bits(A | B, true, true, Timeout::after(Duration::from_secs(5)))
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        group.set_bits(B);

        let result = waiter.join().unwrap();
        assert!(result.success);
        assert_eq!(result.bits, A | B);
    }

    #[test]
    fn clear_on_exit_only_clears_the_mask() {
        let group = EventGroup::new().unwrap();
        group.set_bits(A | C);

        let result = group.wait_bits(A, true, false, Timeout::NONE);
        assert!(result.success);
        assert_eq!(group.get_bits(), C);
    }

    #[test]
    fn timed_out_wait_leaves_bits_alone() {
        let group = EventGroup::new().unwrap();
        group.set_bits(C);

        let result = group.wait_bits(A, true, false, Timeout::from_millis(10));
        assert!(!result.success);
        assert_eq!(group.get_bits(), C);
    }

    #[test]
    fn isr_handle_wakes_task_waiter() {
        let group = EventGroup::new().unwrap();
        let isr = group.isr_handle();

        let waiter = {
            let group = group.clone();
            std::thread::spawn(move || group.wait_bits(C, true, false, Timeout::FOREVER))
        };
        std::thread::sleep(Duration::from_millis(20));

        let result = isr.set_bits_from_isr(C);
        assert!(result.success);
        assert!(!result.bits.contains(C));
        assert!(waiter.join().unwrap().success);

        isr.set_bits_from_isr(A);
        assert_eq!(isr.clear_bits_from_isr(A).bits, A);
        assert_eq!(isr.get_bits_from_isr(), EventBits::NONE);
    }

    #[test]
    fn satisfies_matches_wait_modes() {
        assert!((A | B).satisfies(A | B, true));
        assert!(!A.satisfies(A | B, true));
        assert!(A.satisfies(A | B, false));
        assert!(!C.satisfies(A | B, false));
    }
}
