//! ISR-to-task handoff primitives.
//!
//! Each primitive exposes two disjoint capability types: the task-side type
//! may block, the ISR-side type never blocks and reports whether the
//! scheduler should yield.

pub mod event_group;
pub mod queue;
mod semaphore;

use std::time::Duration;

pub use event_group::{EventBits, EventGroup, IsrBits, IsrEventGroup, WaitResult};
pub use queue::{HandoffQueue, IsrSender};

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(Option<Duration>);

impl Timeout {
    pub const FOREVER: Self = Self(None);
    pub const NONE: Self = Self(Some(Duration::ZERO));

    pub const fn after(duration: Duration) -> Self {
        Self(Some(duration))
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self(Some(Duration::from_millis(ms)))
    }

    pub fn duration(&self) -> Option<Duration> {
        self.0
    }

    pub fn is_forever(&self) -> bool {
        self.0.is_none()
    }

    /// FreeRTOS ticks, `portMAX_DELAY` for forever.
    #[cfg(target_os = "espidf")]
    pub(crate) fn ticks(&self) -> esp_idf_svc::sys::TickType_t {
        use esp_idf_svc::sys::{configTICK_RATE_HZ, TickType_t};

        match self.0 {
            None => TickType_t::MAX,
            Some(d) => {
                let ticks = d.as_millis() * configTICK_RATE_HZ as u128 / 1000;
                ticks.min(TickType_t::MAX as u128 - 1) as TickType_t
            }
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::FOREVER
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::after(duration)
    }
}
