//! Owned background tasks.
//!
//! A [`Task`] runs its body on a dedicated thread (a FreeRTOS task on device,
//! created with the configured name, stack size and priority). The body
//! terminates itself by returning; the owner reaps it by joining, which
//! happens at the latest when the `Task` is dropped.

use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::sync::{EventBits, EventGroup};

/// Reserved in every private event group to ask the owning task to exit.
pub const TASK_STOP_BIT: EventBits = EventBits::bit(23);

#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    pub name: &'static CStr,
    pub stack_size: usize,
    pub priority: u8,
}

impl TaskConfig {
    pub const fn new(name: &'static CStr, stack_size: usize, priority: u8) -> Self {
        Self {
            name,
            stack_size,
            priority,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name.to_str().unwrap_or("task")
    }
}

pub struct Task {
    name: &'static str,
    thread: Option<JoinHandle<()>>,
    finished: Arc<AtomicBool>,
}

// Marks the task finished however the body exits, panics included.
struct FinishedGuard(Arc<AtomicBool>);

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Task {
    pub fn spawn<F>(config: &TaskConfig, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = config.name();
        let finished = Arc::new(AtomicBool::new(false));
        let guard = FinishedGuard(finished.clone());

        platform::apply_spawn_config(config)?;

        let spawned = thread::Builder::new()
            .name(name.to_string())
            .stack_size(config.stack_size)
            .spawn(move || {
                let _guard = guard;
                body();
            });

        platform::reset_spawn_config();

        let thread = spawned.with_context(|| format!("Failed to spawn task '{}'", name))?;
        debug!(
            "Spawned task '{}' (stack {}, priority {})",
            name, config.stack_size, config.priority
        );

        Ok(Self {
            name,
            thread: Some(thread),
            finished,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The body has returned; the thread may still be awaiting its join.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Ask the task to exit through `group` and wait for it.
    pub fn stop(&mut self, group: &EventGroup) {
        if self.thread.is_none() {
            return;
        }
        if !self.is_finished() {
            debug!("Asking task '{}' to stop", self.name);
            group.set_bits(TASK_STOP_BIT);
        }
        self.join();
    }

    /// Reap the thread. A task never joins itself; in that case the thread is detached.
    pub fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        if thread.thread().id() == thread::current().id() {
            debug!("Task '{}' released from its own thread, detaching", self.name);
            return;
        }

        if thread.join().is_err() {
            warn!("Task '{}' panicked", self.name);
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.join();
    }
}

/// Log how much of its stack the calling task has used. Warns above 90%.
pub fn log_stack_usage(config: &TaskConfig) {
    let Some(free) = platform::stack_high_water_mark() else {
        debug!("Task '{}': stack usage not tracked here", config.name());
        return;
    };

    let used = config.stack_size.saturating_sub(free as usize);
    let percent = used as f32 / config.stack_size as f32 * 100.0;
    if percent > 90.0 {
        warn!("Task '{}' stack used: {} bytes ({:.2}%)", config.name(), used, percent);
    } else {
        info!("Task '{}' stack used: {} bytes ({:.2}%)", config.name(), used, percent);
    }
}

#[cfg(target_os = "espidf")]
mod platform {
    use anyhow::Result;
    use esp_idf_svc::hal::task::thread::ThreadSpawnConfiguration;

    use super::TaskConfig;

    pub(super) fn apply_spawn_config(config: &TaskConfig) -> Result<()> {
        ThreadSpawnConfiguration {
            name: Some(config.name.to_bytes_with_nul()),
            stack_size: config.stack_size,
            priority: config.priority,
            ..Default::default()
        }
        .set()?;
        Ok(())
    }

    pub(super) fn reset_spawn_config() {
        if let Err(e) = ThreadSpawnConfiguration::default().set() {
            log::warn!("Failed to restore default thread spawn configuration: {}", e);
        }
    }

    pub(super) fn stack_high_water_mark() -> Option<u32> {
        // Null means the calling task. ESP-IDF reports the mark in bytes.
        Some(unsafe { esp_idf_svc::sys::uxTaskGetStackHighWaterMark(core::ptr::null_mut()) } as u32)
    }
}

#[cfg(not(target_os = "espidf"))]
mod platform {
    use anyhow::Result;

    use super::TaskConfig;

    pub(super) fn apply_spawn_config(_config: &TaskConfig) -> Result<()> {
        Ok(())
    }

    pub(super) fn reset_spawn_config() {}

    pub(super) fn stack_high_water_mark() -> Option<u32> {
        None
    }
}
