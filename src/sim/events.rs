use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::error::DriverError;
use crate::event::{EventBase, EventBus, EventData, EventHandler, HandlerId, ANY_ID};

struct Registration {
    id: HandlerId,
    base: EventBase,
    event_id: i32,
    handler: EventHandler,
}

enum Command {
    Post(EventBase, i32, EventData),
    Flush(Sender<()>),
}

type Registrations = Arc<Mutex<Vec<Registration>>>;

/// Default event loop: events posted from any thread are dispatched in order
/// on one dedicated thread, like the ESP-IDF system event task.
pub struct SimEventLoop {
    registrations: Registrations,
    next_id: AtomicUsize,
    created: AtomicBool,
    sender: Mutex<Option<Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimEventLoop {
    pub fn new() -> Arc<Self> {
        let registrations: Registrations = Arc::new(Mutex::new(Vec::new()));
        let (sender, receiver) = mpsc::channel();

        let thread = {
            let registrations = registrations.clone();
            thread::Builder::new()
                .name("sys_evt".to_string())
                .spawn(move || dispatch(receiver, registrations))
                .ok()
        };
        if thread.is_none() {
            warn!("Event loop thread could not be spawned; events will not be delivered");
        }

        Arc::new(Self {
            registrations,
            next_id: AtomicUsize::new(0),
            created: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(thread),
        })
    }

    pub fn post(&self, base: EventBase, id: i32, data: EventData) {
        if let Some(sender) = self.sender.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = sender.send(Command::Post(base, id, data));
        }
    }

    /// Block until every event posted so far has been dispatched.
    /// Must not be called from a handler.
    pub fn flush(&self) {
        let (ack, done) = mpsc::channel();
        if let Some(sender) = self.sender.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if sender.send(Command::Flush(ack)).is_ok() {
                let _ = done.recv();
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn dispatch(receiver: Receiver<Command>, registrations: Registrations) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Post(base, id, data) => {
                // Handlers run without the lock so they may unregister themselves.
                let matching: Vec<EventHandler> = registrations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .filter(|r| r.base == base && (r.event_id == ANY_ID || r.event_id == id))
                    .map(|r| r.handler.clone())
                    .collect();

                if matching.is_empty() {
                    debug!("{} {} has no handler", base, id);
                }
                for handler in matching {
                    handler(base, id, &data);
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

impl EventBus for SimEventLoop {
    fn create_default_loop(&self) -> Result<(), DriverError> {
        if self.created.swap(true, Ordering::AcqRel) {
            Err(DriverError::INVALID_STATE)
        } else {
            Ok(())
        }
    }

    fn register(
        &self,
        base: EventBase,
        event_id: i32,
        handler: EventHandler,
    ) -> Result<HandlerId, DriverError> {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                base,
                event_id,
                handler,
            });
        Ok(id)
    }

    fn unregister(&self, base: EventBase, event_id: i32, handler: HandlerId) -> Result<(), DriverError> {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| !(r.id == handler && r.base == base && r.event_id == event_id));
        if registrations.len() == before {
            return Err(DriverError::NOT_FOUND);
        }
        Ok(())
    }
}

impl Drop for SimEventLoop {
    fn drop(&mut self) {
        // Closing the channel ends the dispatch thread.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{subscribe, wifi_event};
    use std::sync::atomic::AtomicU32;

    #[test]
    fn any_id_and_specific_registrations() {
        let events = SimEventLoop::new();
        let bus: Arc<dyn EventBus> = events.clone();
        let any = Arc::new(AtomicU32::new(0));
        let start_only = Arc::new(AtomicU32::new(0));

        let _a = {
            let any = any.clone();
            let handler: EventHandler = Arc::new(move |_: EventBase, _: i32, _: &EventData| {
                any.fetch_add(1, Ordering::SeqCst);
            });
            subscribe(&bus, EventBase::Wifi, ANY_ID, handler).unwrap()
        };
        let b = {
            let start_only = start_only.clone();
            let handler: EventHandler = Arc::new(move |_: EventBase, _: i32, _: &EventData| {
                start_only.fetch_add(1, Ordering::SeqCst);
            });
            subscribe(&bus, EventBase::Wifi, wifi_event::STA_START, handler).unwrap()
        };

        events.post(EventBase::Wifi, wifi_event::STA_START, EventData::None);
        events.post(EventBase::Wifi, wifi_event::STA_CONNECTED, EventData::None);
        events.post(EventBase::Ip, 0, EventData::None);
        events.flush();
        assert_eq!(any.load(Ordering::SeqCst), 2);
        assert_eq!(start_only.load(Ordering::SeqCst), 1);

        drop(b);
        assert_eq!(events.handler_count(), 1);
        events.post(EventBase::Wifi, wifi_event::STA_START, EventData::None);
        events.flush();
        assert_eq!(start_only.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_loop_is_created_once() {
        let events = SimEventLoop::new();
        assert_eq!(events.create_default_loop(), Ok(()));
        assert_eq!(events.create_default_loop(), Err(DriverError::INVALID_STATE));
    }
}
