//! Event bus (component M).
//!
//! A process-wide list of subscribers woken on `net_raise_event`, used to
//! cancel blocking calls (the reference implementation's Ctrl-C handling).
//! Each protocol module subscribes once at `init` time with a closure that
//! walks its PCB table and calls [`crate::sched::SchedCtx::interrupt`] on
//! every live context.

use smallvec::SmallVec;
use std::sync::Mutex;

type Subscriber = Box<dyn Fn() + Send + Sync + 'static>;

/// Most stacks in this crate register a small, fixed number of subscribers
/// (one per protocol module), so the inline capacity avoids a heap
/// allocation in the common case.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<SmallVec<[Subscriber; 4]>>,
}

impl EventBus {
    pub const fn new() -> Self {
        EventBus { subscribers: Mutex::new(SmallVec::new_const()) }
    }

    /// Registers `handler` to run on every future [`EventBus::raise`].
    /// Mirrors `net_event_subscribe`.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribers.lock().expect("event bus poisoned").push(Box::new(handler));
    }

    /// Runs every registered handler. Mirrors `net_raise_event` followed by
    /// the worker's `net_event_handler` dispatch — in this rewrite there is
    /// no separate pseudo-IRQ hop, the handlers run synchronously on the
    /// calling thread (typically the one handling SIGINT, or a test).
    pub fn raise(&self) {
        let subscribers = self.subscribers.lock().expect("event bus poisoned");
        for handler in subscribers.iter() {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn raise_invokes_every_subscriber() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            bus.subscribe(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.raise();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
