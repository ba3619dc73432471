//! In-process event fan-out with a buffer/flush discipline.
//!
//! The receiver pipeline opens a frame around each stanza so subscribers
//! observe its sub-steps (`messages.upsert`, `message-receipt.update`,
//! `creds.update`) as one consistent batch. Emits outside a frame dispatch
//! immediately. Subscribers run synchronously in registration order; a
//! panicking subscriber is isolated and reported, never aborting the frame.

use crate::types::events::Event;
use log::error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F: Fn(&Event) + Send + Sync> EventHandler for F {
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}

pub type ErrorSink = Arc<dyn Fn(String, &'static str) + Send + Sync>;

#[derive(Default)]
struct Frame {
    depth: usize,
    queued: Vec<Event>,
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    frame: Mutex<Frame>,
    error_sink: RwLock<Option<ErrorSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self.error_sink.write().expect("error sink lock") = Some(sink);
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().expect("handler lock").push(handler);
    }

    pub fn has_handlers(&self) -> bool {
        !self.handlers.read().expect("handler lock").is_empty()
    }

    /// Opens a buffering frame; re-entrant.
    pub fn buffer(&self) {
        self.frame.lock().expect("frame lock").depth += 1;
    }

    /// Closes the innermost frame. Closing the outermost frame replays the
    /// queued events in emission order.
    pub fn flush(&self) {
        let drained = {
            let mut frame = self.frame.lock().expect("frame lock");
            if frame.depth == 0 {
                return;
            }
            frame.depth -= 1;
            if frame.depth == 0 {
                std::mem::take(&mut frame.queued)
            } else {
                Vec::new()
            }
        };
        for event in drained {
            self.dispatch_now(&event);
        }
    }

    pub fn dispatch(&self, event: Event) {
        {
            let mut frame = self.frame.lock().expect("frame lock");
            if frame.depth > 0 {
                frame.queued.push(event);
                return;
            }
        }
        self.dispatch_now(&event);
    }

    fn dispatch_now(&self, event: &Event) {
        let handlers = self.handlers.read().expect("handler lock").clone();
        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler.handle_event(event)));
            if result.is_err() {
                let message = "event handler panicked".to_string();
                error!(target: "EventBus", "{message}");
                if let Some(sink) = self.error_sink.read().expect("error sink lock").as_ref() {
                    sink(message, "event-handler");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::events::{OfflineSyncCompleted, OfflineSyncPreview};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn preview(total: i32) -> Event {
        Event::OfflineSyncPreview(OfflineSyncPreview {
            total,
            messages: 0,
            notifications: 0,
            receipts: 0,
        })
    }

    #[test]
    fn emits_outside_a_frame_dispatch_immediately() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.add_handler(Arc::new(move |_: &Event| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));
        bus.dispatch(Event::CredsUpdate);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frame_batches_and_preserves_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        bus.add_handler(Arc::new(move |e: &Event| {
            let tag = match e {
                Event::OfflineSyncPreview(p) => p.total,
                Event::OfflineSyncCompleted(c) => c.count + 100,
                _ => -1,
            };
            order2.lock().unwrap().push(tag);
        }));

        bus.buffer();
        bus.dispatch(preview(1));
        bus.dispatch(preview(2));
        bus.dispatch(Event::OfflineSyncCompleted(OfflineSyncCompleted { count: 3 }));
        assert!(order.lock().unwrap().is_empty(), "queued while buffered");
        bus.flush();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 103]);
    }

    #[test]
    fn nested_frames_flush_only_at_outermost() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.add_handler(Arc::new(move |_: &Event| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.buffer();
        bus.buffer();
        bus.dispatch(Event::CredsUpdate);
        bus.flush();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_abort_the_frame() {
        let bus = EventBus::new();
        let reported = Arc::new(AtomicUsize::new(0));
        let reported2 = reported.clone();
        bus.set_error_sink(Arc::new(move |_msg, _ctx| {
            reported2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.add_handler(Arc::new(|_: &Event| panic!("boom")));
        let survived = Arc::new(AtomicUsize::new(0));
        let survived2 = survived.clone();
        bus.add_handler(Arc::new(move |_: &Event| {
            survived2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.buffer();
        bus.dispatch(Event::CredsUpdate);
        bus.dispatch(Event::CredsUpdate);
        bus.flush();

        assert_eq!(survived.load(Ordering::SeqCst), 2);
        assert_eq!(reported.load(Ordering::SeqCst), 2);
    }
}
