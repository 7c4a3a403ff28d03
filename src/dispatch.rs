//! Inbound dispatch table.
//!
//! Contract: exactly one handler per `type` tag. Registering a second handler
//! for the same tag replaces the first. `ERROR` frames never reach the
//! per-type table; they go to the dedicated error handler.
//!
//! Handlers run on the session task between frames, so they must return
//! quickly. Long work belongs in a spawned task.

use std::collections::HashMap;

use crate::protocol::InboundFrame;

pub type FrameHandler = Box<dyn FnMut(&InboundFrame) + Send>;
pub type ErrorHandler = Box<dyn FnMut(&str) + Send>;

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handled,
    ErrorHandled,
    /// No handler registered for the tag.
    Unhandled,
}

#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, FrameHandler>,
    error_handler: Option<ErrorHandler>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&String> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("HandlerTable")
            .field("kinds", &kinds)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Returns `true` if one was replaced.
    pub fn on(&mut self, kind: impl Into<String>, handler: FrameHandler) -> bool {
        self.handlers.insert(kind.into(), handler).is_some()
    }

    /// Remove the handler for `kind`. Returns `true` if one was registered.
    pub fn off(&mut self, kind: &str) -> bool {
        self.handlers.remove(kind).is_some()
    }

    pub fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn dispatch(&mut self, frame: &InboundFrame) -> Dispatched {
        if let InboundFrame::Error { message } = frame {
            return match self.error_handler.as_mut() {
                Some(handler) => {
                    handler(message);
                    Dispatched::ErrorHandled
                }
                None => Dispatched::Unhandled,
            };
        }
        match self.handlers.get_mut(frame.kind()) {
            Some(handler) => {
                handler(frame);
                Dispatched::Handled
            }
            None => Dispatched::Unhandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn other(kind: &str) -> InboundFrame {
        InboundFrame::Other {
            kind: kind.to_string(),
            body: serde_json::json!({ "type": kind }),
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> FrameHandler {
        let log = Arc::clone(log);
        Box::new(move |frame: &InboundFrame| {
            log.lock().unwrap().push(format!("{tag}:{}", frame.kind()));
        })
    }

    #[test]
    fn test_dispatch_reaches_registered_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = HandlerTable::new();
        table.on("TYPING", recorder(&log, "a"));
        assert_eq!(table.dispatch(&other("TYPING")), Dispatched::Handled);
        assert_eq!(*log.lock().unwrap(), ["a:TYPING"]);
    }

    #[test]
    fn test_later_registration_replaces_earlier() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = HandlerTable::new();
        assert!(!table.on("TYPING", recorder(&log, "first")));
        assert!(table.on("TYPING", recorder(&log, "second")));
        table.dispatch(&other("TYPING"));
        assert_eq!(*log.lock().unwrap(), ["second:TYPING"]);
    }

    #[test]
    fn test_unregistered_kind_is_unhandled() {
        let mut table = HandlerTable::new();
        assert_eq!(table.dispatch(&other("PRESENCE")), Dispatched::Unhandled);
    }

    #[test]
    fn test_off_removes_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = HandlerTable::new();
        table.on("TYPING", recorder(&log, "a"));
        assert!(table.off("TYPING"));
        assert!(!table.off("TYPING"));
        assert_eq!(table.dispatch(&other("TYPING")), Dispatched::Unhandled);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_error_frames_bypass_type_table() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut table = HandlerTable::new();
        table.on("ERROR", recorder(&log, "typed"));
        let sink = Arc::clone(&errors);
        table.on_error(Box::new(move |msg: &str| sink.lock().unwrap().push(msg.to_string())));

        let frame = InboundFrame::Error { message: "denied".into() };
        assert_eq!(table.dispatch(&frame), Dispatched::ErrorHandled);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(*errors.lock().unwrap(), ["denied"]);
    }

    #[test]
    fn test_error_without_handler_is_unhandled() {
        let mut table = HandlerTable::new();
        let frame = InboundFrame::Error { message: "x".into() };
        assert_eq!(table.dispatch(&frame), Dispatched::Unhandled);
    }
}
