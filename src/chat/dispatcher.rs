// Typed publish/subscribe registry for inbound events

use log::{debug, warn};
use std::collections::HashMap;

use super::protocol::{self, EventKind, InboundEvent};

pub type Handler = Box<dyn FnMut(&InboundEvent) + Send>;

/// Token returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
    next_id: u64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers for the same kind run in registration order.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&InboundEvent) + Send + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers.entry(kind).or_default().push((id, Box::new(handler)));
        debug!("Subscribed handler {:?} to {}", id, kind.wire_name());
        id
    }

    /// Returns false if the handler was not registered under `kind`.
    pub fn unsubscribe(&mut self, kind: EventKind, id: SubscriptionId) -> bool {
        let Some(list) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.handlers.remove(&kind);
        }
        removed
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Fan an already-decoded event out to its handlers. Returns how many ran.
    pub fn publish(&mut self, event: &InboundEvent) -> usize {
        match self.handlers.get_mut(&event.kind()) {
            Some(list) => {
                for (_, handler) in list.iter_mut() {
                    handler(event);
                }
                list.len()
            }
            None => 0,
        }
    }

    /// Decode a raw frame and publish it. Undecodable frames are logged and dropped.
    pub fn dispatch(&mut self, raw: &str) -> Option<InboundEvent> {
        match protocol::decode(raw) {
            Ok(event) => {
                self.publish(&event);
                Some(event)
            }
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                None
            }
        }
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |tag: &'static str| -> Handler {
            let log = log_clone.clone();
            Box::new(move |_event: &InboundEvent| log.lock().unwrap().push(tag.to_string()))
        };
        (log, make)
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let (log, make) = recorder();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe(EventKind::Pong, make("first"));
        dispatcher.subscribe(EventKind::Pong, make("second"));
        dispatcher.subscribe(EventKind::Ack, make("ack"));

        assert!(dispatcher.dispatch(r#"{"type":"pong"}"#).is_some());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_unsubscribe() {
        let (log, make) = recorder();
        let mut dispatcher = EventDispatcher::new();
        let first = dispatcher.subscribe(EventKind::Pong, make("first"));
        dispatcher.subscribe(EventKind::Pong, make("second"));

        assert!(dispatcher.unsubscribe(EventKind::Pong, first));
        assert!(!dispatcher.unsubscribe(EventKind::Pong, first));
        assert!(!dispatcher.unsubscribe(EventKind::Ack, first));

        dispatcher.dispatch(r#"{"type":"pong"}"#);
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
        assert_eq!(dispatcher.handler_count(EventKind::Pong), 1);
    }

    #[test]
    fn test_unknown_type_goes_to_fallback() {
        let (log, make) = recorder();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe(EventKind::Fallback, make("fallback"));
        dispatcher.dispatch(r#"{"type":"something.new","x":1}"#);
        dispatcher.dispatch(r#"{"no_type":true}"#);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_decode_error_invokes_nothing() {
        let (log, make) = recorder();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe(EventKind::Fallback, make("fallback"));
        dispatcher.subscribe(EventKind::Ack, make("ack"));
        assert!(dispatcher.dispatch("{broken").is_none());
        assert!(dispatcher.dispatch(r#"{"type":"ack"}"#).is_none());
        assert!(log.lock().unwrap().is_empty());
    }
}
