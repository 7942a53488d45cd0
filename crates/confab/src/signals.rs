//! Named signal bus with priority-ordered handlers and veto.
//!
//! Plugins extend core behavior without patching call sites: a rewrite
//! plugin connects to `receiving-im-msg` at [`PRIORITY_HIGHEST`] and mutates
//! the argument struct; an archiver connects at [`PRIORITY_LOWEST`] and only
//! observes. A handler may veto delivery by returning `true`.
//!
//! Emission is re-entrant (handlers may emit), and a handler disconnected
//! mid-emission still finishes the invocation that was already running.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Default handler priority.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Runs before everything else.
pub const PRIORITY_HIGHEST: i32 = 9999;
/// Runs after everything else.
pub const PRIORITY_LOWEST: i32 = -9999;

/// Opaque handle for a connected handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type BoxedHandler = Box<dyn FnMut(&mut dyn Any) -> bool>;

struct Handler {
    id: HandlerId,
    priority: i32,
    seq: u64,
    disconnected: Cell<bool>,
    // Taken out while running so re-entrant emission skips a busy handler
    // instead of aliasing it.
    func: RefCell<Option<BoxedHandler>>,
}

struct Signal {
    arg_type: TypeId,
    handlers: Vec<Rc<Handler>>,
}

#[derive(Default)]
struct BusInner {
    signals: RefCell<HashMap<String, Signal>>,
    next_id: Cell<u64>,
}

/// One signal instance (a namespace of named signals).
///
/// Cloning yields another handle to the same instance.
#[derive(Clone, Default)]
pub struct SignalBus {
    inner: Rc<BusInner>,
}

/// Errors from signal operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal not registered: {0}")]
    Unregistered(String),

    #[error("signal argument type mismatch for {0}")]
    TypeMismatch(String),

    #[error("signal already registered: {0}")]
    AlreadyRegistered(String),
}

pub type Result<T> = std::result::Result<T, SignalError>;

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a signal whose emissions carry a `&mut A`.
    pub fn register<A: 'static>(&self, name: &str) -> Result<()> {
        let mut signals = self.inner.signals.borrow_mut();
        if signals.contains_key(name) {
            return Err(SignalError::AlreadyRegistered(name.into()));
        }
        signals.insert(
            name.to_string(),
            Signal { arg_type: TypeId::of::<A>(), handlers: Vec::new() },
        );
        Ok(())
    }

    /// Remove a signal and every handler attached to it.
    pub fn unregister(&self, name: &str) {
        if let Some(sig) = self.inner.signals.borrow_mut().remove(name) {
            for h in &sig.handlers {
                h.disconnected.set(true);
            }
        }
    }

    /// Whether `name` has been registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.signals.borrow().contains_key(name)
    }

    /// Subscribe at [`PRIORITY_DEFAULT`].
    pub fn connect<A: 'static>(
        &self,
        name: &str,
        handler: impl FnMut(&mut A) -> bool + 'static,
    ) -> Result<HandlerId> {
        self.connect_priority(name, PRIORITY_DEFAULT, handler)
    }

    /// Subscribe with an explicit priority. Higher priorities run first;
    /// equal priorities run in connection order.
    pub fn connect_priority<A: 'static>(
        &self,
        name: &str,
        priority: i32,
        mut handler: impl FnMut(&mut A) -> bool + 'static,
    ) -> Result<HandlerId> {
        let mut signals = self.inner.signals.borrow_mut();
        let sig = signals
            .get_mut(name)
            .ok_or_else(|| SignalError::Unregistered(name.into()))?;
        if sig.arg_type != TypeId::of::<A>() {
            return Err(SignalError::TypeMismatch(name.into()));
        }

        let seq = self.inner.next_id.get();
        self.inner.next_id.set(seq + 1);
        let id = HandlerId(seq);

        let boxed: BoxedHandler = Box::new(move |any| {
            let args = any.downcast_mut::<A>().expect("checked at connect time");
            handler(args)
        });
        let entry = Rc::new(Handler {
            id,
            priority,
            seq,
            disconnected: Cell::new(false),
            func: RefCell::new(Some(boxed)),
        });

        // Keep the list sorted: priority descending, then seq ascending.
        let pos = sig
            .handlers
            .partition_point(|h| h.priority > priority || (h.priority == priority && h.seq < seq));
        sig.handlers.insert(pos, entry);
        Ok(id)
    }

    /// Detach one handler. Idempotent; unknown ids are ignored.
    pub fn disconnect(&self, id: HandlerId) {
        for sig in self.inner.signals.borrow_mut().values_mut() {
            if let Some(h) = sig.handlers.iter().find(|h| h.id == id) {
                h.disconnected.set(true);
            }
            sig.handlers.retain(|h| !h.disconnected.get());
        }
    }

    /// Emit `name`, running handlers in priority order until one vetoes.
    /// Returns `true` when a handler vetoed.
    pub fn emit<A: 'static>(&self, name: &str, args: &mut A) -> Result<bool> {
        let snapshot: Vec<Rc<Handler>> = {
            let signals = self.inner.signals.borrow();
            let sig = signals
                .get(name)
                .ok_or_else(|| SignalError::Unregistered(name.into()))?;
            if sig.arg_type != TypeId::of::<A>() {
                return Err(SignalError::TypeMismatch(name.into()));
            }
            sig.handlers.clone()
        };

        for h in snapshot {
            if h.disconnected.get() {
                continue;
            }
            let Some(mut func) = h.func.borrow_mut().take() else {
                // Busy in an outer emission of the same signal.
                continue;
            };
            let veto = func(args);
            *h.func.borrow_mut() = Some(func);
            if veto {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop every signal and handler. Used at shutdown.
    pub fn clear(&self) {
        let mut signals = self.inner.signals.borrow_mut();
        for sig in signals.values_mut() {
            for h in &sig.handlers {
                h.disconnected.set(true);
            }
        }
        signals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Msg {
        body: String,
        order: Vec<&'static str>,
    }

    #[test]
    fn test_priority_order() {
        let bus = SignalBus::new();
        bus.register::<Msg>("sig").unwrap();
        bus.connect_priority("sig", 0, |m: &mut Msg| {
            m.order.push("low");
            false
        })
        .unwrap();
        bus.connect_priority("sig", 100, |m: &mut Msg| {
            m.order.push("high");
            false
        })
        .unwrap();

        let mut msg = Msg::default();
        assert!(!bus.emit("sig", &mut msg).unwrap());
        assert_eq!(msg.order, ["high", "low"]);
    }

    #[test]
    fn test_equal_priority_registration_order() {
        let bus = SignalBus::new();
        bus.register::<Msg>("sig").unwrap();
        for name in ["first", "second", "third"] {
            bus.connect("sig", move |m: &mut Msg| {
                m.order.push(name);
                false
            })
            .unwrap();
        }
        let mut msg = Msg::default();
        bus.emit("sig", &mut msg).unwrap();
        assert_eq!(msg.order, ["first", "second", "third"]);
    }

    #[test]
    fn test_veto_stops_lower_priority() {
        let bus = SignalBus::new();
        bus.register::<Msg>("sig").unwrap();
        bus.connect_priority("sig", 0, |m: &mut Msg| {
            m.order.push("never");
            false
        })
        .unwrap();
        bus.connect_priority("sig", 100, |_: &mut Msg| true).unwrap();

        let mut msg = Msg::default();
        assert!(bus.emit("sig", &mut msg).unwrap());
        assert!(msg.order.is_empty());
    }

    #[test]
    fn test_handlers_may_mutate() {
        let bus = SignalBus::new();
        bus.register::<Msg>("sig").unwrap();
        bus.connect("sig", |m: &mut Msg| {
            m.body = m.body.to_uppercase();
            false
        })
        .unwrap();
        let mut msg = Msg { body: "hi".into(), order: vec![] };
        bus.emit("sig", &mut msg).unwrap();
        assert_eq!(msg.body, "HI");
    }

    #[test]
    fn test_disconnect_idempotent() {
        let bus = SignalBus::new();
        bus.register::<Msg>("sig").unwrap();
        let id = bus.connect("sig", |_: &mut Msg| false).unwrap();
        bus.disconnect(id);
        bus.disconnect(id);
        let mut msg = Msg::default();
        assert!(!bus.emit("sig", &mut msg).unwrap());
    }

    #[test]
    fn test_disconnect_during_emission() {
        let bus = SignalBus::new();
        bus.register::<Msg>("sig").unwrap();

        let bus2 = bus.clone();
        let second = std::rc::Rc::new(std::cell::Cell::new(None::<HandlerId>));
        let second2 = second.clone();
        bus.connect_priority("sig", 10, move |m: &mut Msg| {
            m.order.push("first");
            if let Some(id) = second2.get() {
                bus2.disconnect(id);
            }
            false
        })
        .unwrap();
        let id = bus
            .connect_priority("sig", 0, |m: &mut Msg| {
                m.order.push("second");
                false
            })
            .unwrap();
        second.set(Some(id));

        let mut msg = Msg::default();
        bus.emit("sig", &mut msg).unwrap();
        // Disconnected before its turn in the same emission: skipped.
        assert_eq!(msg.order, ["first"]);
    }

    #[test]
    fn test_reentrant_emission() {
        let bus = SignalBus::new();
        bus.register::<Msg>("outer").unwrap();
        bus.register::<Msg>("inner").unwrap();

        let bus2 = bus.clone();
        bus.connect("outer", move |m: &mut Msg| {
            let mut inner = Msg::default();
            bus2.emit("inner", &mut inner).unwrap();
            m.order.push("outer");
            false
        })
        .unwrap();
        bus.connect("inner", |m: &mut Msg| {
            m.order.push("inner");
            false
        })
        .unwrap();

        let mut msg = Msg::default();
        bus.emit("outer", &mut msg).unwrap();
        assert_eq!(msg.order, ["outer"]);
    }

    #[test]
    fn test_type_mismatch() {
        let bus = SignalBus::new();
        bus.register::<Msg>("sig").unwrap();
        let mut wrong = 7u32;
        assert_eq!(
            bus.emit("sig", &mut wrong),
            Err(SignalError::TypeMismatch("sig".into()))
        );
    }

    #[test]
    fn test_unregistered() {
        let bus = SignalBus::new();
        let mut msg = Msg::default();
        assert_eq!(
            bus.emit("nope", &mut msg),
            Err(SignalError::Unregistered("nope".into()))
        );
    }
}
