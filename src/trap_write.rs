//! Write audit fan-out.
//!
//! Mutating operations pass through a pre/post pair: [`TrapWriteMux::before`]
//! builds a message describing the write and hands it to every registered
//! listener, [`TrapWriteMux::after`] replays the same message in the post
//! phase and releases it. Each listener may stash opaque state into the
//! message during the pre phase; the multiplexer keeps it in a per listener
//! slot and restores it for the post call.
//!
//! Listener callbacks run with the multiplexer lock held. They must not
//! call back into the multiplexer.

use std::any::Any;
use std::sync::{Arc, Mutex};

use warden_api_types::Identity;

use crate::slab::Slab;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapWritePhase {
    /// Called before the write is carried out.
    Before,
    /// Called after the write completed.
    After,
}

/// Description of one mutating operation, shared by the pre and post phase.
pub struct TrapWriteMessage {
    /// Identity of the writing client.
    pub identity: Identity,
    /// Name of the resource being written.
    pub target: String,
    /// Type code of the written value, as defined by the caller.
    pub type_code: i32,
    /// Number of elements written.
    pub count: usize,
    /// The written payload, if the caller provides one.
    pub data: Option<Arc<dyn Any + Send + Sync>>,
    /// Per listener scratch slot: whatever a listener leaves here during the
    /// pre phase is handed back to the same listener in the post phase.
    pub user_data: Option<Box<dyn Any + Send>>,
}

pub type TrapWriteListener = Box<dyn FnMut(&mut TrapWriteMessage, TrapWritePhase) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(usize);

/// Token identifying an in-flight write message, returned by `before` and
/// consumed by `after`.
#[derive(Debug)]
pub struct WriteToken(usize);

struct ListenerSlot {
    listener: usize,
    user_data: Option<Box<dyn Any + Send>>,
}

struct InFlight {
    message: TrapWriteMessage,
    slots: Vec<ListenerSlot>,
}

#[derive(Default)]
struct MuxState {
    listeners: Slab<TrapWriteListener>,
    in_flight: Slab<InFlight>,
}

/// Listener registry plus per operation fan-out state.
#[derive(Default)]
pub struct TrapWriteMux {
    state: Mutex<MuxState>,
}

impl TrapWriteMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_listener(
        &self,
        listener: impl FnMut(&mut TrapWriteMessage, TrapWritePhase) + Send + 'static,
    ) -> ListenerId {
        let mut state = self.state.lock().unwrap();
        ListenerId(state.listeners.insert(Box::new(listener)))
    }

    /// Remove a listener. Its per listener slots are detached from every
    /// in-flight message first, so a pending `after` never calls into a
    /// dropped listener.
    pub fn unregister_listener(&self, id: ListenerId) {
        let mut state = self.state.lock().unwrap();
        state.listeners.remove(id.0);
        for flight in state.in_flight.iter_mut() {
            flight.slots.retain(|slot| slot.listener != id.0);
        }
    }

    /// Pre phase: build the message and call every listener. Returns `None`
    /// when nobody listens, in which case there is nothing to pair with.
    pub fn before(
        &self,
        identity: Identity,
        target: String,
        type_code: i32,
        count: usize,
        data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Option<WriteToken> {
        let mut state = self.state.lock().unwrap();
        if state.listeners.is_empty() {
            return None;
        }
        let mut message = TrapWriteMessage {
            identity,
            target,
            type_code,
            count,
            data,
            user_data: None,
        };
        let ids = state.listeners.ids();
        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            message.user_data = None;
            if let Some(listener) = state.listeners.get_mut(id) {
                listener(&mut message, TrapWritePhase::Before);
            }
            slots.push(ListenerSlot {
                listener: id,
                user_data: message.user_data.take(),
            });
        }
        let token = state.in_flight.insert(InFlight { message, slots });
        Some(WriteToken(token))
    }

    /// Post phase: replay the message to every listener that saw the pre
    /// phase and is still registered, then release it.
    pub fn after(&self, token: WriteToken) {
        let mut state = self.state.lock().unwrap();
        let mut flight = match state.in_flight.remove(token.0) {
            Some(flight) => flight,
            None => return,
        };
        for slot in flight.slots.drain(..) {
            if let Some(listener) = state.listeners.get_mut(slot.listener) {
                flight.message.user_data = slot.user_data;
                listener(&mut flight.message, TrapWritePhase::After);
            }
        }
    }
}
