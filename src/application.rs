//! Application interface and the per-tick context handed to it.
//!
//! An application is a state machine bound to exactly one node. The node
//! drives it twice per tick: once for every message whose processing
//! completes within the tick, and once at the end to let it issue new work.
//! Applications never touch other nodes directly; they record outbound
//! messages in the [`Context`] and the simulator routes them, which avoids
//! an ownership cycle between nodes and the applications they host.

use rand::rngs::StdRng;
use std::any::Any;

use crate::message::{Outbound, Payload};
use crate::{NodeId, SimError, Time};

/// Mutable per-tick environment: the run's seeded generator plus an outbox
/// for messages produced while executing or processing.
pub struct Context<'a, M> {
    pub rng: &'a mut StdRng,
    outbox: Vec<Outbound<M>>,
}

impl<'a, M> Context<'a, M> {
    pub fn new(rng: &'a mut StdRng) -> Self {
        Self {
            rng,
            outbox: Vec::new(),
        }
    }

    /// Records a message addressed to `dst`, stamped with its send time.
    pub fn send(&mut self, dst: NodeId, body: M, send_time: Time) {
        self.outbox.push(Outbound {
            dst,
            send_time,
            body,
        });
    }

    /// Consumes the context, releasing the recorded messages for routing.
    pub fn into_outbox(self) -> Vec<Outbound<M>> {
        self.outbox
    }
}

/// Behavior attached to a node.
pub trait Application {
    type Message: Payload;

    /// Called once when the application is registered on a node; the id is
    /// the application's return address.
    fn register_node(&mut self, id: NodeId);

    /// Executes application logic up to `end_time`, emitting any new
    /// messages through the context.
    fn execute(
        &mut self,
        end_time: Time,
        ctx: &mut Context<'_, Self::Message>,
    ) -> Result<(), SimError>;

    /// Processes a single delivered message at its processing-finish time.
    fn process_message(
        &mut self,
        msg: Self::Message,
        time: Time,
        ctx: &mut Context<'_, Self::Message>,
    ) -> Result<(), SimError>;

    /// Extra per-message processing latency on top of the packet cost.
    fn message_proc_ltc(&self, _msg: &Self::Message) -> Time {
        0
    }

    /// Inspection hook used by tests to reach the concrete application
    /// behind a node.
    fn as_any(&self) -> &dyn Any;

    /// Mutable counterpart of [`Application::as_any`].
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
