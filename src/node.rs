//! Topology and per-node scheduling.
//!
//! A [`Node`] belongs to one [`Rack`] and owns three message stores:
//! - an *inflight set* of messages already sent to it, keyed by arrival time,
//! - a *ready queue* of arrived messages waiting for a processor,
//! - an *unfinished list* of messages whose processing could not complete
//!   within the current tick and is carried into the next one.
//!
//! Each tick, arrived messages are promoted to the ready queue (subject to
//! the drop-tail bound), carried work is resumed, and up to `nprocs`
//! processor clocks serve the queue in earliest-idle order. A message's
//! processing-finish time is `max(processor_clock, arrival) + pkt_proc_ltc +
//! app.message_proc_ltc(msg)`; if that exceeds the tick boundary the message
//! is suspended and its processor slot stays occupied until it completes.
//!
//! Logical clients model an infinitely fast endpoint: no processing latency,
//! no queue bound. They exist so client-side behavior can be measured
//! without the client itself becoming the bottleneck.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use log::debug;
use rand::rngs::StdRng;

use crate::application::{Application, Context};
use crate::message::{Outbound, Payload, QueuedMessage};
use crate::param;
use crate::{NodeId, RackId, SimError, Time};

/// A rack of nodes. Network distance is 1 within a rack and 2 across racks.
#[derive(Debug, Clone, Copy)]
pub struct Rack {
    id: RackId,
}

impl Rack {
    pub fn new(id: RackId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> RackId {
        self.id
    }

    pub fn distance(&self, other: &Rack) -> Time {
        rack_distance(self.id, other.id)
    }
}

/// Distance in propagation hops between two racks.
pub fn rack_distance(a: RackId, b: RackId) -> Time {
    if a == b {
        1
    } else {
        2
    }
}

struct Unfinished<M> {
    finish_time: Time,
    body: M,
}

/// A single node in the simulation.
pub struct Node<M: Payload> {
    id: NodeId,
    rack: RackId,
    time: Time,
    nprocs: usize,
    logical_client: bool,
    drop_tail: bool,
    inflight: BinaryHeap<QueuedMessage<M>>,
    queue: VecDeque<QueuedMessage<M>>,
    unfinished: Vec<Unfinished<M>>,
    seq: u64,
    drops: u64,
    app: Option<Box<dyn Application<Message = M>>>,
}

impl<M: Payload> Node<M> {
    pub fn new(rack: &Rack, id: NodeId) -> Self {
        Self {
            id,
            rack: rack.id(),
            time: 0,
            nprocs: 1,
            logical_client: false,
            drop_tail: false,
            inflight: BinaryHeap::new(),
            queue: VecDeque::new(),
            unfinished: Vec::new(),
            seq: 0,
            drops: 0,
            app: None,
        }
    }

    /// Sets the processor count (default 1).
    pub fn with_procs(mut self, nprocs: usize) -> Self {
        self.nprocs = nprocs.max(1);
        self
    }

    /// Marks this node as a logical client: zero processing latency and an
    /// unbounded queue.
    pub fn logical_client(mut self) -> Self {
        self.logical_client = true;
        self
    }

    /// Bounds the ready queue; excess promoted messages are dropped.
    pub fn drop_tail(mut self) -> Self {
        self.drop_tail = true;
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn rack(&self) -> RackId {
        self.rack
    }

    pub fn time(&self) -> Time {
        self.time
    }

    /// Messages discarded by the drop-tail bound so far.
    pub fn drops(&self) -> u64 {
        self.drops
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn app(&self) -> Option<&dyn Application<Message = M>> {
        self.app.as_deref()
    }

    pub fn app_mut(&mut self) -> Option<&mut (dyn Application<Message = M> + 'static)> {
        self.app.as_deref_mut()
    }

    /// Binds `app` to this node and hands it the node id as its return
    /// address.
    pub fn register_app(&mut self, mut app: Box<dyn Application<Message = M>>) {
        app.register_node(self.id);
        self.app = Some(app);
    }

    /// Adds a message to the inflight set with its computed arrival time.
    pub(crate) fn enqueue(&mut self, body: M, arrival: Time) {
        let seq = self.seq;
        self.seq += 1;
        self.inflight.push(QueuedMessage { arrival, seq, body });
    }

    /// Processes all queued messages up to `end_time`.
    pub fn process_messages(
        &mut self,
        end_time: Time,
        ctx: &mut Context<'_, M>,
    ) -> Result<(), SimError> {
        let app = self
            .app
            .as_mut()
            .ok_or_else(|| SimError::Config(format!("node {} has no application", self.id)))?;

        // Promote arrived messages into the ready queue. The drop-tail bound
        // is the static cap plus the number of packets one processor could
        // have retired since the last tick.
        let cap = param::NODE_MSG_QUEUE_LENGTH
            + ((end_time.saturating_sub(self.time)) / param::MIN_PKT_PROC_LTC) as usize;
        while let Some(head) = self.inflight.peek() {
            if head.arrival > end_time {
                break;
            }
            let msg = self.inflight.pop().expect("peek followed by pop");
            if self.drop_tail && !self.logical_client && self.queue.len() >= cap {
                self.drops += 1;
                debug!("node {}: ready queue full, dropping message", self.id);
            } else {
                self.queue.push_back(msg);
            }
        }

        let mut proc_times: BinaryHeap<Reverse<Time>> = BinaryHeap::new();

        // Resume work carried over from earlier ticks before touching new
        // messages; a processor with a suspended message stays busy until
        // its scheduled finish time.
        if !self.unfinished.is_empty() {
            let mut carried = Vec::new();
            for uf in self.unfinished.drain(..) {
                if uf.finish_time > end_time {
                    carried.push(uf);
                } else {
                    app.process_message(uf.body, uf.finish_time, ctx)?;
                    proc_times.push(Reverse(uf.finish_time));
                }
            }
            self.unfinished = carried;
        }

        // Idle processors become available at the node's current time.
        while proc_times.len() + self.unfinished.len() < self.nprocs {
            proc_times.push(Reverse(self.time));
        }

        while !self.queue.is_empty() && !proc_times.is_empty() {
            let Reverse(mut proc_time) = proc_times.pop().expect("checked non-empty");
            let msg = self.queue.pop_front().expect("checked non-empty");
            if msg.arrival > proc_time {
                proc_time = msg.arrival;
            }
            if !self.logical_client {
                proc_time += param::pkt_proc_ltc(ctx.rng) + app.message_proc_ltc(&msg.body);
            }
            if proc_time > end_time {
                // Suspend: the processor slot stays consumed for this tick.
                self.unfinished.push(Unfinished {
                    finish_time: proc_time,
                    body: msg.body,
                });
                continue;
            }
            app.process_message(msg.body, proc_time, ctx)?;
            proc_times.push(Reverse(proc_time));
        }

        Ok(())
    }

    /// Runs this node up to `end_time`: drains arrived messages, lets the
    /// application emit new work, then advances the node clock.
    pub fn run(&mut self, end_time: Time, ctx: &mut Context<'_, M>) -> Result<(), SimError> {
        debug_assert!(end_time >= self.time, "node clock must be monotone");
        self.process_messages(end_time, ctx)?;
        let app = self
            .app
            .as_mut()
            .ok_or_else(|| SimError::Config(format!("node {} has no application", self.id)))?;
        app.execute(end_time, ctx)?;
        self.time = end_time;
        Ok(())
    }
}

/// Sends `body` from `src` to `dst` at `send_time`, charging the sampled
/// network latency. Arrival is strictly after the send time: at least one
/// propagation hop is always paid.
pub fn send_message<M: Payload>(
    src: &Node<M>,
    dst: &mut Node<M>,
    body: M,
    send_time: Time,
    rng: &mut StdRng,
) {
    let distance = rack_distance(src.rack, dst.rack);
    let arrival = send_time + param::size_distance_to_time(body.wire_len(), distance, rng);
    dst.enqueue(body, arrival);
}

/// Routes an application-recorded outbound message into the destination
/// node's inflight set.
pub fn deliver<M: Payload>(
    src_rack: RackId,
    dst: &mut Node<M>,
    out: Outbound<M>,
    rng: &mut StdRng,
) {
    let distance = rack_distance(src_rack, dst.rack);
    let arrival = out.send_time + param::size_distance_to_time(out.body.wire_len(), distance, rng);
    dst.enqueue(out.body, arrival);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::any::Any;

    struct TestMessage;

    impl Payload for TestMessage {
        fn wire_len(&self) -> usize {
            1024
        }
    }

    /// Counts deliveries; optional fixed app latency on top of the packet
    /// cost.
    struct TestApp {
        received: usize,
        app_ltc: Time,
    }

    impl TestApp {
        fn new() -> Self {
            Self {
                received: 0,
                app_ltc: 0,
            }
        }

        fn with_ltc(ltc: Time) -> Self {
            Self {
                received: 0,
                app_ltc: ltc,
            }
        }
    }

    impl Application for TestApp {
        type Message = TestMessage;

        fn register_node(&mut self, _id: NodeId) {}

        fn execute(
            &mut self,
            _end_time: Time,
            _ctx: &mut Context<'_, TestMessage>,
        ) -> Result<(), SimError> {
            Ok(())
        }

        fn process_message(
            &mut self,
            _msg: TestMessage,
            _time: Time,
            _ctx: &mut Context<'_, TestMessage>,
        ) -> Result<(), SimError> {
            self.received += 1;
            Ok(())
        }

        fn message_proc_ltc(&self, _msg: &TestMessage) -> Time {
            self.app_ltc
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn received(node: &Node<TestMessage>) -> usize {
        node.app()
            .expect("app registered")
            .as_any()
            .downcast_ref::<TestApp>()
            .expect("test app")
            .received
    }

    fn run_node(node: &mut Node<TestMessage>, end_time: Time, rng: &mut StdRng) {
        let mut ctx = Context::new(rng);
        node.run(end_time, &mut ctx).expect("run succeeds");
    }

    #[test]
    fn single_message() {
        let mut rng = StdRng::seed_from_u64(1);
        let rack = Rack::new(0);
        let node_a = {
            let mut n = Node::new(&rack, 0);
            n.register_app(Box::new(TestApp::new()));
            n
        };
        let mut node_b = Node::new(&rack, 1);
        node_b.register_app(Box::new(TestApp::new()));

        send_message(&node_a, &mut node_b, TestMessage, 0, &mut rng);
        assert_eq!(node_b.inflight_len(), 1);
        let arrival = node_b.inflight.peek().expect("one inflight").arrival;
        assert!((param::MIN_PROPG_DELAY..=param::MAX_PROPG_DELAY).contains(&arrival));

        run_node(&mut node_b, arrival, &mut rng);
        assert_eq!(received(&node_b), 0);

        run_node(&mut node_b, arrival + param::MAX_PKT_PROC_LTC + 1, &mut rng);
        assert_eq!(node_b.queue_len(), 0);
        assert_eq!(received(&node_b), 1);
    }

    #[test]
    fn multiple_messages() {
        let mut rng = StdRng::seed_from_u64(2);
        let rack = Rack::new(0);
        let mut node_a = Node::new(&rack, 0);
        let mut node_b = Node::new(&rack, 1);
        node_a.register_app(Box::new(TestApp::new()));
        node_b.register_app(Box::new(TestApp::new()));

        send_message(&node_a, &mut node_b, TestMessage, 0, &mut rng);
        send_message(&node_a, &mut node_b, TestMessage, 0, &mut rng);
        send_message(&node_b, &mut node_a, TestMessage, 0, &mut rng);
        send_message(&node_b, &mut node_a, TestMessage, 0, &mut rng);
        assert_eq!(node_a.inflight_len(), 2);
        assert_eq!(node_b.inflight_len(), 2);

        for node in [&mut node_a, &mut node_b] {
            let first = node.inflight.peek().expect("two inflight").arrival;
            let mut timer = first + param::MAX_PKT_PROC_LTC;
            run_node(node, timer, &mut rng);
            assert_eq!(received(node), 1);
            timer += param::MAX_PKT_PROC_LTC + (param::MAX_PROPG_DELAY - param::MIN_PROPG_DELAY);
            run_node(node, timer, &mut rng);
            assert_eq!(node.queue_len(), 0);
            assert_eq!(received(node), 2);
        }
    }

    #[test]
    fn multiple_processors() {
        // A fixed 10 us application latency dominates the packet jitter so
        // the finish-time windows of consecutive messages never overlap.
        const APP_LTC: Time = 10;
        let min_svc = param::MIN_PKT_PROC_LTC + APP_LTC;
        let max_svc = param::MAX_PKT_PROC_LTC + APP_LTC;

        let mut rng = StdRng::seed_from_u64(3);
        let rack = Rack::new(0);
        let mut server_a = Node::new(&rack, 1);
        let mut server_b = Node::new(&rack, 2).with_procs(4);
        server_a.register_app(Box::new(TestApp::with_ltc(APP_LTC)));
        server_b.register_app(Box::new(TestApp::with_ltc(APP_LTC)));

        for node in [&mut server_a, &mut server_b] {
            for _ in 0..8 {
                node.enqueue(TestMessage, 0);
            }
        }

        run_node(&mut server_a, min_svc - 1, &mut rng);
        run_node(&mut server_b, min_svc - 1, &mut rng);
        assert_eq!(received(&server_a), 0);
        assert_eq!(received(&server_b), 0);

        run_node(&mut server_a, max_svc, &mut rng);
        run_node(&mut server_b, max_svc, &mut rng);
        assert_eq!(received(&server_a), 1);
        assert_eq!(received(&server_b), 4);

        run_node(&mut server_a, 2 * max_svc, &mut rng);
        run_node(&mut server_b, 2 * max_svc, &mut rng);
        assert_eq!(received(&server_a), 2);
        assert_eq!(received(&server_b), 8);
    }

    #[test]
    fn cross_rack_arrival_order() {
        let mut rng = StdRng::seed_from_u64(4);
        let rack_a = Rack::new(0);
        let rack_b = Rack::new(1);
        let node_a1 = {
            let mut n = Node::new(&rack_a, 0);
            n.register_app(Box::new(TestApp::new()));
            n
        };
        let node_b1 = {
            let mut n = Node::new(&rack_b, 1);
            n.register_app(Box::new(TestApp::new()));
            n
        };
        let mut node_b2 = Node::new(&rack_b, 2);
        node_b2.register_app(Box::new(TestApp::new()));

        // The cross-rack message pays two hops, the same-rack message one;
        // the same-rack message always arrives first.
        send_message(&node_a1, &mut node_b2, TestMessage, 0, &mut rng);
        send_message(&node_b1, &mut node_b2, TestMessage, 0, &mut rng);
        assert_eq!(node_b2.inflight_len(), 2);
        let first = node_b2.inflight.peek().expect("two inflight").arrival;
        assert!(first <= param::MAX_PROPG_DELAY);

        run_node(&mut node_b2, first + param::MAX_PKT_PROC_LTC, &mut rng);
        assert_eq!(received(&node_b2), 1);
        assert_eq!(node_b2.inflight_len(), 1);
        let second = node_b2.inflight.peek().expect("one inflight").arrival;
        assert!(second >= 2 * param::MIN_PROPG_DELAY);
    }

    #[test]
    fn drop_tail_discards_overflow() {
        let mut rng = StdRng::seed_from_u64(5);
        let rack = Rack::new(0);
        let mut node = Node::new(&rack, 0).drop_tail();
        node.register_app(Box::new(TestApp::new()));

        let total = param::NODE_MSG_QUEUE_LENGTH + 100;
        for _ in 0..total {
            node.enqueue(TestMessage, 0);
        }
        // At time 0 the bound is exactly the static cap.
        run_node(&mut node, 0, &mut rng);
        assert_eq!(node.drops(), 100);
        assert_eq!(
            node.queue_len() + node.unfinished.len(),
            param::NODE_MSG_QUEUE_LENGTH
        );
    }

    #[test]
    fn logical_client_never_drops_or_delays() {
        let mut rng = StdRng::seed_from_u64(6);
        let rack = Rack::new(0);
        let mut node = Node::new(&rack, 0).logical_client().drop_tail();
        node.register_app(Box::new(TestApp::new()));

        let total = param::NODE_MSG_QUEUE_LENGTH + 100;
        for _ in 0..total {
            node.enqueue(TestMessage, 10);
        }
        // Zero processing latency: everything arriving by the tick is
        // delivered within it.
        run_node(&mut node, 10, &mut rng);
        assert_eq!(node.drops(), 0);
        assert_eq!(received(&node), total);
    }
}
