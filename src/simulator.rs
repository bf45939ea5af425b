//! Top-level simulation driver.
//!
//! The simulator owns the node table, the run's seeded generator, and a list
//! of registered services (configuration policies, statistics) that get a
//! chance to run once per tick. A run advances a global clock in fixed steps
//! of the minimum propagation delay; within a tick, nodes are advanced in
//! registration order and their recorded outbound messages are routed as
//! soon as the node finishes, which cannot be observed within the same tick
//! because every message pays at least one propagation hop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::info;
use rand::rngs::StdRng;

use crate::application::Context;
use crate::message::Payload;
use crate::node::{deliver, Node};
use crate::{NodeId, SimError, Time};

/// A component that runs once per simulated tick, after all nodes.
/// Configuration policies use this for periodic work (load collection,
/// rebalancing); statistics use it for epoch rollover.
pub trait Service {
    fn run(&mut self, _end_time: Time) {}
}

pub struct Simulator<M: Payload> {
    nodes: Vec<Node<M>>,
    index: HashMap<NodeId, usize>,
    services: Vec<Rc<RefCell<dyn Service>>>,
    rng: StdRng,
    progress: bool,
}

impl<M: Payload> Simulator<M> {
    pub fn new(rng: StdRng) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            services: Vec::new(),
            rng,
            progress: false,
        }
    }

    /// Logs coarse progress during long runs.
    pub fn with_progress(mut self) -> Self {
        self.progress = true;
        self
    }

    pub fn add_node(&mut self, node: Node<M>) {
        self.index.insert(node.id(), self.nodes.len());
        self.nodes.push(node);
    }

    pub fn add_nodes(&mut self, nodes: Vec<Node<M>>) {
        for node in nodes {
            self.add_node(node);
        }
    }

    pub fn register_service(&mut self, service: Rc<RefCell<dyn Service>>) {
        self.services.push(service);
    }

    pub fn node(&self, id: NodeId) -> Option<&Node<M>> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node<M>] {
        &self.nodes
    }

    fn route_outbox(
        nodes: &mut [Node<M>],
        index: &HashMap<NodeId, usize>,
        rng: &mut StdRng,
        src_rack: crate::RackId,
        outbox: Vec<crate::message::Outbound<M>>,
    ) -> Result<(), SimError> {
        for out in outbox {
            let &dst = index
                .get(&out.dst)
                .ok_or_else(|| SimError::Protocol(format!("message to unknown node {}", out.dst)))?;
            deliver(src_rack, &mut nodes[dst], out, rng);
        }
        Ok(())
    }

    /// Advances one node up to `end_time` and routes what it sent.
    fn step_node(&mut self, i: usize, end_time: Time, execute: bool) -> Result<(), SimError> {
        let src_rack = self.nodes[i].rack();
        let outbox = {
            let mut ctx = Context::new(&mut self.rng);
            if execute {
                self.nodes[i].run(end_time, &mut ctx)?;
            } else {
                self.nodes[i].process_messages(end_time, &mut ctx)?;
            }
            ctx.into_outbox()
        };
        Self::route_outbox(&mut self.nodes, &self.index, &mut self.rng, src_rack, outbox)
    }

    /// Runs the simulation for `duration` microseconds of virtual time.
    /// Returns the final clock value (the first tick past the duration),
    /// which callers report as the statistics end time.
    pub fn run(&mut self, duration: Time) -> Result<Time, SimError> {
        let step = crate::param::MIN_PROPG_DELAY;
        let report_every = (duration / 10).max(step);
        let mut next_report = report_every;
        let mut timer = step;
        while timer <= duration {
            if self.progress && timer >= next_report {
                info!("simulated {timer} / {duration} us");
                next_report += report_every;
            }
            for i in 0..self.nodes.len() {
                self.step_node(i, timer, true)?;
            }
            for service in &self.services {
                service.borrow_mut().run(timer);
            }
            timer += step;
        }
        Ok(timer)
    }

    /// Processes outstanding messages on every node up to `end_time` without
    /// letting applications issue new work. Used to let in-flight requests
    /// complete after the workload is exhausted.
    pub fn drain(&mut self, end_time: Time) -> Result<(), SimError> {
        for i in 0..self.nodes.len() {
            self.step_node(i, end_time, false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::Application;
    use crate::node::Rack;
    use crate::param;
    use rand::{Rng, SeedableRng};
    use std::any::Any;

    const MESSAGE_LENGTH: usize = 1024;
    const MESSAGE_INTERVAL: Time = 5;

    struct NullMessage;

    impl Payload for NullMessage {
        fn wire_len(&self) -> usize {
            MESSAGE_LENGTH
        }
    }

    /// Fires a fixed-size message at a random peer every `MESSAGE_INTERVAL`
    /// and counts traffic through shared tallies.
    struct NullRpc {
        node: NodeId,
        peers: Vec<NodeId>,
        next_send_time: Time,
        counters: Rc<RefCell<(u64, u64)>>, // (sent, received)
    }

    impl NullRpc {
        fn new(peers: Vec<NodeId>, counters: Rc<RefCell<(u64, u64)>>) -> Self {
            Self {
                node: 0,
                peers,
                next_send_time: 0,
                counters,
            }
        }
    }

    impl Application for NullRpc {
        type Message = NullMessage;

        fn register_node(&mut self, id: NodeId) {
            self.node = id;
        }

        fn execute(
            &mut self,
            end_time: Time,
            ctx: &mut Context<'_, NullMessage>,
        ) -> Result<(), SimError> {
            while self.next_send_time < end_time {
                let mut dst = self.node;
                while dst == self.node {
                    dst = self.peers[ctx.rng.gen_range(0..self.peers.len())];
                }
                ctx.send(dst, NullMessage, self.next_send_time);
                self.counters.borrow_mut().0 += 1;
                self.next_send_time += MESSAGE_INTERVAL;
            }
            Ok(())
        }

        fn process_message(
            &mut self,
            _msg: NullMessage,
            _time: Time,
            _ctx: &mut Context<'_, NullMessage>,
        ) -> Result<(), SimError> {
            self.counters.borrow_mut().1 += 1;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn all_sent_messages_are_received() {
        let n_nodes = 4;
        let counters = Rc::new(RefCell::new((0u64, 0u64)));
        let mut sim = Simulator::new(StdRng::seed_from_u64(21));
        let rack = Rack::new(0);
        let peers: Vec<NodeId> = (0..n_nodes).collect();
        for id in 0..n_nodes {
            let mut node = Node::new(&rack, id);
            node.register_app(Box::new(NullRpc::new(peers.clone(), counters.clone())));
            sim.add_node(node);
        }

        let duration = 20 * MESSAGE_INTERVAL;
        sim.run(duration).expect("run succeeds");
        // Give the tail messages time to arrive and be processed.
        sim.drain(duration + 10_000).expect("drain succeeds");

        let (sent, received) = *counters.borrow();
        assert!(sent > 0);
        assert_eq!(sent, received);
    }

    #[test]
    fn node_clocks_are_monotone_and_match_final_tick() {
        let counters = Rc::new(RefCell::new((0u64, 0u64)));
        let mut sim = Simulator::new(StdRng::seed_from_u64(22));
        let rack = Rack::new(0);
        for id in 0..2 {
            let mut node = Node::new(&rack, id);
            node.register_app(Box::new(NullRpc::new(vec![0, 1], counters.clone())));
            sim.add_node(node);
        }

        let end = sim.run(10 * param::MIN_PROPG_DELAY).expect("run succeeds");
        assert_eq!(end, 11 * param::MIN_PROPG_DELAY);
        for node in sim.nodes() {
            assert_eq!(node.time(), 10 * param::MIN_PROPG_DELAY);
        }
    }

    struct TickRecorder {
        ticks: Vec<Time>,
    }

    impl Service for TickRecorder {
        fn run(&mut self, end_time: Time) {
            self.ticks.push(end_time);
        }
    }

    #[test]
    fn services_run_once_per_tick() {
        let counters = Rc::new(RefCell::new((0u64, 0u64)));
        let mut sim = Simulator::new(StdRng::seed_from_u64(23));
        let rack = Rack::new(0);
        let mut node = Node::new(&rack, 0);
        node.register_app(Box::new(NullRpc::new(vec![0, 1], counters.clone())));
        sim.add_node(node);
        let mut other = Node::new(&rack, 1);
        other.register_app(Box::new(NullRpc::new(vec![0, 1], counters)));
        sim.add_node(other);

        let recorder = Rc::new(RefCell::new(TickRecorder { ticks: Vec::new() }));
        sim.register_service(recorder.clone());

        sim.run(3 * param::MIN_PROPG_DELAY).expect("run succeeds");
        let step = param::MIN_PROPG_DELAY;
        assert_eq!(recorder.borrow().ticks, vec![step, 2 * step, 3 * step]);
    }
}
