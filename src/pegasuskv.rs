//! Distributed key-value store with an in-network-style coherence
//! directory.
//!
//! Reads go to an arbitrary cache node (CACHE_REQ); writes and deletes go
//! to the key's directory node (DIR_REQ). The directory tracks the exact
//! sharer set per key: it forwards GETs to one sharer (preferring itself),
//! fans writes out to every sharer, and answers the writer with the ack
//! count to wait for (DIR_REPLY). A cache node that misses converts the
//! request into a directory request, remembers the original client, and
//! installs the value when the forwarded reply comes back through it.
//!
//! Completion on the client is two-signal: replies are counted as they
//! arrive, and the expected count only becomes known when the directory
//! reply lands; the request finishes when both are in.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use rand::Rng;

use crate::application::{Application, Context};
use crate::kv::{
    execute_op, KVStats, KVWorkloadGenerator, OpResult, OpType, Operation, REQ_ID_LEN, RES_LEN,
};
use crate::message::Payload;
use crate::simulator::Service;
use crate::{NodeId, SimError, Time};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// GET sent by a client to a cache node of its choice.
    Cache,
    /// Request addressed to the key's directory node.
    Directory,
    /// Request relayed by the directory to a sharer.
    Forward,
}

#[derive(Debug, Clone)]
pub struct PegasusRequest {
    pub src: NodeId,
    pub req_id: u64,
    pub kind: RequestKind,
    pub op: Operation,
}

#[derive(Debug, Clone)]
pub struct PegasusReply {
    pub req_id: u64,
    pub result: OpResult,
    pub value: String,
}

/// Directory answer for PUT and DEL: how many per-sharer acks the writer
/// should expect.
#[derive(Debug, Clone)]
pub struct DirectoryReply {
    pub req_id: u64,
    pub num_acks: usize,
}

#[derive(Debug, Clone)]
pub enum PegasusMessage {
    Request(PegasusRequest),
    Reply(PegasusReply),
    DirReply(DirectoryReply),
}

impl Payload for PegasusMessage {
    fn wire_len(&self) -> usize {
        match self {
            PegasusMessage::Request(req) => REQ_ID_LEN + req.op.wire_len(),
            PegasusMessage::Reply(rep) => REQ_ID_LEN + RES_LEN + rep.value.len(),
            PegasusMessage::DirReply(_) => REQ_ID_LEN,
        }
    }
}

/// Node-selection policy for the directory protocol.
pub trait PegasusKVConfiguration: Service {
    /// Cache node a client sends its GET to.
    fn select_cache_node(
        &mut self,
        client: NodeId,
        key: &str,
        rng: &mut rand::rngs::StdRng,
    ) -> NodeId;

    /// Directory node owning `key`.
    fn select_dir_node(&mut self, client: NodeId, key: &str) -> NodeId;
}

pub type PegasusConfigHandle = Rc<RefCell<dyn PegasusKVConfiguration>>;

/// One directory node (co-located with a cache node); GETs spread uniformly
/// at random over the cache nodes.
pub struct SingleDirectoryConfig {
    cache_nodes: Vec<NodeId>,
    dir_slot: usize,
}

impl SingleDirectoryConfig {
    pub fn new(cache_nodes: Vec<NodeId>, dir_slot: usize) -> Result<Self, SimError> {
        if cache_nodes.is_empty() {
            return Err(SimError::Config("policy needs at least one cache node".into()));
        }
        if dir_slot >= cache_nodes.len() {
            return Err(SimError::Config(format!(
                "directory slot {dir_slot} out of range for {} cache nodes",
                cache_nodes.len()
            )));
        }
        Ok(Self {
            cache_nodes,
            dir_slot,
        })
    }
}

impl Service for SingleDirectoryConfig {}

impl PegasusKVConfiguration for SingleDirectoryConfig {
    fn select_cache_node(
        &mut self,
        _client: NodeId,
        _key: &str,
        rng: &mut rand::rngs::StdRng,
    ) -> NodeId {
        self.cache_nodes[rng.gen_range(0..self.cache_nodes.len())]
    }

    fn select_dir_node(&mut self, _client: NodeId, _key: &str) -> NodeId {
        self.cache_nodes[self.dir_slot]
    }
}

struct PendingRequest {
    op: Operation,
    time: Time,
    received_acks: usize,
    /// Unknown until the directory reply arrives.
    expected_acks: Option<usize>,
}

/// Client for the directory protocol.
pub struct PegasusKVClient {
    node: NodeId,
    config: PegasusConfigHandle,
    stats: Rc<RefCell<KVStats>>,
    generator: Option<Box<dyn KVWorkloadGenerator>>,
    primed: bool,
    next_op: Option<(Operation, Time)>,
    pending: HashMap<u64, PendingRequest>,
    next_req_id: u64,
}

impl PegasusKVClient {
    pub fn new(
        config: PegasusConfigHandle,
        stats: Rc<RefCell<KVStats>>,
        generator: Option<Box<dyn KVWorkloadGenerator>>,
    ) -> Self {
        Self {
            node: 0,
            config,
            stats,
            generator,
            primed: false,
            next_op: None,
            pending: HashMap::new(),
            next_req_id: 0,
        }
    }

    fn issue(
        &mut self,
        op: Operation,
        time: Time,
        ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        let (dst, kind) = match op.op_type {
            OpType::Get => (
                self.config
                    .borrow_mut()
                    .select_cache_node(self.node, &op.key, ctx.rng),
                RequestKind::Cache,
            ),
            OpType::Put | OpType::Del => (
                self.config.borrow_mut().select_dir_node(self.node, &op.key),
                RequestKind::Directory,
            ),
        };
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        self.pending.insert(
            req_id,
            PendingRequest {
                op: op.clone(),
                time,
                received_acks: 0,
                expected_acks: None,
            },
        );
        ctx.send(
            dst,
            PegasusMessage::Request(PegasusRequest {
                src: self.node,
                req_id,
                kind,
                op,
            }),
            time,
        );
        Ok(())
    }

    fn complete(&mut self, req_id: u64, result: OpResult, time: Time) {
        let request = self
            .pending
            .remove(&req_id)
            .expect("caller checked the pending entry");
        self.stats.borrow_mut().report_op(
            request.op.op_type,
            time - request.time,
            result == OpResult::Ok,
        );
    }
}

impl Application for PegasusKVClient {
    type Message = PegasusMessage;

    fn register_node(&mut self, id: NodeId) {
        self.node = id;
    }

    fn execute(
        &mut self,
        end_time: Time,
        ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        if self.generator.is_none() {
            return Ok(());
        }
        if !self.primed {
            self.primed = true;
            self.next_op = self
                .generator
                .as_mut()
                .expect("checked above")
                .next_operation(ctx.rng);
        }
        loop {
            match self.next_op.take() {
                Some((op, time)) if time <= end_time => {
                    self.issue(op, time, ctx)?;
                    self.next_op = self
                        .generator
                        .as_mut()
                        .expect("checked above")
                        .next_operation(ctx.rng);
                }
                other => {
                    self.next_op = other;
                    return Ok(());
                }
            }
        }
    }

    fn process_message(
        &mut self,
        msg: PegasusMessage,
        time: Time,
        _ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        match msg {
            PegasusMessage::Reply(reply) => {
                let request = self.pending.get_mut(&reply.req_id).ok_or_else(|| {
                    SimError::Protocol(format!(
                        "client {}: reply for unknown request {}",
                        self.node, reply.req_id
                    ))
                })?;
                if request.op.op_type == OpType::Get {
                    self.complete(reply.req_id, reply.result, time);
                } else {
                    request.received_acks += 1;
                    if let Some(expected) = request.expected_acks {
                        if request.received_acks >= expected {
                            self.complete(reply.req_id, OpResult::Ok, time);
                        }
                    }
                }
                Ok(())
            }
            PegasusMessage::DirReply(reply) => {
                let request = self.pending.get_mut(&reply.req_id).ok_or_else(|| {
                    SimError::Protocol(format!(
                        "client {}: directory reply for unknown request {}",
                        self.node, reply.req_id
                    ))
                })?;
                request.expected_acks = Some(reply.num_acks);
                if request.received_acks >= reply.num_acks {
                    self.complete(reply.req_id, OpResult::Ok, time);
                }
                Ok(())
            }
            PegasusMessage::Request(_) => Err(SimError::Protocol(format!(
                "client {} received a request message",
                self.node
            ))),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Directory entry for a single key: the exact set of cache nodes holding
/// it. Ordered so the random sharer draw is reproducible under a seed.
#[derive(Debug, Default)]
pub struct DirectoryEntry {
    pub sharers: BTreeSet<NodeId>,
}

struct PendingGet {
    client: NodeId,
    key: String,
}

/// Cache/directory server. Every node runs the same application; whether it
/// acts as the directory for a key is decided by the configuration.
pub struct PegasusKVServer {
    node: NodeId,
    config: PegasusConfigHandle,
    store: HashMap<String, String>,
    directory: HashMap<String, DirectoryEntry>,
    pending_gets: HashMap<u64, PendingGet>,
}

impl PegasusKVServer {
    pub fn new(config: PegasusConfigHandle) -> Self {
        Self {
            node: 0,
            config,
            store: HashMap::new(),
            directory: HashMap::new(),
            pending_gets: HashMap::new(),
        }
    }

    pub fn store(&self) -> &HashMap<String, String> {
        &self.store
    }

    pub fn directory(&self) -> &HashMap<String, DirectoryEntry> {
        &self.directory
    }

    /// Sends to a remote node, or handles inline when the destination is
    /// this node (the directory talking to its co-located cache).
    fn dispatch(
        &mut self,
        dst: NodeId,
        msg: PegasusMessage,
        time: Time,
        ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        if dst == self.node {
            self.handle(msg, time, ctx)
        } else {
            ctx.send(dst, msg, time);
            Ok(())
        }
    }

    fn handle(
        &mut self,
        msg: PegasusMessage,
        time: Time,
        ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        match msg {
            PegasusMessage::Request(req) => match req.kind {
                RequestKind::Cache => self.handle_cache_request(req, time, ctx),
                RequestKind::Directory => self.handle_dir_request(req, time, ctx),
                RequestKind::Forward => self.handle_forward_request(req, time, ctx),
            },
            PegasusMessage::Reply(rep) => self.handle_cache_reply(rep, time, ctx),
            PegasusMessage::DirReply(_) => Err(SimError::Protocol(format!(
                "server {} received a directory reply",
                self.node
            ))),
        }
    }

    /// GET straight from a client: serve on a hit, otherwise turn it into a
    /// directory request with this node as the requester and remember the
    /// client for the way back.
    fn handle_cache_request(
        &mut self,
        mut req: PegasusRequest,
        time: Time,
        ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        if req.op.op_type != OpType::Get {
            return Err(SimError::Protocol(format!(
                "server {}: cache request carrying {:?}",
                self.node, req.op.op_type
            )));
        }
        let (result, value) = execute_op(&mut self.store, &req.op);
        match result {
            OpResult::Ok => self.dispatch(
                req.src,
                PegasusMessage::Reply(PegasusReply {
                    req_id: req.req_id,
                    result,
                    value,
                }),
                time,
                ctx,
            ),
            OpResult::NotFound => {
                self.pending_gets.insert(
                    req.req_id,
                    PendingGet {
                        client: req.src,
                        key: req.op.key.clone(),
                    },
                );
                let dir = self
                    .config
                    .borrow_mut()
                    .select_dir_node(self.node, &req.op.key);
                req.kind = RequestKind::Directory;
                req.src = self.node;
                self.dispatch(dir, PegasusMessage::Request(req), time, ctx)
            }
        }
    }

    fn handle_dir_request(
        &mut self,
        mut req: PegasusRequest,
        time: Time,
        ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        let sharers: Vec<NodeId> = self
            .directory
            .entry(req.op.key.clone())
            .or_default()
            .sharers
            .iter()
            .copied()
            .collect();
        let requester = req.src;
        match req.op.op_type {
            OpType::Get => {
                if sharers.is_empty() {
                    // Not cached anywhere.
                    return self.dispatch(
                        requester,
                        PegasusMessage::Reply(PegasusReply {
                            req_id: req.req_id,
                            result: OpResult::NotFound,
                            value: String::new(),
                        }),
                        time,
                        ctx,
                    );
                }
                // Relay to one sharer, preferring this node, and record the
                // requester as a new sharer: it installs the value when the
                // reply passes through it.
                let sharer = if sharers.contains(&self.node) {
                    self.node
                } else {
                    sharers[ctx.rng.gen_range(0..sharers.len())]
                };
                let key = req.op.key.clone();
                req.kind = RequestKind::Forward;
                self.dispatch(sharer, PegasusMessage::Request(req), time, ctx)?;
                self.directory
                    .get_mut(&key)
                    .expect("entry created above")
                    .sharers
                    .insert(requester);
                Ok(())
            }
            OpType::Put => {
                req.kind = RequestKind::Forward;
                let key = req.op.key.clone();
                let req_id = req.req_id;
                let num_acks = if sharers.is_empty() {
                    // First write: install on the local cache and become the
                    // only sharer.
                    self.dispatch(self.node, PegasusMessage::Request(req), time, ctx)?;
                    self.directory
                        .get_mut(&key)
                        .expect("entry created above")
                        .sharers
                        .insert(self.node);
                    1
                } else {
                    for &sharer in &sharers {
                        self.dispatch(
                            sharer,
                            PegasusMessage::Request(req.clone()),
                            time,
                            ctx,
                        )?;
                    }
                    sharers.len()
                };
                self.dispatch(
                    requester,
                    PegasusMessage::DirReply(DirectoryReply { req_id, num_acks }),
                    time,
                    ctx,
                )
            }
            OpType::Del => {
                req.kind = RequestKind::Forward;
                let key = req.op.key.clone();
                let req_id = req.req_id;
                for &sharer in &sharers {
                    self.dispatch(sharer, PegasusMessage::Request(req.clone()), time, ctx)?;
                }
                self.dispatch(
                    requester,
                    PegasusMessage::DirReply(DirectoryReply {
                        req_id,
                        num_acks: sharers.len(),
                    }),
                    time,
                    ctx,
                )?;
                self.directory
                    .get_mut(&key)
                    .expect("entry created above")
                    .sharers
                    .clear();
                Ok(())
            }
        }
    }

    fn handle_forward_request(
        &mut self,
        req: PegasusRequest,
        time: Time,
        ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        let (result, value) = execute_op(&mut self.store, &req.op);
        self.dispatch(
            req.src,
            PegasusMessage::Reply(PegasusReply {
                req_id: req.req_id,
                result,
                value,
            }),
            time,
            ctx,
        )
    }

    /// Reply resolving an earlier local miss: install the value, then pass
    /// the reply on to the client that asked.
    fn handle_cache_reply(
        &mut self,
        rep: PegasusReply,
        time: Time,
        ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        let pending = self.pending_gets.remove(&rep.req_id).ok_or_else(|| {
            SimError::Protocol(format!(
                "server {}: cache reply for unknown request {}",
                self.node, rep.req_id
            ))
        })?;
        if rep.result == OpResult::Ok {
            self.store.insert(pending.key, rep.value.clone());
        }
        self.dispatch(pending.client, PegasusMessage::Reply(rep), time, ctx)
    }
}

impl Application for PegasusKVServer {
    type Message = PegasusMessage;

    fn register_node(&mut self, id: NodeId) {
        self.node = id;
    }

    fn execute(
        &mut self,
        _end_time: Time,
        _ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        Ok(())
    }

    fn process_message(
        &mut self,
        msg: PegasusMessage,
        time: Time,
        ctx: &mut Context<'_, PegasusMessage>,
    ) -> Result<(), SimError> {
        self.handle(msg, time, ctx)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Outbound;
    use crate::node::{deliver, Node, Rack};
    use crate::param::{MAX_PKT_PROC_LTC, MAX_PROPG_DELAY};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const ROUND: Time = MAX_PROPG_DELAY + MAX_PKT_PROC_LTC;

    /// Cache-node choice scripted by the test; directory fixed.
    struct ScriptedCacheConfig {
        cache_nodes: Vec<NodeId>,
        dir_slot: usize,
        next_cache: usize,
    }

    impl Service for ScriptedCacheConfig {}

    impl PegasusKVConfiguration for ScriptedCacheConfig {
        fn select_cache_node(&mut self, _client: NodeId, _key: &str, _rng: &mut StdRng) -> NodeId {
            self.cache_nodes[self.next_cache]
        }

        fn select_dir_node(&mut self, _client: NodeId, _key: &str) -> NodeId {
            self.cache_nodes[self.dir_slot]
        }
    }

    struct TestBed {
        nodes: Vec<Node<PegasusMessage>>,
        rng: StdRng,
    }

    impl TestBed {
        fn build(config: PegasusConfigHandle, stats: Rc<RefCell<KVStats>>) -> Self {
            let rack = Rack::new(0);
            let mut nodes = Vec::new();
            for id in 0..4 {
                let mut node = Node::new(&rack, id);
                node.register_app(Box::new(PegasusKVServer::new(config.clone())));
                nodes.push(node);
            }
            // Logical client: replies are consumed at arrival, so multi-ack
            // completions land in a predictable round.
            let mut client = Node::new(&rack, 4).logical_client();
            client.register_app(Box::new(PegasusKVClient::new(config, stats, None)));
            nodes.push(client);
            Self {
                nodes,
                rng: StdRng::seed_from_u64(55),
            }
        }

        fn route(&mut self, src_rack: usize, outbox: Vec<Outbound<PegasusMessage>>) {
            for out in outbox {
                let idx = self
                    .nodes
                    .iter()
                    .position(|n| n.id() == out.dst)
                    .expect("known node");
                deliver(src_rack, &mut self.nodes[idx], out, &mut self.rng);
            }
        }

        fn run_node(&mut self, idx: usize, end_time: Time) {
            let src_rack = self.nodes[idx].rack();
            let outbox = {
                let mut ctx = Context::new(&mut self.rng);
                self.nodes[idx].run(end_time, &mut ctx).expect("node run");
                ctx.into_outbox()
            };
            self.route(src_rack, outbox);
        }

        fn round(&mut self, timer: &mut Time) {
            *timer += ROUND;
            self.run_node(4, *timer);
            for idx in 0..4 {
                self.run_node(idx, *timer);
            }
        }

        fn issue(&mut self, op: Operation, time: Time) {
            let src_rack = self.nodes[4].rack();
            let outbox = {
                let mut ctx = Context::new(&mut self.rng);
                let app = self.nodes[4]
                    .app_mut()
                    .expect("app registered")
                    .as_any_mut()
                    .downcast_mut::<PegasusKVClient>()
                    .expect("client app");
                app.issue(op, time, &mut ctx).expect("issue succeeds");
                ctx.into_outbox()
            };
            self.route(src_rack, outbox);
        }

        fn server(&self, idx: usize) -> &PegasusKVServer {
            self.nodes[idx]
                .app()
                .expect("app registered")
                .as_any()
                .downcast_ref::<PegasusKVServer>()
                .expect("server app")
        }

        fn sharers(&self, dir: usize, key: &str) -> Vec<NodeId> {
            self.server(dir)
                .directory()
                .get(key)
                .map(|e| e.sharers.iter().copied().collect())
                .unwrap_or_default()
        }
    }

    #[test]
    fn directory_protocol_walkthrough() {
        let stats = Rc::new(RefCell::new(KVStats::new()));
        let config = Rc::new(RefCell::new(ScriptedCacheConfig {
            cache_nodes: vec![0, 1, 2, 3],
            dir_slot: 0,
            next_cache: 0,
        }));
        let handle: PegasusConfigHandle = config.clone();
        let mut bed = TestBed::build(handle, stats.clone());
        let mut timer = 0;

        // PUT k1 v1: no sharers yet, so the directory installs locally and
        // becomes the only sharer.
        bed.issue(Operation::put("k1", "v1"), timer);
        bed.round(&mut timer);
        assert_eq!(bed.server(0).store()["k1"], "v1");
        assert_eq!(bed.sharers(0, "k1"), vec![0]);
        bed.round(&mut timer);
        assert_eq!(stats.borrow().received(OpType::Put), 1);

        // GET k1 through node 0: local hit.
        config.borrow_mut().next_cache = 0;
        bed.issue(Operation::get("k1"), timer);
        for _ in 0..2 {
            bed.round(&mut timer);
        }
        assert_eq!(stats.borrow().received(OpType::Get), 1);
        assert_eq!(stats.borrow().cache_hits(), 1);

        // PUT k2 v2: same first-write path.
        bed.issue(Operation::put("k2", "v2"), timer);
        for _ in 0..2 {
            bed.round(&mut timer);
        }
        assert_eq!(bed.sharers(0, "k2"), vec![0]);
        assert_eq!(bed.server(0).store()["k2"], "v2");
        assert_eq!(stats.borrow().received(OpType::Put), 2);

        // GET k1 through node 1: miss, forward to the directory, serve from
        // sharer 0, install on node 1 on the way back.
        config.borrow_mut().next_cache = 1;
        bed.issue(Operation::get("k1"), timer);
        bed.round(&mut timer);
        assert!(!bed.sharers(0, "k1").contains(&1));
        assert!(!bed.server(1).store().contains_key("k1"));
        assert_eq!(stats.borrow().received(OpType::Get), 1);
        bed.round(&mut timer);
        assert!(bed.sharers(0, "k1").contains(&1));
        assert!(!bed.server(1).store().contains_key("k1"));
        assert_eq!(stats.borrow().received(OpType::Get), 1);
        bed.round(&mut timer);
        assert_eq!(bed.server(1).store()["k1"], "v1");
        assert_eq!(stats.borrow().received(OpType::Get), 1);
        bed.round(&mut timer);
        assert_eq!(stats.borrow().received(OpType::Get), 2);
        assert_eq!(stats.borrow().cache_hits(), 2);

        // GET k1 through node 2 grows the sharer set again.
        config.borrow_mut().next_cache = 2;
        bed.issue(Operation::get("k1"), timer);
        for _ in 0..4 {
            bed.round(&mut timer);
        }
        assert!(bed.sharers(0, "k1").contains(&2));
        assert_eq!(bed.server(2).store()["k1"], "v1");
        assert_eq!(stats.borrow().received(OpType::Get), 3);
        assert_eq!(stats.borrow().cache_hits(), 3);

        // PUT k1 vv1 fans out to all three sharers; the writer waits for
        // the directory-announced ack count.
        bed.issue(Operation::put("k1", "vv1"), timer);
        bed.round(&mut timer);
        assert_eq!(bed.sharers(0, "k1"), vec![0, 1, 2]);
        assert_eq!(bed.server(0).store()["k1"], "vv1");
        for i in 1..3 {
            assert_eq!(bed.server(i).store()["k1"], "v1");
        }
        assert_eq!(stats.borrow().received(OpType::Put), 2);
        bed.round(&mut timer);
        for i in 0..3 {
            assert_eq!(bed.server(i).store()["k1"], "vv1");
        }
        assert_eq!(stats.borrow().received(OpType::Put), 2);
        bed.round(&mut timer);
        assert_eq!(bed.sharers(0, "k1"), vec![0, 1, 2]);
        assert_eq!(stats.borrow().received(OpType::Put), 3);

        // DEL k1 clears every sharer and empties the sharer set.
        bed.issue(Operation::del("k1"), timer);
        bed.round(&mut timer);
        assert!(bed.sharers(0, "k1").is_empty());
        assert!(!bed.server(0).store().contains_key("k1"));
        for i in 1..3 {
            assert_eq!(bed.server(i).store()["k1"], "vv1");
        }
        assert_eq!(stats.borrow().received(OpType::Del), 0);
        bed.round(&mut timer);
        for i in 0..3 {
            assert!(!bed.server(i).store().contains_key("k1"));
        }
        assert_eq!(stats.borrow().received(OpType::Del), 0);
        bed.round(&mut timer);
        assert_eq!(stats.borrow().received(OpType::Del), 1);

        // GET k1 through node 2 after the DEL: miss at the cache, miss at
        // the directory, NOT_FOUND travels back through the cache node.
        config.borrow_mut().next_cache = 2;
        bed.issue(Operation::get("k1"), timer);
        bed.round(&mut timer);
        assert_eq!(stats.borrow().received(OpType::Get), 3);
        bed.round(&mut timer);
        assert!(bed.sharers(0, "k1").is_empty());
        bed.round(&mut timer);
        assert!(!bed.server(2).store().contains_key("k1"));
        bed.round(&mut timer);
        assert_eq!(stats.borrow().received(OpType::Get), 4);
        assert_eq!(stats.borrow().cache_hits(), 3);
        assert_eq!(stats.borrow().cache_misses(), 1);
    }

    #[test]
    fn delete_of_uncached_key_completes_with_zero_acks() {
        let stats = Rc::new(RefCell::new(KVStats::new()));
        let config = Rc::new(RefCell::new(ScriptedCacheConfig {
            cache_nodes: vec![0, 1, 2, 3],
            dir_slot: 0,
            next_cache: 0,
        }));
        let handle: PegasusConfigHandle = config;
        let mut bed = TestBed::build(handle, stats.clone());
        let mut timer = 0;

        bed.issue(Operation::del("ghost"), timer);
        for _ in 0..2 {
            bed.round(&mut timer);
        }
        // No sharers: the directory reply alone satisfies the request.
        assert_eq!(stats.borrow().received(OpType::Del), 1);
    }

    #[test]
    fn servers_reject_directory_replies() {
        let stats = Rc::new(RefCell::new(KVStats::new()));
        let config: PegasusConfigHandle = Rc::new(RefCell::new(
            SingleDirectoryConfig::new(vec![0, 1], 0).expect("valid config"),
        ));
        let mut server = PegasusKVServer::new(config.clone());
        server.register_node(1);

        let mut rng = StdRng::seed_from_u64(9);
        let mut ctx = Context::new(&mut rng);
        let msg = PegasusMessage::DirReply(DirectoryReply {
            req_id: 0,
            num_acks: 1,
        });
        let err = server.process_message(msg, 10, &mut ctx).unwrap_err();
        assert!(matches!(err, SimError::Protocol(_)));

        let mut client = PegasusKVClient::new(config, stats, None);
        client.register_node(4);
        let msg = PegasusMessage::Reply(PegasusReply {
            req_id: 7,
            result: OpResult::Ok,
            value: String::new(),
        });
        let err = client.process_message(msg, 10, &mut ctx).unwrap_err();
        assert!(matches!(err, SimError::Protocol(_)));
    }

    #[test]
    fn single_directory_config_validates_and_selects() {
        assert!(SingleDirectoryConfig::new(vec![], 0).is_err());
        assert!(SingleDirectoryConfig::new(vec![0, 1], 2).is_err());

        let mut config = SingleDirectoryConfig::new(vec![3, 5, 7], 1).expect("valid config");
        assert_eq!(config.select_dir_node(9, "k"), 5);
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..32 {
            let picked = config.select_cache_node(9, "k", &mut rng);
            assert!([3, 5, 7].contains(&picked));
        }
    }
}
