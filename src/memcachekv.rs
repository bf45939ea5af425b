//! Memcache-style distributed key-value store: client and server state
//! machines plus the configuration policies that place keys on cache nodes.
//!
//! A configuration answers one question per request: which nodes does this
//! key currently live on, and should serving this GET also copy the key
//! somewhere cooler? Policies range from stateless hashing to load-aware
//! variants that track outstanding requests (instantaneous load), per-key
//! request rates (projected load), or long-run averages. Clients report
//! every send and every received reply so the policies can keep their load
//! accounting exact: load goes up on send, down on receive.
//!
//! Write fan-out is governed by the write mode: ANYNODE writes one replica,
//! UPDATE writes all of them, INVALIDATE writes the first and deletes the
//! rest. DELs always go to every replica.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;

use log::debug;
use rand::Rng;

use crate::application::{Application, Context};
use crate::kv::{
    execute_op, KVStats, KVWorkloadGenerator, OpResult, OpType, Operation, REQ_ID_LEN, RES_LEN,
};
use crate::message::Payload;
use crate::simulator::Service;
use crate::{NodeId, SimError, Time};

/// Request message. `src` is the reply address; migration writes carry no
/// reply address so the receiving server stays silent.
#[derive(Debug, Clone)]
pub struct MemcacheRequest {
    pub src: Option<NodeId>,
    pub req_id: u64,
    pub op: Operation,
    /// GET side-channel: after serving, forward the value as an unsolicited
    /// PUT to these nodes.
    pub migration_dests: Option<Vec<NodeId>>,
    /// Set on server-driven migration writes; the receiver reports
    /// `(key, src, self)` so the config can flip the canonical mapping.
    pub migration_src: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct MemcacheReply {
    pub src: NodeId,
    pub req_id: u64,
    pub result: OpResult,
    pub value: String,
}

#[derive(Debug, Clone)]
pub enum MemcacheMessage {
    Request(MemcacheRequest),
    Reply(MemcacheReply),
}

impl Payload for MemcacheMessage {
    fn wire_len(&self) -> usize {
        match self {
            MemcacheMessage::Request(req) => REQ_ID_LEN + req.op.wire_len(),
            MemcacheMessage::Reply(rep) => REQ_ID_LEN + RES_LEN + rep.value.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    AnyNode,
    Update,
    Invalidate,
}

/// Result of a placement query: current destinations plus an optional
/// migration hint for the nodes the key should additionally be copied to.
#[derive(Debug, Clone)]
pub struct MappedNodes {
    pub dst_nodes: Vec<NodeId>,
    pub migration_nodes: Option<Vec<NodeId>>,
}

impl MappedNodes {
    fn single(node: NodeId) -> Self {
        Self {
            dst_nodes: vec![node],
            migration_nodes: None,
        }
    }
}

/// Deterministic key hash: first 8 little-endian bytes of the BLAKE3 digest.
/// Stable across processes, unlike the std hasher.
pub fn default_key_hash(key: &str) -> u64 {
    let digest = blake3::hash(key.as_bytes());
    let bytes: [u8; 8] = digest.as_bytes()[..8]
        .try_into()
        .expect("digest is 32 bytes");
    u64::from_le_bytes(bytes)
}

/// Placement policy interface shared by every memcache-style configuration.
///
/// `key_to_nodes` decides destinations (and migration hints); the report
/// hooks keep the policy's load accounting in sync with the client and the
/// servers; `reset` restores construction-time state. Periodic work (load
/// collection, rebalancing) runs through the [`Service`] supertrait.
pub trait MemcacheKVConfiguration: Service {
    fn write_mode(&self) -> WriteMode;

    /// Whether servers should report per-key request counts.
    fn report_load(&self) -> bool {
        false
    }

    /// Maps `key` to its destination node set for the given operation type.
    fn key_to_nodes(&mut self, key: &str, op_type: OpType) -> MappedNodes;

    /// Client is sending an operation to `node`.
    fn report_op_send(&mut self, _node: NodeId, _op: &Operation, _time: Time) {}

    /// Client received a reply from `node`.
    fn report_op_receive(&mut self, _node: NodeId) {}

    /// Server-side per-key request accounting (used when `report_load`).
    fn report_key_request(&mut self, _key: &str) {}

    /// A migration write from `src` landed on `dst`; flip the canonical
    /// mapping for `key`.
    fn report_migration(&mut self, _key: &str, _src: NodeId, _dst: NodeId) {}

    /// Where `node` should push a key if it is overloaded right now; `None`
    /// when no migration is warranted.
    fn migration_target(&self, _node: NodeId) -> Option<NodeId> {
        None
    }

    /// Restores construction-time state: mappings, counters, loads.
    fn reset(&mut self) {}
}

pub type ConfigHandle = Rc<RefCell<dyn MemcacheKVConfiguration>>;

/// Cache node roster shared by the policies: node ids plus the reverse
/// slot lookup. Policies do their bookkeeping in slot space (position in
/// the roster) and translate to node ids at the edges.
#[derive(Debug, Clone)]
struct CacheNodes {
    nodes: Vec<NodeId>,
    slots: HashMap<NodeId, usize>,
}

impl CacheNodes {
    fn new(nodes: Vec<NodeId>) -> Result<Self, SimError> {
        if nodes.is_empty() {
            return Err(SimError::Config("policy needs at least one cache node".into()));
        }
        let mut slots = HashMap::new();
        for (slot, &id) in nodes.iter().enumerate() {
            if slots.insert(id, slot).is_some() {
                return Err(SimError::Config(format!("duplicate cache node id {id}")));
            }
        }
        Ok(Self { nodes, slots })
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, slot: usize) -> NodeId {
        self.nodes[slot]
    }

    fn slot(&self, node: NodeId) -> Option<usize> {
        self.slots.get(&node).copied()
    }
}

fn check_load_bound(c: f64) -> Result<(), SimError> {
    if c < 1.0 {
        return Err(SimError::Config(format!("load bound must be >= 1, got {c}")));
    }
    Ok(())
}

/// Stateless `hash(key) mod N` placement.
pub struct StaticConfig {
    cache: CacheNodes,
    write_mode: WriteMode,
    key_hash: fn(&str) -> u64,
}

impl StaticConfig {
    pub fn new(cache_nodes: Vec<NodeId>, write_mode: WriteMode) -> Result<Self, SimError> {
        Ok(Self {
            cache: CacheNodes::new(cache_nodes)?,
            write_mode,
            key_hash: default_key_hash,
        })
    }

    pub fn with_key_hash(mut self, key_hash: fn(&str) -> u64) -> Self {
        self.key_hash = key_hash;
        self
    }
}

impl Service for StaticConfig {}

impl MemcacheKVConfiguration for StaticConfig {
    fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn key_to_nodes(&mut self, key: &str, _op_type: OpType) -> MappedNodes {
        let slot = (self.key_hash)(key) as usize % self.cache.len();
        MappedNodes::single(self.cache.node(slot))
    }
}

/// Periodic greedy rebalancer: every `report_interval` the per-key request
/// counters are converted to rates and packed hottest-key-first onto the
/// coolest nodes, replicating a key across the smallest node set whose
/// members can each absorb an equal share under `max_request_rate`.
pub struct LoadBalanceConfig {
    cache: CacheNodes,
    write_mode: WriteMode,
    key_hash: fn(&str) -> u64,
    key_node_map: HashMap<String, Vec<usize>>,
    key_request_counter: HashMap<String, u64>,
    agg_key_request_rate: HashMap<String, u64>,
    max_request_rate: u64,
    report_interval: Time,
    last_rebalance: Time,
}

impl LoadBalanceConfig {
    pub fn new(
        cache_nodes: Vec<NodeId>,
        write_mode: WriteMode,
        max_request_rate: u64,
        report_interval: Time,
    ) -> Result<Self, SimError> {
        if report_interval == 0 {
            return Err(SimError::Config("rebalance interval must be positive".into()));
        }
        Ok(Self {
            cache: CacheNodes::new(cache_nodes)?,
            write_mode,
            key_hash: default_key_hash,
            key_node_map: HashMap::new(),
            key_request_counter: HashMap::new(),
            agg_key_request_rate: HashMap::new(),
            max_request_rate,
            report_interval,
            last_rebalance: 0,
        })
    }

    pub fn with_key_hash(mut self, key_hash: fn(&str) -> u64) -> Self {
        self.key_hash = key_hash;
        self
    }

    /// Converts the window's request counters to per-second rates.
    pub fn collect_load(&mut self, interval: Time) {
        let secs = interval as f64 / 1_000_000.0;
        for (key, count) in self.key_request_counter.drain() {
            let rate = (count as f64 / secs).round() as u64;
            *self.agg_key_request_rate.entry(key).or_insert(0) += rate;
        }
    }

    /// Re-packs keys onto nodes, hottest key to coolest node first.
    pub fn rebalance_load(&mut self) {
        let mut sorted_krr: Vec<(u64, String)> = self
            .agg_key_request_rate
            .drain()
            .map(|(key, rate)| (rate, key))
            .collect();
        sorted_krr.sort();
        let mut nodes: BinaryHeap<Reverse<(u64, usize)>> =
            (0..self.cache.len()).map(|slot| Reverse((0, slot))).collect();

        let rebalanced = sorted_krr.len();
        while let Some((rate, key)) = sorted_krr.pop() {
            let Some(Reverse((node_rate, slot))) = nodes.pop() else {
                break;
            };
            if node_rate + rate <= self.max_request_rate {
                self.key_node_map.insert(key, vec![slot]);
                nodes.push(Reverse((node_rate + rate, slot)));
            } else {
                // Replicate across the smallest cool set where an equal
                // share of the rate fits everywhere.
                let mut members = vec![(node_rate, slot)];
                while let Some(Reverse(next)) = nodes.pop() {
                    members.push(next);
                    let share = rate / members.len() as u64;
                    if members.iter().all(|&(r, _)| r + share <= self.max_request_rate) {
                        break;
                    }
                }
                let share = rate / members.len() as u64;
                let mut slots = Vec::with_capacity(members.len());
                for (member_rate, member_slot) in members {
                    slots.push(member_slot);
                    nodes.push(Reverse((member_rate + share, member_slot)));
                }
                self.key_node_map.insert(key, slots);
            }
        }
        debug!("rebalanced {rebalanced} keys across {} nodes", self.cache.len());
    }
}

impl Service for LoadBalanceConfig {
    fn run(&mut self, end_time: Time) {
        if end_time - self.last_rebalance >= self.report_interval {
            self.collect_load(end_time - self.last_rebalance);
            self.rebalance_load();
            self.last_rebalance = end_time;
        }
    }
}

impl MemcacheKVConfiguration for LoadBalanceConfig {
    fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn report_load(&self) -> bool {
        true
    }

    fn key_to_nodes(&mut self, key: &str, _op_type: OpType) -> MappedNodes {
        let default_slot = (self.key_hash)(key) as usize % self.cache.len();
        let slots = self
            .key_node_map
            .entry(key.to_string())
            .or_insert_with(|| vec![default_slot]);
        MappedNodes {
            dst_nodes: slots.iter().map(|&slot| self.cache.node(slot)).collect(),
            migration_nodes: None,
        }
    }

    fn report_key_request(&mut self, key: &str) {
        *self.key_request_counter.entry(key.to_string()).or_insert(0) += 1;
    }

    fn reset(&mut self) {
        self.key_node_map.clear();
        self.key_request_counter.clear();
        self.agg_key_request_rate.clear();
        self.last_rebalance = 0;
    }
}

/// Consistent hashing with bounded load: a GET whose mapped node carries
/// more than `c` times the mean outstanding load walks forward modulo N to
/// the next node under the bound, and the key migrates there.
pub struct BoundedLoadConfig {
    cache: CacheNodes,
    write_mode: WriteMode,
    key_hash: fn(&str) -> u64,
    c: f64,
    outstanding: Vec<u64>,
    key_node_map: HashMap<String, usize>,
}

impl BoundedLoadConfig {
    pub fn new(cache_nodes: Vec<NodeId>, write_mode: WriteMode, c: f64) -> Result<Self, SimError> {
        check_load_bound(c)?;
        let cache = CacheNodes::new(cache_nodes)?;
        let n = cache.len();
        Ok(Self {
            cache,
            write_mode,
            key_hash: default_key_hash,
            c,
            outstanding: vec![0; n],
            key_node_map: HashMap::new(),
        })
    }

    pub fn with_key_hash(mut self, key_hash: fn(&str) -> u64) -> Self {
        self.key_hash = key_hash;
        self
    }

    fn mapped_slot(&self, key: &str) -> usize {
        self.key_node_map
            .get(key)
            .copied()
            .unwrap_or_else(|| (self.key_hash)(key) as usize % self.cache.len())
    }
}

impl Service for BoundedLoadConfig {}

impl MemcacheKVConfiguration for BoundedLoadConfig {
    fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn key_to_nodes(&mut self, key: &str, op_type: OpType) -> MappedNodes {
        let slot = self.mapped_slot(key);
        if op_type != OpType::Get {
            // Writes always follow the current mapping.
            return MappedNodes::single(self.cache.node(slot));
        }

        let n = self.cache.len();
        let total: u64 = self.outstanding.iter().sum();
        let expected = self.c * total as f64 / n as f64;
        if self.outstanding[slot] as f64 <= expected {
            return MappedNodes::single(self.cache.node(slot));
        }

        // Mapped node is over the bound; walk forward to the next node
        // under it. With c >= 1 at least one such node exists.
        let mut next = (slot + 1) % n;
        while self.outstanding[next] as f64 > expected {
            next = (next + 1) % n;
        }
        debug_assert_ne!(next, slot);
        self.key_node_map.insert(key.to_string(), next);
        debug!("bounded-load: migrating key to slot {next}");
        MappedNodes {
            dst_nodes: vec![self.cache.node(slot)],
            migration_nodes: Some(vec![self.cache.node(next)]),
        }
    }

    fn report_op_send(&mut self, node: NodeId, _op: &Operation, _time: Time) {
        if let Some(slot) = self.cache.slot(node) {
            self.outstanding[slot] += 1;
        }
    }

    fn report_op_receive(&mut self, node: NodeId) {
        if let Some(slot) = self.cache.slot(node) {
            self.outstanding[slot] = self.outstanding[slot].saturating_sub(1);
        }
    }

    fn reset(&mut self) {
        self.key_node_map.clear();
        self.outstanding.fill(0);
    }
}

/// Request rate of a single key over the run so far. A key seen at most
/// once has no measurable rate.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyRate {
    pub count: u64,
    pub time: Time,
}

impl KeyRate {
    pub fn new(count: u64, time: Time) -> Self {
        Self { count, time }
    }

    pub fn rate(&self) -> f64 {
        if self.time == 0 || self.count <= 1 {
            return 0.0;
        }
        self.count as f64 / (self.time as f64 / 1_000_000.0)
    }
}

/// Which load signal triggers migration in [`BoundedIPLoadConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Outstanding requests only.
    ILoad,
    /// Projected (rate-based) load only.
    PLoad,
    /// Both signals must exceed the bound.
    IPLoad,
}

/// Bounded load over instantaneous and/or projected load. Instantaneous
/// load is the outstanding request count; projected load is the sum of the
/// measured rates of the keys currently mapped to a node.
pub struct BoundedIPLoadConfig {
    cache: CacheNodes,
    write_mode: WriteMode,
    key_hash: fn(&str) -> u64,
    c: f64,
    mode: LoadMode,
    key_node_map: HashMap<String, usize>,
    key_rates: HashMap<String, KeyRate>,
    iloads: Vec<u64>,
    ploads: Vec<f64>,
}

impl BoundedIPLoadConfig {
    pub fn new(
        cache_nodes: Vec<NodeId>,
        write_mode: WriteMode,
        c: f64,
        mode: LoadMode,
    ) -> Result<Self, SimError> {
        check_load_bound(c)?;
        let cache = CacheNodes::new(cache_nodes)?;
        let n = cache.len();
        Ok(Self {
            cache,
            write_mode,
            key_hash: default_key_hash,
            c,
            mode,
            key_node_map: HashMap::new(),
            key_rates: HashMap::new(),
            iloads: vec![0; n],
            ploads: vec![0.0; n],
        })
    }

    pub fn with_key_hash(mut self, key_hash: fn(&str) -> u64) -> Self {
        self.key_hash = key_hash;
        self
    }

    fn mapped_slot(&self, key: &str) -> usize {
        self.key_node_map
            .get(key)
            .copied()
            .unwrap_or_else(|| (self.key_hash)(key) as usize % self.cache.len())
    }

    fn pload_sorted_slots(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.cache.len()).collect();
        order.sort_by(|&a, &b| {
            self.ploads[a]
                .partial_cmp(&self.ploads[b])
                .expect("loads are finite")
                .then(a.cmp(&b))
        });
        order
    }
}

impl Service for BoundedIPLoadConfig {}

impl MemcacheKVConfiguration for BoundedIPLoadConfig {
    fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn key_to_nodes(&mut self, key: &str, op_type: OpType) -> MappedNodes {
        let slot = self.mapped_slot(key);
        if op_type != OpType::Get {
            return MappedNodes::single(self.cache.node(slot));
        }

        let n = self.cache.len();
        let total_iload: u64 = self.iloads.iter().sum();
        let expected_iload = self.c * total_iload as f64 / n as f64;
        let total_pload: f64 = self.ploads.iter().sum();
        let expected_pload = self.c * total_pload / n as f64;

        if matches!(self.mode, LoadMode::ILoad | LoadMode::IPLoad)
            && self.iloads[slot] as f64 <= expected_iload
        {
            return MappedNodes::single(self.cache.node(slot));
        }
        if matches!(self.mode, LoadMode::PLoad | LoadMode::IPLoad)
            && self.ploads[slot] <= expected_pload
        {
            return MappedNodes::single(self.cache.node(slot));
        }

        let next = match self.mode {
            LoadMode::ILoad => (0..n)
                .min_by_key(|&s| (self.iloads[s], s))
                .expect("at least one node"),
            LoadMode::PLoad => self.pload_sorted_slots()[0],
            LoadMode::IPLoad => {
                // Walk the pload-ascending list for a node that also fits
                // the instantaneous bound.
                let mut found = None;
                for s in self.pload_sorted_slots() {
                    if self.ploads[s] > expected_pload {
                        break;
                    }
                    if self.iloads[s] as f64 <= expected_iload {
                        found = Some(s);
                        break;
                    }
                }
                match found {
                    Some(s) => s,
                    None => return MappedNodes::single(self.cache.node(slot)),
                }
            }
        };

        debug_assert_ne!(next, slot);
        self.key_node_map.insert(key.to_string(), next);
        let rate = self.key_rates.get(key).map(KeyRate::rate).unwrap_or(0.0);
        self.ploads[slot] -= rate;
        self.ploads[next] += rate;
        MappedNodes {
            dst_nodes: vec![self.cache.node(slot)],
            migration_nodes: Some(vec![self.cache.node(next)]),
        }
    }

    fn report_op_send(&mut self, node: NodeId, op: &Operation, time: Time) {
        if let Some(slot) = self.cache.slot(node) {
            self.iloads[slot] += 1;
        }
        let key_rate = self.key_rates.entry(op.key.clone()).or_default();
        let old_rate = key_rate.rate();
        key_rate.count += 1;
        key_rate.time = time;
        let new_rate = key_rate.rate();
        let mapped = self.mapped_slot(&op.key);
        self.ploads[mapped] += new_rate - old_rate;
    }

    fn report_op_receive(&mut self, node: NodeId) {
        if let Some(slot) = self.cache.slot(node) {
            self.iloads[slot] = self.iloads[slot].saturating_sub(1);
        }
    }

    fn reset(&mut self) {
        self.key_node_map.clear();
        self.key_rates.clear();
        self.iloads.fill(0);
        self.ploads.fill(0.0);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct AverageLoad {
    count: u64,
    time: Time,
}

impl AverageLoad {
    fn load(&self) -> f64 {
        if self.time == 0 || self.count <= 1 {
            return 0.0;
        }
        self.count as f64 / (self.time as f64 / 1_000_000.0)
    }
}

/// Bounded load over long-run per-node average request rates; migrates a
/// GET to the globally least-loaded node when the mapped node exceeds
/// `c` times the mean.
pub struct BoundedAverageLoadConfig {
    cache: CacheNodes,
    write_mode: WriteMode,
    key_hash: fn(&str) -> u64,
    c: f64,
    key_node_map: HashMap<String, usize>,
    loads: Vec<AverageLoad>,
}

impl BoundedAverageLoadConfig {
    pub fn new(cache_nodes: Vec<NodeId>, write_mode: WriteMode, c: f64) -> Result<Self, SimError> {
        check_load_bound(c)?;
        let cache = CacheNodes::new(cache_nodes)?;
        let n = cache.len();
        Ok(Self {
            cache,
            write_mode,
            key_hash: default_key_hash,
            c,
            key_node_map: HashMap::new(),
            loads: vec![AverageLoad::default(); n],
        })
    }

    pub fn with_key_hash(mut self, key_hash: fn(&str) -> u64) -> Self {
        self.key_hash = key_hash;
        self
    }

    fn mapped_slot(&self, key: &str) -> usize {
        self.key_node_map
            .get(key)
            .copied()
            .unwrap_or_else(|| (self.key_hash)(key) as usize % self.cache.len())
    }
}

impl Service for BoundedAverageLoadConfig {}

impl MemcacheKVConfiguration for BoundedAverageLoadConfig {
    fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn key_to_nodes(&mut self, key: &str, op_type: OpType) -> MappedNodes {
        let slot = self.mapped_slot(key);
        if op_type != OpType::Get {
            return MappedNodes::single(self.cache.node(slot));
        }

        let n = self.cache.len();
        let total: f64 = self.loads.iter().map(AverageLoad::load).sum();
        let expected = self.c * total / n as f64;
        if self.loads[slot].load() <= expected {
            return MappedNodes::single(self.cache.node(slot));
        }

        let next = (0..n)
            .min_by(|&a, &b| {
                self.loads[a]
                    .load()
                    .partial_cmp(&self.loads[b].load())
                    .expect("loads are finite")
                    .then(a.cmp(&b))
            })
            .expect("at least one node");
        debug_assert_ne!(next, slot);
        self.key_node_map.insert(key.to_string(), next);
        MappedNodes {
            dst_nodes: vec![self.cache.node(slot)],
            migration_nodes: Some(vec![self.cache.node(next)]),
        }
    }

    fn report_op_send(&mut self, node: NodeId, _op: &Operation, time: Time) {
        if let Some(slot) = self.cache.slot(node) {
            self.loads[slot].count += 1;
            self.loads[slot].time = time;
        }
    }

    fn reset(&mut self) {
        self.key_node_map.clear();
        self.loads.fill(AverageLoad::default());
    }
}

/// Mapping-only policy for deployments where migration decisions are made
/// by the servers themselves (see [`MemcacheKVMigrationServer`]). Tracks
/// the same instantaneous/projected load signals as the client-driven
/// policies but never emits hints; the canonical mapping flips when a
/// migration write lands.
pub struct RoutingConfig {
    cache: CacheNodes,
    write_mode: WriteMode,
    key_hash: fn(&str) -> u64,
    c: f64,
    key_node_map: HashMap<String, usize>,
    key_rates: HashMap<String, KeyRate>,
    iloads: Vec<u64>,
    ploads: Vec<f64>,
}

impl RoutingConfig {
    pub fn new(cache_nodes: Vec<NodeId>, write_mode: WriteMode, c: f64) -> Result<Self, SimError> {
        check_load_bound(c)?;
        let cache = CacheNodes::new(cache_nodes)?;
        let n = cache.len();
        Ok(Self {
            cache,
            write_mode,
            key_hash: default_key_hash,
            c,
            key_node_map: HashMap::new(),
            key_rates: HashMap::new(),
            iloads: vec![0; n],
            ploads: vec![0.0; n],
        })
    }

    pub fn with_key_hash(mut self, key_hash: fn(&str) -> u64) -> Self {
        self.key_hash = key_hash;
        self
    }

    fn mapped_slot(&self, key: &str) -> usize {
        self.key_node_map
            .get(key)
            .copied()
            .unwrap_or_else(|| (self.key_hash)(key) as usize % self.cache.len())
    }
}

impl Service for RoutingConfig {}

impl MemcacheKVConfiguration for RoutingConfig {
    fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn key_to_nodes(&mut self, key: &str, _op_type: OpType) -> MappedNodes {
        MappedNodes::single(self.cache.node(self.mapped_slot(key)))
    }

    fn report_op_send(&mut self, node: NodeId, op: &Operation, time: Time) {
        if let Some(slot) = self.cache.slot(node) {
            self.iloads[slot] += 1;
        }
        let key_rate = self.key_rates.entry(op.key.clone()).or_default();
        let old_rate = key_rate.rate();
        key_rate.count += 1;
        key_rate.time = time;
        let new_rate = key_rate.rate();
        let mapped = self.mapped_slot(&op.key);
        self.ploads[mapped] += new_rate - old_rate;
    }

    fn report_op_receive(&mut self, node: NodeId) {
        if let Some(slot) = self.cache.slot(node) {
            self.iloads[slot] = self.iloads[slot].saturating_sub(1);
        }
    }

    fn migration_target(&self, node: NodeId) -> Option<NodeId> {
        let slot = self.cache.slot(node)?;
        let n = self.cache.len();
        let total_iload: u64 = self.iloads.iter().sum();
        let expected_iload = self.c * total_iload as f64 / n as f64;
        let total_pload: f64 = self.ploads.iter().sum();
        let expected_pload = self.c * total_pload / n as f64;

        // Migrate only when both signals put this node over the bound.
        if self.iloads[slot] as f64 <= expected_iload || self.ploads[slot] <= expected_pload {
            return None;
        }

        let mut order: Vec<usize> = (0..n).filter(|&s| s != slot).collect();
        order.sort_by(|&a, &b| {
            self.ploads[a]
                .partial_cmp(&self.ploads[b])
                .expect("loads are finite")
                .then(a.cmp(&b))
        });
        for s in order {
            if self.ploads[s] > expected_pload {
                break;
            }
            if self.iloads[s] as f64 <= expected_iload {
                return Some(self.cache.node(s));
            }
        }
        None
    }

    fn report_migration(&mut self, key: &str, src: NodeId, dst: NodeId) {
        let rate = self.key_rates.get(key).map(KeyRate::rate).unwrap_or(0.0);
        if let (Some(src_slot), Some(dst_slot)) = (self.cache.slot(src), self.cache.slot(dst)) {
            self.ploads[src_slot] -= rate;
            self.ploads[dst_slot] += rate;
            self.key_node_map.insert(key.to_string(), dst_slot);
            debug!("migration landed: key now maps to slot {dst_slot}");
        }
    }

    fn reset(&mut self) {
        self.key_node_map.clear();
        self.key_rates.clear();
        self.iloads.fill(0);
        self.ploads.fill(0.0);
    }
}

struct PendingRequest {
    op: Operation,
    time: Time,
    received_acks: usize,
    expected_acks: usize,
}

/// Stateless client: every operation goes to remote cache nodes as chosen
/// by the configuration, and a pending-request table matches replies back
/// to operations.
pub struct MemcacheKVClient {
    node: NodeId,
    config: ConfigHandle,
    stats: Rc<RefCell<KVStats>>,
    generator: Option<Box<dyn KVWorkloadGenerator>>,
    primed: bool,
    next_op: Option<(Operation, Time)>,
    pending: HashMap<u64, PendingRequest>,
    next_req_id: u64,
}

impl MemcacheKVClient {
    pub fn new(
        config: ConfigHandle,
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

    /// Issues a single operation at `time`, dispatching by op type and
    /// write mode.
    fn issue(
        &mut self,
        op: Operation,
        time: Time,
        ctx: &mut Context<'_, MemcacheMessage>,
    ) -> Result<(), SimError> {
        let mapped = self.config.borrow_mut().key_to_nodes(&op.key, op.op_type);
        debug_assert!(!mapped.dst_nodes.is_empty());
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        let mut pending = PendingRequest {
            op: op.clone(),
            time,
            received_acks: 0,
            expected_acks: 1,
        };

        let request = |op: Operation, migration_dests: Option<Vec<NodeId>>| {
            MemcacheMessage::Request(MemcacheRequest {
                src: Some(self.node),
                req_id,
                op,
                migration_dests,
                migration_src: None,
            })
        };

        match op.op_type {
            OpType::Get => {
                let dst = mapped.dst_nodes[ctx.rng.gen_range(0..mapped.dst_nodes.len())];
                ctx.send(dst, request(op.clone(), mapped.migration_nodes.clone()), time);
                self.config.borrow_mut().report_op_send(dst, &op, time);
            }
            OpType::Put => {
                let (write_nodes, inval_nodes) = match self.config.borrow().write_mode() {
                    WriteMode::AnyNode => {
                        let dst =
                            mapped.dst_nodes[ctx.rng.gen_range(0..mapped.dst_nodes.len())];
                        (vec![dst], Vec::new())
                    }
                    WriteMode::Update => (mapped.dst_nodes.clone(), Vec::new()),
                    WriteMode::Invalidate => (
                        mapped.dst_nodes[..1].to_vec(),
                        mapped.dst_nodes[1..].to_vec(),
                    ),
                };
                for &dst in &write_nodes {
                    ctx.send(dst, request(op.clone(), None), time);
                    self.config.borrow_mut().report_op_send(dst, &op, time);
                }
                let inval_op = Operation::del(op.key.clone());
                for &dst in &inval_nodes {
                    ctx.send(dst, request(inval_op.clone(), None), time);
                    self.config.borrow_mut().report_op_send(dst, &inval_op, time);
                }
                pending.expected_acks = write_nodes.len() + inval_nodes.len();
            }
            OpType::Del => {
                for &dst in &mapped.dst_nodes {
                    ctx.send(dst, request(op.clone(), None), time);
                    self.config.borrow_mut().report_op_send(dst, &op, time);
                }
                pending.expected_acks = mapped.dst_nodes.len();
            }
        }

        self.pending.insert(req_id, pending);
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

impl Application for MemcacheKVClient {
    type Message = MemcacheMessage;

    fn register_node(&mut self, id: NodeId) {
        self.node = id;
    }

    fn execute(
        &mut self,
        end_time: Time,
        ctx: &mut Context<'_, MemcacheMessage>,
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
        msg: MemcacheMessage,
        time: Time,
        _ctx: &mut Context<'_, MemcacheMessage>,
    ) -> Result<(), SimError> {
        let MemcacheMessage::Reply(reply) = msg else {
            return Err(SimError::Protocol(format!(
                "client {} received a request message",
                self.node
            )));
        };
        self.config.borrow_mut().report_op_receive(reply.src);
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
            if request.received_acks >= request.expected_acks {
                self.complete(reply.req_id, OpResult::Ok, time);
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Cache server: executes operations against its local store, replies when
/// the request carries a return address, and forwards GET values to
/// migration targets named by the request.
pub struct MemcacheKVServer {
    node: NodeId,
    config: ConfigHandle,
    store: HashMap<String, String>,
}

impl MemcacheKVServer {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            node: 0,
            config,
            store: HashMap::new(),
        }
    }

    pub fn store(&self) -> &HashMap<String, String> {
        &self.store
    }
}

impl Application for MemcacheKVServer {
    type Message = MemcacheMessage;

    fn register_node(&mut self, id: NodeId) {
        self.node = id;
    }

    fn execute(
        &mut self,
        _end_time: Time,
        _ctx: &mut Context<'_, MemcacheMessage>,
    ) -> Result<(), SimError> {
        Ok(())
    }

    fn process_message(
        &mut self,
        msg: MemcacheMessage,
        time: Time,
        ctx: &mut Context<'_, MemcacheMessage>,
    ) -> Result<(), SimError> {
        let MemcacheMessage::Request(req) = msg else {
            return Err(SimError::Protocol(format!(
                "server {} received a reply message",
                self.node
            )));
        };
        if self.config.borrow().report_load() {
            self.config.borrow_mut().report_key_request(&req.op.key);
        }
        let (result, value) = execute_op(&mut self.store, &req.op);
        if let Some(src) = req.src {
            ctx.send(
                src,
                MemcacheMessage::Reply(MemcacheReply {
                    src: self.node,
                    req_id: req.req_id,
                    result,
                    value: value.clone(),
                }),
                time,
            );
        }
        if let Some(dests) = &req.migration_dests {
            // Side channel: copy the just-read value to the hinted nodes as
            // unsolicited writes with no return address.
            debug_assert_eq!(req.op.op_type, OpType::Get);
            for &dst in dests {
                ctx.send(
                    dst,
                    MemcacheMessage::Request(MemcacheRequest {
                        src: None,
                        req_id: req.req_id,
                        op: Operation::put(req.op.key.clone(), value.clone()),
                        migration_dests: None,
                        migration_src: None,
                    }),
                    time,
                );
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Migration-aware server for [`RoutingConfig`] deployments: after serving
/// a client GET or PUT it checks its own load and, if overloaded, pushes
/// the key's value to the policy's chosen target. The receiving server
/// installs the value and reports the migration so the mapping flips.
pub struct MemcacheKVMigrationServer {
    node: NodeId,
    config: ConfigHandle,
    store: HashMap<String, String>,
}

impl MemcacheKVMigrationServer {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            node: 0,
            config,
            store: HashMap::new(),
        }
    }

    pub fn store(&self) -> &HashMap<String, String> {
        &self.store
    }
}

impl Application for MemcacheKVMigrationServer {
    type Message = MemcacheMessage;

    fn register_node(&mut self, id: NodeId) {
        self.node = id;
    }

    fn execute(
        &mut self,
        _end_time: Time,
        _ctx: &mut Context<'_, MemcacheMessage>,
    ) -> Result<(), SimError> {
        Ok(())
    }

    fn process_message(
        &mut self,
        msg: MemcacheMessage,
        time: Time,
        ctx: &mut Context<'_, MemcacheMessage>,
    ) -> Result<(), SimError> {
        let MemcacheMessage::Request(req) = msg else {
            return Err(SimError::Protocol(format!(
                "server {} received a reply message",
                self.node
            )));
        };

        // A migration write from a peer: install and flip the mapping.
        if let Some(src) = req.migration_src {
            debug_assert_eq!(req.op.op_type, OpType::Put);
            execute_op(&mut self.store, &req.op);
            self.config
                .borrow_mut()
                .report_migration(&req.op.key, src, self.node);
            return Ok(());
        }

        let (result, value) = execute_op(&mut self.store, &req.op);
        if let Some(src) = req.src {
            ctx.send(
                src,
                MemcacheMessage::Reply(MemcacheReply {
                    src: self.node,
                    req_id: req.req_id,
                    result,
                    value,
                }),
                time,
            );
        }

        // Serving a client read or write may have left this node overloaded;
        // push the key to a cooler node if the policy names one.
        if req.src.is_some() && matches!(req.op.op_type, OpType::Get | OpType::Put) {
            if let Some(target) = self.config.borrow().migration_target(self.node) {
                if let Some(current) = self.store.get(&req.op.key).cloned() {
                    ctx.send(
                        target,
                        MemcacheMessage::Request(MemcacheRequest {
                            src: None,
                            req_id: req.req_id,
                            op: Operation::put(req.op.key.clone(), current),
                            migration_dests: None,
                            migration_src: Some(self.node),
                        }),
                        time,
                    );
                }
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
