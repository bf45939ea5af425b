//! Key-value application building blocks: operations, local store
//! execution, the workload-generator interface, and KV-level statistics.

use std::collections::HashMap;

use rand::rngs::StdRng;

use crate::simulator::Service;
use crate::stats::Stats;
use crate::Time;

/// Wire length of the operation tag.
pub const OP_TYPE_LEN: usize = 1;
/// Wire length of a result tag.
pub const RES_LEN: usize = 1;
/// Wire length of a request id.
pub const REQ_ID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Get,
    Put,
    Del,
}

impl OpType {
    fn index(self) -> usize {
        match self {
            OpType::Get => 0,
            OpType::Put => 1,
            OpType::Del => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub op_type: OpType,
    pub key: String,
    pub value: String,
}

impl Operation {
    pub fn get(key: impl Into<String>) -> Self {
        Self {
            op_type: OpType::Get,
            key: key.into(),
            value: String::new(),
        }
    }

    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op_type: OpType::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self {
            op_type: OpType::Del,
            key: key.into(),
            value: String::new(),
        }
    }

    pub fn wire_len(&self) -> usize {
        OP_TYPE_LEN + self.key.len() + self.value.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Ok,
    NotFound,
}

/// Executes a single operation against a local store. O(1), deterministic.
pub fn execute_op(store: &mut HashMap<String, String>, op: &Operation) -> (OpResult, String) {
    match op.op_type {
        OpType::Get => match store.get(&op.key) {
            Some(value) => (OpResult::Ok, value.clone()),
            None => (OpResult::NotFound, String::new()),
        },
        OpType::Put => {
            store.insert(op.key.clone(), op.value.clone());
            (OpResult::Ok, String::new())
        }
        OpType::Del => {
            store.remove(&op.key);
            (OpResult::Ok, String::new())
        }
    }
}

/// Supplies the client application with timestamped operations. Returning
/// `None` ends the issuing phase; outstanding requests keep draining.
pub trait KVWorkloadGenerator {
    fn next_operation(&mut self, rng: &mut StdRng) -> Option<(Operation, Time)>;
}

/// KV-level statistics: the base latency histogram plus cache hit/miss
/// accounting and per-op-type reply counts.
#[derive(Debug, Default)]
pub struct KVStats {
    stats: Stats,
    cache_hits: u64,
    cache_misses: u64,
    received_replies: [u64; 3],
}

impl KVStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables per-epoch latency rollups; `epoch_len` in microseconds.
    pub fn with_epoch_len(epoch_len: Time) -> Self {
        Self {
            stats: Stats::with_epoch_len(epoch_len),
            ..Self::default()
        }
    }

    /// Records one completed operation. For GETs, `hit` distinguishes cache
    /// hits from misses.
    pub fn report_op(&mut self, op_type: OpType, latency: Time, hit: bool) {
        self.stats.report_latency(latency);
        self.received_replies[op_type.index()] += 1;
        if op_type == OpType::Get {
            if hit {
                self.cache_hits += 1;
            } else {
                self.cache_misses += 1;
            }
        }
    }

    pub fn received(&self, op_type: OpType) -> u64 {
        self.received_replies[op_type.index()]
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses
    }

    /// Fraction of GETs that hit, if any GET completed.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return None;
        }
        Some(self.cache_hits as f64 / total as f64)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }
}

impl Service for KVStats {
    fn run(&mut self, end_time: Time) {
        self.stats.run(end_time);
    }
}
