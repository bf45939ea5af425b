//! Message plumbing shared by every application.

use std::cmp::Ordering;

use crate::{NodeId, Time};

/// Anything that can travel between nodes.
///
/// The kernel only needs a wire length (for transmission delay); semantics
/// live entirely in the application-level message enums.
pub trait Payload {
    /// Serialized length in bytes.
    fn wire_len(&self) -> usize;
}

/// A message sitting in a node's inflight set or ready queue.
///
/// Ordered by `(arrival, seq)`: the sequence number is assigned per receiving
/// node at enqueue time, so messages with equal arrival times are served in
/// the order they were handed to the network. This keeps per-node delivery a
/// total order and runs reproducible under a fixed seed.
#[derive(Debug)]
pub struct QueuedMessage<M> {
    pub arrival: Time,
    pub(crate) seq: u64,
    pub body: M,
}

impl<M> Eq for QueuedMessage<M> {}

impl<M> PartialEq for QueuedMessage<M> {
    fn eq(&self, other: &Self) -> bool {
        self.arrival == other.arrival && self.seq == other.seq
    }
}

impl<M> PartialOrd for QueuedMessage<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for QueuedMessage<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; we reverse the ordering to pop the
        // earliest arrival first.
        (other.arrival, other.seq).cmp(&(self.arrival, self.seq))
    }
}

/// An outbound message recorded by an application during a tick, addressed
/// by node id. The simulator (or a test harness) turns these into inflight
/// messages at the destination by sampling the network latency.
#[derive(Debug)]
pub struct Outbound<M> {
    pub dst: NodeId,
    pub send_time: Time,
    pub body: M,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn heap_pops_earliest_arrival_first() {
        let mut heap = BinaryHeap::new();
        heap.push(QueuedMessage { arrival: 90, seq: 0, body: () });
        heap.push(QueuedMessage { arrival: 45, seq: 1, body: () });
        heap.push(QueuedMessage { arrival: 70, seq: 2, body: () });

        let order: Vec<Time> = std::iter::from_fn(|| heap.pop().map(|m| m.arrival)).collect();
        assert_eq!(order, vec![45, 70, 90]);
    }

    #[test]
    fn equal_arrivals_stay_fifo() {
        let mut heap = BinaryHeap::new();
        for seq in 0..4u64 {
            heap.push(QueuedMessage { arrival: 50, seq, body: seq });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|m| m.body)).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
