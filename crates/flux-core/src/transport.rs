//! The group-transport contract (C1) and an in-process mock implementation.
//!
//! The real wire transport (TCP or otherwise) lives outside this crate's
//! scope per §1 — only the small contract every higher layer depends on is
//! specified here: reliable per-peer byte channels plus a handful of
//! collectives over a small "flow group", kept deliberately separate from
//! the data-plane streams (§5: "so data-plane traffic never blocks
//! control-plane"). [`LocalFlowGroup`] is the in-process stand-in used by
//! tests and by single-process multi-worker demos; a real deployment would
//! swap in a TCP-backed implementation behind the same trait.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{FluxError, Result};

/// Reduction operator for [`FlowGroup::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    fn apply(self, a: u64, b: u64) -> u64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }

    fn identity(self) -> u64 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Max => u64::MIN,
            ReduceOp::Min => u64::MAX,
        }
    }
}

/// Reliable, ordered, per-peer byte channels among the hosts of a job, plus
/// the small set of collectives the flow-control path needs. Implementors
/// must be reliable: any dropped connection or short read is reported as
/// [`FluxError::Transport`] and is fatal to the process (§7), never
/// silently retried above this layer.
pub trait FlowGroup: Send + Sync {
    /// This host's rank within the group.
    fn rank(&self) -> u32;

    /// Total number of peers in the group (including self).
    fn num_peers(&self) -> u32;

    /// Send a message to a specific peer. Point-to-point sends from one
    /// rank to another preserve order (§5).
    fn send(&self, peer: u32, payload: Vec<u8>) -> Result<()>;

    /// Receive the next message sent by a specific peer, blocking until one
    /// arrives.
    fn recv(&self, peer: u32) -> Result<Vec<u8>>;

    /// Block until every peer has called `barrier`.
    fn barrier(&self) -> Result<()>;

    /// Combine one `u64` per peer with `op`; every peer gets the same
    /// aggregate result.
    fn all_reduce(&self, value: u64, op: ReduceOp) -> Result<u64>;

    /// Every peer gets `root`'s value.
    fn broadcast(&self, root: u32, value: u64) -> Result<u64>;

    /// Exclusive prefix sum of one `u64` per peer, in rank order: rank 0
    /// gets 0, rank `i` gets the sum of ranks `0..i`'s values.
    fn prefix_sum(&self, value: u64) -> Result<u64>;
}

struct CollectiveState {
    generation: u64,
    arrived: usize,
    values: Vec<u64>,
    result: Vec<u64>,
}

struct GroupShared {
    num_peers: usize,
    point_to_point: Vec<Vec<(crossbeam_channel::Sender<Vec<u8>>, crossbeam_channel::Receiver<Vec<u8>>)>>,
    collective: Mutex<CollectiveState>,
    cv: Condvar,
}

/// In-process [`FlowGroup`] simulating `n` hosts with one thread each,
/// sharing channels instead of sockets. Build a whole group at once with
/// [`LocalFlowGroup::new_group`]; each element is one peer's handle.
pub struct LocalFlowGroup {
    rank: u32,
    shared: Arc<GroupShared>,
}

impl LocalFlowGroup {
    /// Construct `num_peers` handles that can talk to each other.
    pub fn new_group(num_peers: usize) -> Vec<LocalFlowGroup> {
        assert!(num_peers > 0, "a flow group needs at least one peer");
        let mut point_to_point = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            let mut row = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                let (tx, rx) = crossbeam_channel::unbounded();
                row.push((tx, rx));
            }
            point_to_point.push(row);
        }
        let shared = Arc::new(GroupShared {
            num_peers,
            point_to_point,
            collective: Mutex::new(CollectiveState {
                generation: 0,
                arrived: 0,
                values: vec![0; num_peers],
                result: vec![0; num_peers],
            }),
            cv: Condvar::new(),
        });
        (0..num_peers)
            .map(|rank| LocalFlowGroup { rank: rank as u32, shared: shared.clone() })
            .collect()
    }

    fn collective_round(&self, value: u64, compute: impl FnOnce(&[u64]) -> Vec<u64>) -> u64 {
        let mut state = self.shared.collective.lock();
        let my_generation = state.generation;
        state.values[self.rank as usize] = value;
        state.arrived += 1;
        if state.arrived == self.shared.num_peers {
            state.result = compute(&state.values);
            state.arrived = 0;
            state.generation += 1;
            self.shared.cv.notify_all();
        } else {
            self.shared.cv.wait_while(&mut state, |s| s.generation == my_generation);
        }
        state.result[self.rank as usize]
    }
}

impl FlowGroup for LocalFlowGroup {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn num_peers(&self) -> u32 {
        self.shared.num_peers as u32
    }

    fn send(&self, peer: u32, payload: Vec<u8>) -> Result<()> {
        let (tx, _) = &self.shared.point_to_point[self.rank as usize][peer as usize];
        tx.send(payload).map_err(|_| FluxError::Transport {
            peer,
            detail: "receiver dropped".into(),
        })
    }

    fn recv(&self, peer: u32) -> Result<Vec<u8>> {
        let (_, rx) = &self.shared.point_to_point[peer as usize][self.rank as usize];
        rx.recv().map_err(|_| FluxError::Transport {
            peer,
            detail: "sender dropped before sending".into(),
        })
    }

    fn barrier(&self) -> Result<()> {
        self.collective_round(0, |vals| vec![0; vals.len()]);
        Ok(())
    }

    fn all_reduce(&self, value: u64, op: ReduceOp) -> Result<u64> {
        Ok(self.collective_round(value, move |vals| {
            let agg = vals.iter().fold(op.identity(), |acc, &v| op.apply(acc, v));
            vec![agg; vals.len()]
        }))
    }

    fn broadcast(&self, root: u32, value: u64) -> Result<u64> {
        Ok(self.collective_round(value, move |vals| vec![vals[root as usize]; vals.len()]))
    }

    fn prefix_sum(&self, value: u64) -> Result<u64> {
        Ok(self.collective_round(value, |vals| {
            let mut running = 0u64;
            let mut out = Vec::with_capacity(vals.len());
            for &v in vals {
                out.push(running);
                running += v;
            }
            out
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn barrier_releases_every_peer() {
        let peers = LocalFlowGroup::new_group(4);
        let handles: Vec<_> = peers
            .into_iter()
            .map(|p| thread::spawn(move || p.barrier().unwrap()))
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn all_reduce_sum_matches_every_peer() {
        let peers = LocalFlowGroup::new_group(3);
        let handles: Vec<_> = peers
            .into_iter()
            .enumerate()
            .map(|(i, p)| thread::spawn(move || p.all_reduce((i as u64) + 1, ReduceOp::Sum).unwrap()))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 6);
        }
    }

    #[test]
    fn prefix_sum_is_exclusive_and_ordered() {
        // Mirrors seed test S2's per-worker partial sums: 3, 7, 11 -> bases 0, 3, 10.
        let peers = LocalFlowGroup::new_group(3);
        let inputs = [3u64, 7, 11];
        let handles: Vec<_> = peers
            .into_iter()
            .enumerate()
            .map(|(i, p)| thread::spawn(move || p.prefix_sum(inputs[i]).unwrap()))
            .collect();
        let bases: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(bases, vec![0, 3, 10]);
    }

    #[test]
    fn point_to_point_send_recv_round_trip() {
        let peers = LocalFlowGroup::new_group(2);
        let mut iter = peers.into_iter();
        let p0 = iter.next().unwrap();
        let p1 = iter.next().unwrap();
        let h = thread::spawn(move || p1.recv(0).unwrap());
        p0.send(1, b"hello".to_vec()).unwrap();
        assert_eq!(h.join().unwrap(), b"hello");
    }

    #[test]
    fn broadcast_delivers_roots_value() {
        let peers = LocalFlowGroup::new_group(3);
        let handles: Vec<_> = peers
            .into_iter()
            .enumerate()
            .map(|(i, p)| thread::spawn(move || p.broadcast(1, (i as u64) * 100).unwrap()))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 100);
        }
    }
}
