//! Per-(ribout, partition) update queues.
//!
//! Each queue is an ordered sequence of update entries addressed by a
//! monotone sequence number. Peer positions are expressed with markers:
//!
//! - The **tail marker** (`tail_pos` + `tail_peers`) holds the cohort of
//!   up-to-date peers. Entries at or beyond `tail_pos` are their pending
//!   work.
//! - Peers that fell behind (blocked, or excluded from a tail dequeue) are
//!   parked in a marker at the sequence of the first entry they have not
//!   received. Markers at the same position share one cohort.
//!
//! An entry's `peers` bitset holds the targets that have not received it
//! yet; the entry is dropped once the set drains. Sending is delegated to a
//! callback so the queue stays independent of peer resolution.
//!
//! Two queues exist per partition: `QBULK` for join-time sync, `QUPDATE`
//! for route changes. `QUPDATE` drains first (descending priority order).

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

use ribflow_core::bitset::BitSet;

use crate::attr::Attr;
use crate::iface::UpdateMessage;

pub const QBULK: usize = 0;
pub const QUPDATE: usize = 1;
pub const QCOUNT: usize = 2;

/// Send one update to the ribout peer at `index`; false means blocked.
pub type SendFn<'a> = &'a mut dyn FnMut(usize, &UpdateMessage) -> bool;

#[derive(Debug)]
struct UpdateEntry {
    route_key: Bytes,
    attr: Arc<Attr>,
    /// Targets that have not received this entry yet.
    peers: BitSet,
}

impl UpdateEntry {
    fn message(&self) -> UpdateMessage {
        UpdateMessage {
            route_key: self.route_key.clone(),
            attr: self.attr.clone(),
        }
    }
}

#[derive(Debug)]
pub struct UpdateQueue {
    entries: BTreeMap<u64, UpdateEntry>,
    /// Parked cohorts by position (seq of the next entry they need).
    markers: BTreeMap<u64, BitSet>,
    tail_pos: u64,
    tail_peers: BitSet,
    next_seq: u64,
}

impl UpdateQueue {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            markers: BTreeMap::new(),
            tail_pos: 1,
            tail_peers: BitSet::new(),
            next_seq: 1,
        }
    }

    /// Append an entry. Returns true if the queue had no pending work for
    /// the tail cohort, i.e. the caller must raise `RibOutActive`.
    pub fn enqueue(&mut self, route_key: Bytes, attr: Arc<Attr>, peers: BitSet) -> bool {
        debug_assert!(peers.any());
        let was_idle = self.entries.range(self.tail_pos..).next().is_none();
        self.entries.insert(
            self.next_seq,
            UpdateEntry {
                route_key,
                attr,
                peers,
            },
        );
        self.next_seq += 1;
        was_idle
    }

    /// Position a newly joined peer at the tail marker.
    pub fn join(&mut self, peer_bit: usize) {
        self.tail_peers.set(peer_bit);
    }

    /// Remove a peer from every marker and every pending entry.
    pub fn leave(&mut self, peer_bit: usize) {
        self.tail_peers.reset(peer_bit);
        self.markers.retain(|_, cohort| {
            cohort.reset(peer_bit);
            cohort.any()
        });
        self.entries.retain(|_, entry| {
            entry.peers.reset(peer_bit);
            entry.peers.any()
        });
    }

    /// Clear `set` bits from pending entries for one route (leave-walk
    /// processing; bits are ribout peer indices).
    pub fn leave_route(&mut self, route_key: &Bytes, set: &BitSet) {
        self.entries.retain(|_, entry| {
            if entry.route_key == *route_key {
                entry.peers.subtract(set);
            }
            entry.peers.any()
        });
    }

    /// Drain toward the tail for the cohort `msync`.
    ///
    /// Tail peers outside `msync` are split off into a marker and reported
    /// in `munsync`. Peers whose send blocks are parked at the offending
    /// entry and reported in `blocked` (always a subset of `msync`).
    /// Returns true when the queue was drained to the tail; false when
    /// every cohort member blocked first.
    pub fn tail_dequeue(
        &mut self,
        msync: &BitSet,
        blocked: &mut BitSet,
        munsync: &mut BitSet,
        send: SendFn<'_>,
    ) -> bool {
        let mut unsync = self.tail_peers.clone();
        unsync.subtract(msync);
        if unsync.any() {
            self.tail_peers.subtract(&unsync);
            munsync.union_with(&unsync);
            self.park(self.tail_pos, unsync);
        }

        let mut cohort = self.tail_peers.clone();
        let seqs: Vec<u64> = self.entries.range(self.tail_pos..).map(|(s, _)| *s).collect();
        for seq in seqs {
            if cohort.none() {
                self.tail_pos = seq;
                return false;
            }
            let newly_blocked = self.send_entry(seq, &cohort, send);
            if newly_blocked.any() {
                blocked.union_with(&newly_blocked);
                cohort.subtract(&newly_blocked);
                self.tail_peers.subtract(&newly_blocked);
                self.park(seq, newly_blocked);
            }
        }
        self.tail_pos = self.next_seq;
        if cohort.none() && self.tail_peers.none() && msync.any() {
            // Every member blocked on the very last entry.
            return false;
        }
        true
    }

    /// Advance `peer_bit`'s marker toward the tail.
    ///
    /// The whole cohort parked with the peer moves along; members whose
    /// send blocks are split off into `blocked`. Returns true if a cohort
    /// merged with the tail marker.
    pub fn peer_dequeue(&mut self, peer_bit: usize, blocked: &mut BitSet, send: SendFn<'_>) -> bool {
        let Some(pos) = self
            .markers
            .iter()
            .find(|(_, cohort)| cohort.test(peer_bit))
            .map(|(pos, _)| *pos)
        else {
            // Already merged with the tail marker.
            return true;
        };
        let mut cohort = self.markers.remove(&pos).unwrap();

        let seqs: Vec<u64> = self
            .entries
            .range(pos..self.tail_pos)
            .map(|(s, _)| *s)
            .collect();
        let mut resume = pos;
        let mut lead_blocked = false;
        for seq in seqs {
            let newly_blocked = self.send_entry(seq, &cohort, send);
            resume = seq + 1;
            if newly_blocked.any() {
                blocked.union_with(&newly_blocked);
                cohort.subtract(&newly_blocked);
                lead_blocked = newly_blocked.test(peer_bit);
                if lead_blocked {
                    self.park(seq, newly_blocked);
                    break;
                }
                self.park(seq, newly_blocked);
            }
            if cohort.none() {
                break;
            }
        }

        if cohort.none() {
            return false;
        }
        if !lead_blocked || resume >= self.tail_pos {
            if resume >= self.tail_pos || self.entries.range(resume..self.tail_pos).next().is_none()
            {
                trace!("[QUEUE] cohort merged with tail marker");
                self.tail_peers.union_with(&cohort);
                return true;
            }
        }
        self.park(resume, cohort);
        false
    }

    /// Pending entries (tombstoned peers excluded by construction).
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.entries.range(self.tail_pos..).next().is_none()
    }

    /// True if `peer_bit` sits at the tail marker.
    #[must_use]
    pub fn peer_at_tail(&self, peer_bit: usize) -> bool {
        self.tail_peers.test(peer_bit)
    }

    /// Send entry `seq` to its pending targets within `cohort`; returns the
    /// subset that blocked.
    fn send_entry(&mut self, seq: u64, cohort: &BitSet, send: SendFn<'_>) -> BitSet {
        let entry = self.entries.get_mut(&seq).expect("entry for live seq");
        let mut targets = entry.peers.clone();
        targets.intersect_with(cohort);
        let message = entry.message();
        let mut newly_blocked = BitSet::new();
        for bit in targets.ones() {
            if send(bit, &message) {
                entry.peers.reset(bit);
            } else {
                newly_blocked.set(bit);
            }
        }
        if entry.peers.none() {
            self.entries.remove(&seq);
        }
        newly_blocked
    }

    fn park(&mut self, pos: u64, cohort: BitSet) {
        debug_assert!(cohort.any());
        self.markers
            .entry(pos)
            .and_modify(|existing| existing.union_with(&cohort))
            .or_insert(cohort);
    }
}

/// The queue pair for one `(ribout, partition)`.
#[derive(Debug)]
pub struct UpdateQueues {
    queues: [UpdateQueue; QCOUNT],
}

impl Default for UpdateQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateQueues {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: [UpdateQueue::new(), UpdateQueue::new()],
        }
    }

    #[must_use]
    pub fn queue(&self, queue_id: usize) -> &UpdateQueue {
        &self.queues[queue_id]
    }

    pub fn queue_mut(&mut self, queue_id: usize) -> &mut UpdateQueue {
        &mut self.queues[queue_id]
    }

    pub fn join(&mut self, peer_bit: usize) {
        for queue in &mut self.queues {
            queue.join(peer_bit);
        }
    }

    pub fn leave(&mut self, peer_bit: usize) {
        for queue in &mut self.queues {
            queue.leave(peer_bit);
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.queues.iter().map(UpdateQueue::size).sum()
    }
}
