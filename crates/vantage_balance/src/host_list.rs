//! Bounded ordered peer directories diffused through gossip.
//!
//! Each host keeps two lists of peer load snapshots: the least-loaded peers
//! (candidates for receiving work) and the most-loaded peers (candidates for
//! balancing offers). Entries are keyed by endpoint; merging keeps whichever
//! side carries the newer timestamp. Unknown busy load sorts last in both
//! lists.

#[cfg(test)]
#[path = "host_list_test.rs"]
mod host_list_test;

use std::cmp::{Ordering, Reverse};

use vantage_dispatch::{GossipPayload, NetworkEndpoint, PeerRecord};

/// Ordering of a [`HostList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Least-loaded first.
    LeastLoaded,
    /// Most-loaded first.
    MostLoaded,
}

type RestKey = (u64, u64, Reverse<u64>, NetworkEndpoint);

fn rest_key(record: &PeerRecord) -> RestKey {
    (
        record.single.unwrap_or(u64::MAX),
        record.data,
        Reverse(record.timestamp),
        record.endpoint,
    )
}

fn directed(direction: Direction, ordering: Ordering) -> Ordering {
    match direction {
        Direction::LeastLoaded => ordering,
        Direction::MostLoaded => ordering.reverse(),
    }
}

fn compare(direction: Direction, a: &PeerRecord, b: &PeerRecord) -> Ordering {
    match (a.busy, b.busy) {
        (None, None) => directed(direction, rest_key(a).cmp(&rest_key(b))),
        // Unknown busy load sorts last regardless of direction.
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => directed(direction, (x, rest_key(a)).cmp(&(y, rest_key(b)))),
    }
}

/// One bounded ordered set of peer load snapshots.
#[derive(Clone, Debug)]
pub struct HostList {
    direction: Direction,
    cap: usize,
    own: NetworkEndpoint,
    entries: Vec<PeerRecord>,
}

impl HostList {
    /// Creates an empty list holding at most `cap` entries. The entry for
    /// `own` is exempt from the size cap.
    pub fn new(direction: Direction, cap: usize, own: NetworkEndpoint) -> Self {
        assert!(cap > 0, "peer list needs room for at least one entry");
        Self { direction, cap, own, entries: Vec::new() }
    }

    /// Inserts or refreshes one record. A record older than (or as old as)
    /// the one already held for its endpoint is dropped. If the list
    /// overflows, the worst entry other than the own one is evicted.
    pub fn insert(&mut self, record: PeerRecord) {
        if let Some(pos) = self.entries.iter().position(|e| e.endpoint == record.endpoint) {
            if self.entries[pos].timestamp >= record.timestamp {
                return;
            }
            self.entries.remove(pos);
        }
        self.entries.push(record);
        let direction = self.direction;
        self.entries.sort_by(|a, b| compare(direction, a, b));
        if self.entries.len() > self.cap {
            if let Some(pos) = self.entries.iter().rposition(|e| e.endpoint != self.own) {
                self.entries.remove(pos);
            }
        }
    }

    /// Merges all of `records`, keeping the newer entry per endpoint.
    pub fn update_from(&mut self, records: &[PeerRecord]) {
        for record in records {
            self.insert(*record);
        }
    }

    /// Entries in list order (best first).
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.entries.clone()
    }

    /// The record held for `endpoint`, if any.
    pub fn get(&self, endpoint: NetworkEndpoint) -> Option<&PeerRecord> {
        self.entries.iter().find(|e| e.endpoint == endpoint)
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The pair of directories a host maintains.
#[derive(Clone, Debug)]
pub struct PeerDirectory {
    /// Least-loaded peers, best candidates first.
    pub unloaded: HostList,
    /// Most-loaded peers, worst offenders first.
    pub loaded: HostList,
}

impl PeerDirectory {
    /// Creates both directories with the same cap.
    pub fn new(cap: usize, own: NetworkEndpoint) -> Self {
        Self {
            unloaded: HostList::new(Direction::LeastLoaded, cap, own),
            loaded: HostList::new(Direction::MostLoaded, cap, own),
        }
    }

    /// Refreshes the own entry in both lists.
    pub fn refresh_own(&mut self, record: PeerRecord) {
        self.unloaded.insert(record);
        self.loaded.insert(record);
    }

    /// Merges the peer lists carried by a gossip payload.
    pub fn merge_payload(&mut self, payload: &GossipPayload) {
        self.unloaded.update_from(&payload.unloaded);
        self.unloaded.update_from(&payload.loaded);
        self.loaded.update_from(&payload.loaded);
        self.loaded.update_from(&payload.unloaded);
    }

    /// Every endpoint known to either list, own entry excluded.
    pub fn known_peers(&self, own: NetworkEndpoint) -> Vec<NetworkEndpoint> {
        let mut peers: Vec<NetworkEndpoint> = self
            .unloaded
            .snapshot()
            .into_iter()
            .chain(self.loaded.snapshot())
            .map(|e| e.endpoint)
            .filter(|e| *e != own)
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Empties both directories.
    pub fn clear(&mut self) {
        self.unloaded.clear();
        self.loaded.clear();
    }
}
