use pretty_assertions::assert_eq;
use test_case::test_case;
use vantage_dispatch::{NetworkEndpoint, PeerRecord};

use crate::host_list::{Direction, HostList, PeerDirectory};

const OWN: NetworkEndpoint = NetworkEndpoint::v4(10, 0, 0, 1, 7000);

fn peer(n: u8) -> NetworkEndpoint {
    NetworkEndpoint::v4(10, 0, 0, n, 7000)
}

fn record(endpoint: NetworkEndpoint, busy: Option<u64>, timestamp: u64) -> PeerRecord {
    PeerRecord { endpoint, busy, single: busy, data: busy.unwrap_or(0), timestamp }
}

#[test]
fn least_loaded_orders_ascending_by_busy() {
    let mut list = HostList::new(Direction::LeastLoaded, 5, OWN);
    list.insert(record(peer(2), Some(30), 1));
    list.insert(record(peer(3), Some(10), 1));
    list.insert(record(peer(4), Some(20), 1));

    let busy: Vec<Option<u64>> = list.snapshot().iter().map(|e| e.busy).collect();
    assert_eq!(busy, vec![Some(10), Some(20), Some(30)]);
}

#[test]
fn most_loaded_orders_descending_by_busy() {
    let mut list = HostList::new(Direction::MostLoaded, 5, OWN);
    list.insert(record(peer(2), Some(30), 1));
    list.insert(record(peer(3), Some(10), 1));
    list.insert(record(peer(4), Some(20), 1));

    let busy: Vec<Option<u64>> = list.snapshot().iter().map(|e| e.busy).collect();
    assert_eq!(busy, vec![Some(30), Some(20), Some(10)]);
}

#[test_case(Direction::LeastLoaded; "least_loaded")]
#[test_case(Direction::MostLoaded; "most_loaded")]
fn unknown_busy_sorts_last_in_both_directions(direction: Direction) {
    let mut list = HostList::new(direction, 5, OWN);
    list.insert(record(peer(2), None, 1));
    list.insert(record(peer(3), Some(10), 1));
    list.insert(record(peer(4), Some(20), 1));

    let last = list.snapshot().pop().unwrap();
    assert_eq!(last.endpoint, peer(2));
    assert_eq!(last.busy, None);
}

#[test]
fn size_cap_evicts_the_worst_entry() {
    let mut list = HostList::new(Direction::LeastLoaded, 3, OWN);
    for (n, busy) in [(2u8, 40u64), (3, 10), (4, 30), (5, 20)] {
        list.insert(record(peer(n), Some(busy), 1));
    }
    assert_eq!(list.len(), 3);
    let busy: Vec<Option<u64>> = list.snapshot().iter().map(|e| e.busy).collect();
    // 40 was the worst (largest) entry in an ascending list.
    assert_eq!(busy, vec![Some(10), Some(20), Some(30)]);
}

#[test]
fn own_entry_is_never_evicted_by_the_cap() {
    let mut list = HostList::new(Direction::LeastLoaded, 2, OWN);
    list.insert(record(OWN, Some(100), 1));
    list.insert(record(peer(2), Some(10), 1));
    list.insert(record(peer(3), Some(20), 1));

    // The own entry is the worst but survives; peer 3 is evicted instead.
    let endpoints: Vec<NetworkEndpoint> = list.snapshot().iter().map(|e| e.endpoint).collect();
    assert_eq!(endpoints, vec![peer(2), OWN]);
}

#[test]
fn stale_update_is_dropped_and_fresh_update_replaces() {
    let mut list = HostList::new(Direction::LeastLoaded, 5, OWN);
    list.insert(record(peer(2), Some(10), 5));

    // Older and same-age records for the same endpoint are ignored.
    list.insert(record(peer(2), Some(99), 4));
    list.insert(record(peer(2), Some(99), 5));
    assert_eq!(list.get(peer(2)).unwrap().busy, Some(10));

    list.insert(record(peer(2), Some(99), 6));
    assert_eq!(list.get(peer(2)).unwrap().busy, Some(99));
}

#[test]
fn merge_keeps_the_newer_entry_per_endpoint() {
    let mut list = HostList::new(Direction::LeastLoaded, 5, OWN);
    list.insert(record(peer(2), Some(10), 10));
    list.insert(record(peer(3), Some(20), 1));

    list.update_from(&[record(peer(2), Some(50), 2), record(peer(3), Some(5), 7)]);

    assert_eq!(list.get(peer(2)).unwrap().busy, Some(10));
    assert_eq!(list.get(peer(3)).unwrap().busy, Some(5));
}

#[test]
fn arbitrary_insert_sequences_stay_sorted_and_bounded() {
    let cap = 4;
    let mut list = HostList::new(Direction::LeastLoaded, cap, OWN);
    // A fixed pseudo-random schedule: endpoint, busy (None every 7th), ts.
    for i in 0u64..100 {
        let n = u8::try_from(2 + (i * 13 + 5) % 23).unwrap();
        let busy = if i % 7 == 0 { None } else { Some((i * 31) % 97) };
        list.insert(record(peer(n), busy, i));
    }
    assert!(list.len() <= cap);
    let entries = list.snapshot();
    for pair in entries.windows(2) {
        match (pair[0].busy, pair[1].busy) {
            (Some(a), Some(b)) => assert!(a <= b),
            (None, Some(_)) => panic!("unknown busy sorted before known"),
            _ => {}
        }
    }
}

#[test]
fn directory_merge_feeds_both_lists_and_clear_empties_them() {
    let mut directory = PeerDirectory::new(3, OWN);
    directory.refresh_own(record(OWN, Some(15), 1));
    let payload = vantage_dispatch::GossipPayload {
        single_sum: 0.0,
        busy_sum: 0.0,
        data_sum: 0.0,
        weight: 0.0,
        unloaded: vec![record(peer(2), Some(1), 1)],
        loaded: vec![record(peer(3), Some(99), 1)],
    };
    directory.merge_payload(&payload);

    // Both lists see both entries: a peer cheap for one list may be the
    // extreme of the other.
    assert_eq!(directory.unloaded.snapshot().first().unwrap().endpoint, peer(2));
    assert_eq!(directory.loaded.snapshot().first().unwrap().endpoint, peer(3));
    assert_eq!(directory.known_peers(OWN), vec![peer(2), peer(3)]);

    directory.clear();
    assert!(directory.unloaded.is_empty());
    assert!(directory.loaded.is_empty());
}
