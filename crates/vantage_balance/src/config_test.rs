use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use crate::config::{ConfigError, FabricConfig};

#[test]
fn defaults_are_valid() {
    let config = FabricConfig::default();
    config.check().unwrap();
    assert_eq!(config.balancing.delta_t, Duration::from_secs(3));
    assert_eq!(config.balancing.overload_rechecks, 1);
    assert_eq!(config.meters.busy_window, Duration::from_secs(30));
    assert_eq!(config.meters.single_samples, 10);
    assert_eq!(config.gossip.gossip_t, Duration::from_secs(3));
    assert_eq!(config.gossip.peer_list_size, 5);
}

#[test]
fn parses_all_recognised_keys() {
    let text = "\
# balancing
BalancingDeltaT = 1000
OverloadRechecks = 3
BusyLoadWindowMilis = 10000
SingleLoadAverage = 4

GossipT = 500
PeerListSize = 7
MinBusyLoad = 50
MinSingleLoad = 5
LOAD_DONT_KNOW = 2147483647
";
    let config = FabricConfig::from_kv_str(text).unwrap();
    assert_eq!(config.balancing.delta_t, Duration::from_millis(1000));
    assert_eq!(config.balancing.overload_rechecks, 3);
    assert_eq!(config.meters.busy_window, Duration::from_millis(10000));
    assert_eq!(config.meters.single_samples, 4);
    assert_eq!(config.gossip.gossip_t, Duration::from_millis(500));
    assert_eq!(config.gossip.peer_list_size, 7);
    assert_eq!(config.balancing.min_busy_load, 50);
    assert_eq!(config.balancing.min_single_load, 5);
}

#[test]
fn unknown_key_is_rejected() {
    let err = FabricConfig::from_kv_str("NoSuchKey = 1").unwrap_err();
    assert_matches!(err, ConfigError::UnknownKey { line: 1, key } if key == "NoSuchKey");
}

#[test]
fn malformed_line_is_rejected_with_its_number() {
    let err = FabricConfig::from_kv_str("BalancingDeltaT = 1000\njust words\n").unwrap_err();
    assert_matches!(err, ConfigError::Malformed { line: 2 });
}

#[test]
fn non_numeric_value_is_rejected() {
    let err = FabricConfig::from_kv_str("PeerListSize = many").unwrap_err();
    assert_matches!(err, ConfigError::InvalidValue { key, .. } if key == "PeerListSize");
}

#[test]
fn zero_tick_periods_are_invalid() {
    assert_matches!(
        FabricConfig::from_kv_str("BalancingDeltaT = 0"),
        Err(ConfigError::Invalid(_))
    );
    assert_matches!(FabricConfig::from_kv_str("GossipT = 0"), Err(ConfigError::Invalid(_)));
    assert_matches!(
        FabricConfig::from_kv_str("BusyLoadWindowMilis = 0"),
        Err(ConfigError::Invalid(_))
    );
}

#[test]
fn zero_peer_list_is_invalid() {
    assert_matches!(FabricConfig::from_kv_str("PeerListSize = 0"), Err(ConfigError::Invalid(_)));
}
