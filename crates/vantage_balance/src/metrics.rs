//! Metric names of the balancing fabric, registered once per host process.

use metrics::{describe_counter, describe_gauge, Unit};

/// Balancing-tick verdicts, labelled by `kind` (`balanced`, `skipped`, or the
/// overload kind that fired).
pub(crate) const BALANCE_DECISIONS: &str = "vantage_balance_decisions_total";
/// Balancing actions attempted, labelled by `action`.
pub(crate) const BALANCE_ACTIONS_STARTED: &str = "vantage_balance_actions_started_total";
/// Balancing actions completed, labelled by `action`.
pub(crate) const BALANCE_ACTIONS_SUCCEEDED: &str = "vantage_balance_actions_succeeded_total";
/// Balancing actions failed, labelled by `action`.
pub(crate) const BALANCE_ACTIONS_FAILED: &str = "vantage_balance_actions_failed_total";
/// Inbound reservation requests refused.
pub(crate) const RESERVATIONS_REFUSED: &str = "vantage_balance_reservations_refused_total";
/// Current busy load of the host.
pub(crate) const HOST_BUSY_LOAD: &str = "vantage_balance_host_busy_load";
/// Current data load of the host.
pub(crate) const HOST_DATA_LOAD: &str = "vantage_balance_host_data_load";
/// Current push-sum conservation weight of the host.
pub(crate) const GOSSIP_WEIGHT: &str = "vantage_balance_gossip_weight";
/// Logical nodes currently hosted.
pub(crate) const HOSTED_NODES: &str = "vantage_balance_hosted_nodes";

pub(crate) const LABEL_KIND: &str = "kind";
pub(crate) const LABEL_ACTION: &str = "action";

pub(crate) fn register_metrics() {
    describe_counter!(BALANCE_DECISIONS, Unit::Count, "Balancing-tick verdicts by kind");
    describe_counter!(BALANCE_ACTIONS_STARTED, Unit::Count, "Balancing actions attempted");
    describe_counter!(BALANCE_ACTIONS_SUCCEEDED, Unit::Count, "Balancing actions completed");
    describe_counter!(BALANCE_ACTIONS_FAILED, Unit::Count, "Balancing actions failed");
    describe_counter!(RESERVATIONS_REFUSED, Unit::Count, "Inbound reservation requests refused");
    describe_gauge!(HOST_BUSY_LOAD, Unit::Count, "Current busy load of the host");
    describe_gauge!(HOST_DATA_LOAD, Unit::Count, "Current data load of the host");
    describe_gauge!(GOSSIP_WEIGHT, Unit::Count, "Push-sum conservation weight");
    describe_gauge!(HOSTED_NODES, Unit::Count, "Logical nodes currently hosted");
}
