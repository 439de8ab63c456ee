//! Membership metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.
//!
//! # Note
//! Metric registration failures are fatal (using `.unwrap()`): a duplicate
//! registration is a programming error that should surface at startup.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Count of watch events applied to the membership cache
    pub static ref MEMBERSHIP_EVENTS_APPLIED: IntCounter = register_int_counter!(
        "membership_events_applied",
        "count of watch events applied to the membership cache"
    ).unwrap();

    /// Count of change notifications dropped because the channel was full
    pub static ref MEMBERSHIP_CHANGES_DROPPED: IntCounter = register_int_counter!(
        "membership_changes_dropped",
        "count of change notifications dropped on a full channel"
    ).unwrap();

    /// Count of failed bootstrap range reads that were retried
    pub static ref MEMBERSHIP_BOOTSTRAP_RETRIES: IntCounter = register_int_counter!(
        "membership_bootstrap_retries",
        "count of bootstrap range reads retried after a failure"
    ).unwrap();

    /// Count of conditional creates that lost to an existing key
    pub static ref MEMBERSHIP_REGISTER_CONFLICTS: IntCounter = register_int_counter!(
        "membership_register_conflicts",
        "count of registration attempts that found the key already taken"
    ).unwrap();

    /// Count of successful self-registrations
    pub static ref MEMBERSHIP_REGISTRATIONS: IntCounter = register_int_counter!(
        "membership_registrations",
        "count of successful self-registrations"
    ).unwrap();

    /// Count of leader pointer changes observed by the cache
    pub static ref MEMBERSHIP_LEADER_CHANGES: IntCounter = register_int_counter!(
        "membership_leader_changes",
        "count of leader changes observed by the membership cache"
    ).unwrap();

    /// Count of registrations lost because the lease keepalive ended
    pub static ref MEMBERSHIP_LEASES_LOST: IntCounter = register_int_counter!(
        "membership_leases_lost",
        "count of registrations lost to an ended lease keepalive"
    ).unwrap();

    /// Count of watch loops that ended for any reason other than close
    pub static ref MEMBERSHIP_WATCH_TERMINATIONS: IntCounter = register_int_counter!(
        "membership_watch_terminations",
        "count of watch loops terminated by the substrate"
    ).unwrap();

    /// Members in the most recently updated cache
    pub static ref MEMBERSHIP_MEMBERS: IntGauge = register_int_gauge!(
        "membership_members",
        "number of members in the most recently updated cache"
    ).unwrap();
}
