//! # membership
//!
//! Group membership and leader election on top of a linearizable key-value
//! store with leases and watches, such as etcd.
//!
//! This library provides:
//! - **Watcher**: a local mirror of every member registered under a key
//!   prefix, kept current by a background watch task, plus a bounded change
//!   feed.
//! - **Leader election**: the member with the smallest creation revision leads.
//! - **Registration**: lease-backed self-registration, named or in queue mode,
//!   with a supervised keepalive.
//! - **Substrates**: an etcd v3 adapter and an in-memory store with the same
//!   guarantees.
//!
//! ```no_run
//! # async fn run() -> membership::MembershipResult<()> {
//! use membership::{MembershipConfig, Registration};
//!
//! let config = MembershipConfig::new(vec!["http://127.0.0.1:2379".into()], "/svc/", 5)
//!     .with_name("1111")
//!     .with_value("1.2.3.4:1234");
//! let me = Registration::connect(&config).await?;
//! if me.am_i_leader() {
//!     // ...
//! }
//! me.close().await;
//! # Ok(())
//! # }
//! ```
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod config;
pub mod error;
mod lifecycle;
pub mod metrics;
pub mod models;
pub mod registration;
pub mod substrate;
pub mod watcher;

pub use cache::MemberCache;
pub use config::MembershipConfig;
pub use error::{MembershipError, MembershipResult};
pub use models::{Change, CloseReason, EventKind, LeaseId, Member};
pub use registration::Registration;
pub use substrate::{EtcdSubstrate, MemoryStore, MemorySubstrate, Substrate};
pub use watcher::Watcher;
