//! # Ribflow BGP
//!
//! **Internal control-plane core crate for Ribflow.**
//!
//! ⚠️ **This is an internal implementation detail. Use the `ribflow` crate for the public API.**
//!
//! This crate implements the coordination layer between a routing table
//! and the peers it feeds: membership lifecycle, per-route export policy,
//! per-partition update queues and the blocked-peer backpressure machinery.
//! Session wire codecs, route storage and best-path selection live outside
//! and are consumed through the traits in [`iface`].
//!
//! ## Subsystems
//!
//! - **Membership manager** ([`membership`]): reconciles `(peer, table)`
//!   subscriptions with table walks and ribout registration
//! - **Update sender** ([`sender`]): per-partition schedulers draining
//!   update queues with send-ready backpressure
//! - **RibOut + export filter** ([`ribout`], [`export`]): per-policy peer
//!   groups and the best-path-to-update mapping
//! - **Update queues** ([`update_queue`]): tail-marker FIFOs tracking how
//!   far each peer has drained
//!
//! ## Task model
//!
//! The crate is runtime-agnostic. Every subsystem exposes synchronous
//! `process_*` drivers plus `async fn run*` loops to spawn on the
//! embedder's executor, one per logical task (see [`tasks`]); tasks of the
//! same name must never run concurrently. Debug builds verify the rule via
//! `ribflow_core::task` scopes.
//!
//! ```rust,ignore
//! let sender = UpdateSender::new(config)?;
//! let membership = MembershipManager::new(sender.clone());
//!
//! membership.register(&peer, &table, &policy, 0);
//! membership.process_pending();          // or spawn membership.run()
//! sender.process_partitions();           // or spawn sender.run_partition(i)
//! ```

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives
#![allow(clippy::option_if_let_else)] // Sometimes clearer as if/else

pub mod attr;
pub mod config;
pub mod export;
pub mod iface;
pub mod introspect;
pub mod membership;
pub mod policy;
pub mod ribout;
pub mod sender;
pub mod tasks;
pub mod update_queue;

pub use ribflow_core::bitset::BitSet;
pub use ribflow_core::error::{Result, RibflowError};

pub mod prelude {
    pub use crate::attr::{Attr, AsNumber, AsPath};
    pub use crate::config::CoreConfig;
    pub use crate::export::UpdateInfo;
    pub use crate::iface::{
        Peer, PeerRef, RouteEntry, RoutePath, RouteRef, Table, TableRef, UpdateMessage,
    };
    pub use crate::membership::MembershipManager;
    pub use crate::policy::{Encoding, PeerType, RibExportPolicy};
    pub use crate::ribout::{RibOut, RibOutMap, RibOutRef};
    pub use crate::sender::UpdateSender;
    pub use ribflow_core::prelude::*;
}
