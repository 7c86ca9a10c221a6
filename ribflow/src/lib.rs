//! # Ribflow
//!
//! The coordination core of a BGP+XMPP route-dissemination pipeline: the
//! machinery between "a route changed in table T" and "bytes queued on
//! peer P's socket".
//!
//! ## Architecture
//!
//! Ribflow is structured as a **control-plane kernel** with clean layering:
//!
//! - **`ribflow-core`**: indexed maps, bitsets, tombstone work queues,
//!   task-affinity scopes
//! - **`ribflow-bgp`**: membership manager, export filter, update queues,
//!   per-partition update sender
//! - **`ribflow`**: public API surface (this crate)
//!
//! Sessions, route storage and best-path selection stay outside the core
//! and plug in through the [`Peer`], [`Table`] and [`RouteEntry`] traits.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use ribflow::{CoreConfig, MembershipManager, UpdateSender};
//!
//! # fn example(peer: ribflow::PeerRef, table: ribflow::TableRef) -> ribflow::Result<()> {
//! let config = CoreConfig::default()
//!     .with_autonomous_system(64512)
//!     .with_partition_count(8);
//! let sender = UpdateSender::new(config)?;
//! let membership = MembershipManager::new(sender.clone());
//!
//! // Subscribe a peer to a table; the callback fires once the join walk
//! // has synced it.
//! let policy = ribflow::RibExportPolicy::new(
//!     ribflow::PeerType::Ebgp,
//!     ribflow::Encoding::Bgp,
//!     65001,
//! );
//! membership.register(&peer, &table, &policy, 0);
//! # Ok(())
//! # }
//! ```
//!
//! The core bundles no runtime: spawn `membership.run()`, one
//! `sender.run_partition(i)` per partition and `sender.run_send_ready()`
//! on your executor, or drive the `process_*` methods from your own
//! scheduler.

pub mod dev_tracing;

// Re-exports for user convenience.
pub use bytes;
pub use tracing;

pub use ribflow_bgp::attr::{self, AsNumber, AsPath, Attr};
pub use ribflow_bgp::config::CoreConfig;
pub use ribflow_bgp::export::UpdateInfo;
pub use ribflow_bgp::iface::{
    DoneWalkFn, EntryWalkFn, PathFlags, PathSource, Peer, PeerRef, RouteEntry, RoutePath,
    RouteRef, Table, TableRef, UpdateMessage, WalkRef,
};
pub use ribflow_bgp::introspect;
pub use ribflow_bgp::membership::{Action, MembershipManager, PeerRegistrationCallback};
pub use ribflow_bgp::policy::{Encoding, PeerType, RemovePrivatePolicy, RibExportPolicy};
pub use ribflow_bgp::ribout::{BgpExport, RibOut, RibOutMap, RibOutRef};
pub use ribflow_bgp::sender::{SenderPartition, UpdateSender};
pub use ribflow_bgp::tasks;
pub use ribflow_bgp::update_queue::{QBULK, QCOUNT, QUPDATE};
pub use ribflow_core::bitset::BitSet;
pub use ribflow_core::error::{Result, RibflowError};
pub use ribflow_core::index_map::IndexedMap;
pub use ribflow_core::task::{self, TaskScope};
