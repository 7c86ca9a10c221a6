//! Logical task names.
//!
//! Tasks of the same name never run concurrently; tasks of different names
//! may. The scheduler providing that exclusion is the embedder's (see the
//! crate docs); these constants are what the affinity checks in this crate
//! assert against.

/// Membership event processing and the table-walk bookkeeping.
pub const MEMBERSHIP: &str = "membership";

/// Per-partition update sender worker (one logical task per partition).
pub const SEND_UPDATE: &str = "send-update";

/// Send-ready notification fan-out.
pub const SEND_READY: &str = "send-ready";

/// Per-route walk callbacks, driven by the table infrastructure.
pub const TABLE_PARTITION: &str = "table-partition";

/// Walk-done callbacks, driven by the table infrastructure.
pub const TABLE_WALKER: &str = "table-walker";

/// Configuration and session state machines (membership API callers).
pub const CONTROL: &str = "control";

/// Read-only introspection.
pub const SHOW: &str = "show";
