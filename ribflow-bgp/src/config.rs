//! Core configuration.
//!
//! One `CoreConfig` is shared by the update sender, the membership manager
//! and every `RibOut`; it is immutable after startup.

use ribflow_core::error::{Result, RibflowError};

use crate::attr::AsNumber;

/// Control-plane configuration.
///
/// # Examples
///
/// ```
/// use ribflow_bgp::config::CoreConfig;
///
/// let config = CoreConfig::default()
///     .with_autonomous_system(64512)
///     .with_partition_count(8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// The autonomous system this control plane speaks for.
    pub autonomous_system: AsNumber,

    /// Locally configured AS override for external sessions.
    ///
    /// 0 means "same as `autonomous_system`". When set, this is the AS
    /// prepended on eBGP export.
    pub local_autonomous_system: AsNumber,

    /// Number of table partitions; the update sender runs one independent
    /// worker per partition.
    pub partition_count: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            autonomous_system: 64512,
            local_autonomous_system: 0,
            partition_count: 16,
        }
    }
}

impl CoreConfig {
    #[must_use]
    pub fn with_autonomous_system(mut self, asn: AsNumber) -> Self {
        self.autonomous_system = asn;
        self
    }

    #[must_use]
    pub fn with_local_autonomous_system(mut self, asn: AsNumber) -> Self {
        self.local_autonomous_system = asn;
        self
    }

    #[must_use]
    pub fn with_partition_count(mut self, count: usize) -> Self {
        self.partition_count = count;
        self
    }

    /// Effective local AS: the configured override, or the system AS.
    #[must_use]
    pub const fn local_as(&self) -> AsNumber {
        if self.local_autonomous_system != 0 {
            self.local_autonomous_system
        } else {
            self.autonomous_system
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.autonomous_system == 0 {
            return Err(RibflowError::config("autonomous_system must be non-zero"));
        }
        if self.partition_count == 0 {
            return Err(RibflowError::config("partition_count must be at least 1"));
        }
        Ok(())
    }
}
