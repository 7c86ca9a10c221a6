//! Path attributes and the pure AS-path transforms.
//!
//! `Attr` is a plain value: the export filter clones and rewrites it per
//! ribout, and equal inputs produce equal outputs (attribute canonicalization
//! and storage belong to the route database, which is outside this crate).
//!
//! Unset `local_pref` and `med` are represented as 0, matching the wire-less
//! convention the rest of the control plane uses.

use smallvec::SmallVec;
use std::net::{IpAddr, Ipv4Addr};

pub type AsNumber = u32;

/// Default local preference assigned on iBGP export when unset.
pub const DEFAULT_LOCAL_PREF: u32 = 100;

/// Well-known communities.
pub mod community {
    pub const NO_EXPORT: u32 = 0xFFFF_FF01;
    pub const NO_ADVERTISE: u32 = 0xFFFF_FF02;
    pub const NO_EXPORT_SUBCONFED: u32 = 0xFFFF_FF03;
    pub const LLGR_STALE: u32 = 0xFFFF_0006;
    pub const NO_LLGR: u32 = 0xFFFF_0007;
}

/// True for ASes in the 16-bit or 32-bit private ranges.
#[must_use]
pub const fn is_private_as(asn: AsNumber) -> bool {
    (asn >= 64512 && asn <= 65535) || (asn >= 4_200_000_000 && asn <= 4_294_967_294)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    Igp,
    Egp,
    Incomplete,
}

/// A flat AS_SEQUENCE. Leftmost entry is the most recently added hop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsPath {
    segment: SmallVec<[AsNumber; 8]>,
}

impl AsPath {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_sequence<I: IntoIterator<Item = AsNumber>>(seq: I) -> Self {
        Self {
            segment: seq.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segment.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segment.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[AsNumber] {
        &self.segment
    }

    /// Add `asn` at the front (the newest hop).
    pub fn prepend(&mut self, asn: AsNumber) {
        self.segment.insert(0, asn);
    }

    #[must_use]
    pub fn contains(&self, asn: AsNumber) -> bool {
        self.segment.contains(&asn)
    }

    #[must_use]
    pub fn count_of(&self, asn: AsNumber) -> usize {
        self.segment.iter().filter(|a| **a == asn).count()
    }

    /// True if the path leads with `asn`.
    #[must_use]
    pub fn leftmost_is(&self, asn: AsNumber) -> bool {
        self.segment.first() == Some(&asn)
    }

    /// Replace every occurrence of `from` with `to` (as-override).
    pub fn replace_as(&mut self, from: AsNumber, to: AsNumber) {
        for hop in &mut self.segment {
            if *hop == from {
                *hop = to;
            }
        }
    }

    /// Remove or substitute private ASes.
    ///
    /// Without `all`, only the leading run of private ASes is touched.
    /// Without `replace`, matched ASes are deleted. With `replace`, each
    /// private AS is substituted by the nearest preceding public AS; a
    /// private AS with no public AS to its left takes the leftmost public
    /// AS in the path, or `local_as` if the path has none. An `avoid` AS
    /// (the peer's own AS, under peer-loop-check) is never used as a
    /// substitute so the rewrite cannot manufacture a loop.
    #[must_use]
    pub fn remove_private(
        &self,
        all: bool,
        replace: bool,
        local_as: AsNumber,
        avoid: Option<AsNumber>,
    ) -> Self {
        let usable = |asn: AsNumber| !is_private_as(asn) && Some(asn) != avoid;
        let leftmost_public = self
            .segment
            .iter()
            .copied()
            .find(|asn| usable(*asn))
            .unwrap_or(local_as);

        let mut out: SmallVec<[AsNumber; 8]> = SmallVec::new();
        let mut last_public: Option<AsNumber> = None;
        let mut leading = true;
        for &asn in &self.segment {
            if !is_private_as(asn) {
                if usable(asn) {
                    last_public = Some(asn);
                }
                leading = false;
                out.push(asn);
                continue;
            }
            if !all && !leading {
                out.push(asn);
                continue;
            }
            if replace {
                out.push(last_public.unwrap_or(leftmost_public));
            }
        }
        Self { segment: out }
    }
}

/// A path attribute set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub origin: Origin,
    pub next_hop: IpAddr,
    pub med: u32,
    pub local_pref: u32,
    pub as_path: Option<AsPath>,
    pub originator_id: Option<Ipv4Addr>,
    pub cluster_list: Vec<u32>,
    pub communities: Vec<u32>,
    pub ext_communities: Vec<u64>,
}

impl Default for Attr {
    fn default() -> Self {
        Self {
            origin: Origin::Igp,
            next_hop: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            med: 0,
            local_pref: 0,
            as_path: None,
            originator_id: None,
            cluster_list: Vec::new(),
            communities: Vec::new(),
            ext_communities: Vec::new(),
        }
    }
}

impl Attr {
    #[must_use]
    pub fn has_community(&self, value: u32) -> bool {
        self.communities.binary_search(&value).is_ok()
    }

    pub fn add_community(&mut self, value: u32) {
        if let Err(pos) = self.communities.binary_search(&value) {
            self.communities.insert(pos, value);
        }
    }

    /// Number of ASes in the path.
    #[must_use]
    pub fn as_path_len(&self) -> usize {
        self.as_path.as_ref().map_or(0, AsPath::len)
    }
}
