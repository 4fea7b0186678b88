//! Runtime configuration and message tags.
//!
//! Tags are carried per collective (inside [`CollectiveTags`]) rather than in
//! process-wide counters, so concurrent persistent requests built with
//! distinct tag bases never match each other's messages.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::locality_error::LocalityError;

/// Environment variable forcing a fixed number of processes per node.
pub const ENV_PPN: &str = "LOCALITY_COLL_PPN";
/// Environment variable overriding the base tag.
pub const ENV_TAG_BASE: &str = "LOCALITY_COLL_TAG_BASE";

/// Typed message tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    pub const fn base(self) -> u16 {
        self.0
    }
    /// Tag `n` slots after this one.
    pub const fn offset(self, n: u16) -> CommTag {
        CommTag(self.0.wrapping_add(n))
    }
}

/// One tag per message class of a collective.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveTags {
    /// Node-local plan metadata (counts, edge lists).
    pub meta_sizes: CommTag,
    pub meta_data: CommTag,
    /// Sparse identity handshake.
    pub identity: CommTag,
    /// Node-local sharing of resolved partners.
    pub resolved_sizes: CommTag,
    pub resolved_data: CommTag,
    /// The three data phases.
    pub aggregate: CommTag,
    pub exchange: CommTag,
    pub scatter: CommTag,
}

impl CollectiveTags {
    /// Number of consecutive tags a collective occupies.
    pub const SPAN: u16 = 8;

    pub const fn from_base(base: CommTag) -> Self {
        Self {
            meta_sizes: base,
            meta_data: base.offset(1),
            identity: base.offset(2),
            resolved_sizes: base.offset(3),
            resolved_data: base.offset(4),
            aggregate: base.offset(5),
            exchange: base.offset(6),
            scatter: base.offset(7),
        }
    }
}

/// How processes are grouped into nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeGrouping {
    /// Ask the transport which processes share memory.
    SharedMemory,
    /// Treat each consecutive block of `ppn` ranks as one node.
    FixedPpn(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalityConfig {
    pub tag_base: CommTag,
    pub grouping: NodeGrouping,
    /// Collectively verify uniform, SMP-ordered nodes when building a topology.
    pub verify_layout: bool,
}

impl Default for LocalityConfig {
    fn default() -> Self {
        Self {
            tag_base: CommTag::new(0x4C00),
            grouping: NodeGrouping::SharedMemory,
            verify_layout: true,
        }
    }
}

static ENV_CONFIG: Lazy<LocalityConfig> =
    Lazy::new(|| LocalityConfig::from_env().unwrap_or_default());

impl LocalityConfig {
    /// Defaults overridden by [`ENV_PPN`] and [`ENV_TAG_BASE`].
    pub fn from_env() -> Result<Self, LocalityError> {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var(ENV_PPN) {
            let ppn: usize = raw.trim().parse().map_err(|_| {
                LocalityError::InvalidArguments(format!("{ENV_PPN}={raw:?} is not a count"))
            })?;
            cfg.grouping = NodeGrouping::FixedPpn(ppn);
        }
        if let Ok(raw) = std::env::var(ENV_TAG_BASE) {
            let raw = raw.trim();
            let parsed = match raw.strip_prefix("0x") {
                Some(hex) => u16::from_str_radix(hex, 16),
                None => raw.parse(),
            };
            let tag = parsed.map_err(|_| {
                LocalityError::InvalidArguments(format!("{ENV_TAG_BASE}={raw:?} is not a u16"))
            })?;
            cfg.tag_base = CommTag::new(tag);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Process-wide configuration read once from the environment.
    pub fn global() -> &'static LocalityConfig {
        &ENV_CONFIG
    }

    pub fn with_grouping(mut self, grouping: NodeGrouping) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_tag_base(mut self, tag: CommTag) -> Self {
        self.tag_base = tag;
        self
    }

    pub fn tags(&self) -> CollectiveTags {
        CollectiveTags::from_base(self.tag_base)
    }

    pub fn validate(&self) -> Result<(), LocalityError> {
        if let NodeGrouping::FixedPpn(0) = self.grouping {
            return Err(LocalityError::InvalidArguments(
                "processes per node must be positive".into(),
            ));
        }
        if self.tag_base.as_u16() > u16::MAX - CollectiveTags::SPAN {
            return Err(LocalityError::InvalidArguments(format!(
                "tag base {:#x} leaves no room for {} tags",
                self.tag_base.as_u16(),
                CollectiveTags::SPAN
            )));
        }
        Ok(())
    }
}
