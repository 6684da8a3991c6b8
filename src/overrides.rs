// 🔀 Block-group overrides
// Named, data-driven geographic exceptions applied before allocation
//
// Example: parcels of a block group missing from the household survey are
// moved under a neighbouring block group whose households cover them.

use crate::geography::{BlockGroupId, GeographicHierarchy, ParcelId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockGroupOverride {
    /// Block group the parcels belong to
    pub from: BlockGroupId,

    /// Block group they are allocated under instead
    pub to: BlockGroupId,

    /// Move only parcels with a positive household target
    #[serde(default)]
    pub only_positive: bool,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub reason: String,
}

impl BlockGroupOverride {
    pub fn new(from: BlockGroupId, to: BlockGroupId) -> Self {
        BlockGroupOverride {
            from,
            to,
            only_positive: false,
            enabled: true,
            reason: String::new(),
        }
    }

    pub fn only_positive(mut self) -> Self {
        self.only_positive = true;
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = reason.to_string();
        self
    }

    fn matches(&self, block_group: BlockGroupId, target: i64) -> bool {
        self.enabled && block_group == self.from && (!self.only_positive || target > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideApplied {
    pub parcel_id: ParcelId,
    pub from: BlockGroupId,
    pub to: BlockGroupId,
}

/// Copy of `hierarchy` with every enabled rule applied, in order.
///
/// `targets` are per-parcel household targets; parcels without one count as 0.
pub fn apply_overrides(
    rules: &[BlockGroupOverride],
    hierarchy: &GeographicHierarchy,
    targets: &BTreeMap<ParcelId, i64>,
) -> (GeographicHierarchy, Vec<OverrideApplied>) {
    let mut out = hierarchy.clone();
    let mut applied = Vec::new();

    for rule in rules.iter().filter(|r| r.enabled) {
        let mut moved = 0usize;
        for (parcel_id, target) in targets {
            if let Some(geography) = out.get_mut(*parcel_id) {
                if rule.matches(geography.block_group_id, *target) {
                    geography.block_group_id = rule.to;
                    applied.push(OverrideApplied {
                        parcel_id: *parcel_id,
                        from: rule.from,
                        to: rule.to,
                    });
                    moved += 1;
                }
            }
        }
        info!(from = rule.from, to = rule.to, moved, reason = rule.reason.as_str(), "block-group override applied");
    }

    (out, applied)
}
