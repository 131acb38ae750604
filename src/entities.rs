//! Traceable entities moving through the simulation.
//!
//! The entity set is closed: production lots, material lots and packing
//! units, plus the devices they carry. Every entity is exclusively owned
//! (resident in exactly one pool or held by exactly one activity), so the
//! types here are plain owned values without interior sharing.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Executed-steps marker appended when devices were folded in from a sibling.
pub const MERGE_MARKER: &str = "merge";
/// Executed-steps marker appended when a lot was partitioned into sub-lots.
pub const SPLIT_MARKER: &str = "split";

/// A single device carried by a production lot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub identifier: String,
    /// Material unit identifiers consumed by this device, in consumption order.
    pub materials: Vec<String>,
    /// Quality scalar, starts at 1.0 and only ever adjusts downward.
    pub quality: f64,
}

impl Device {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            materials: Vec::new(),
            quality: 1.0,
        }
    }
}

/// Merge rule attached to a production lot, keyed by the step after which it
/// applies. An explicit identifier list designates its first entry as the
/// merge target; an empty list means "merge with any open lot sharing this
/// lot's derived product classification".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRule {
    pub after_step: String,
    #[serde(default)]
    pub lot_identifiers: Vec<String>,
}

impl MergeRule {
    pub fn is_model_based(&self) -> bool {
        self.lot_identifiers.is_empty()
    }
}

/// Split rule attached to a production lot, keyed by the step after which it
/// applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRule {
    pub after_step: String,
    pub number_of_sub_lots: usize,
}

/// A traceable group of devices flowing through the routing as one unit.
#[derive(Debug)]
pub struct ProductionLot {
    pub identifier: String,
    /// Steps still to be performed; the front is popped as each is scheduled.
    pub required_steps: VecDeque<String>,
    /// Step capability -> material type consumed at that step.
    pub required_material: BTreeMap<String, String>,
    pub merge_rules: Vec<MergeRule>,
    pub split_rules: Vec<SplitRule>,
    /// Append-only history of performed steps and lifecycle markers.
    pub executed_steps: Vec<String>,
    pub devices: Vec<Device>,
    /// Set once all devices have moved elsewhere (merged away, split away or
    /// packed). A closed lot is never routed again.
    pub closed: bool,
}

impl ProductionLot {
    pub fn new(
        identifier: impl Into<String>,
        required_steps: Vec<String>,
        required_material: BTreeMap<String, String>,
        merge_rules: Vec<MergeRule>,
        split_rules: Vec<SplitRule>,
        devices: Vec<Device>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            required_steps: required_steps.into(),
            required_material,
            merge_rules,
            split_rules,
            executed_steps: Vec::new(),
            devices,
            closed: false,
        }
    }

    pub fn merge_rule_after(&self, step: &str) -> Option<&MergeRule> {
        self.merge_rules.iter().find(|r| r.after_step == step)
    }

    pub fn split_rule_after(&self, step: &str) -> Option<&SplitRule> {
        self.split_rules.iter().find(|r| r.after_step == step)
    }

    /// Most recently executed step, or the empty string for a fresh lot.
    pub fn last_executed_step(&self) -> &str {
        self.executed_steps.last().map(String::as_str).unwrap_or("")
    }

    /// Derived product classification: the de-duplicated ordered sequence of
    /// executed process steps, lifecycle markers excluded, joined with `-`.
    pub fn model(&self) -> String {
        let mut seen: Vec<&str> = Vec::new();
        for step in &self.executed_steps {
            let step = step.as_str();
            if step == MERGE_MARKER || step == SPLIT_MARKER {
                continue;
            }
            if !seen.contains(&step) {
                seen.push(step);
            }
        }
        seen.join("-")
    }

    /// Clone of the current device list, for event snapshots.
    pub fn device_snapshot(&self) -> Vec<Device> {
        self.devices.clone()
    }
}

/// A lot of raw material units, consumed on demand by processing steps.
#[derive(Debug)]
pub struct MaterialLot {
    pub identifier: String,
    pub material_type: String,
    /// Remaining quantity; monotonically non-increasing, never negative.
    pub quantity: u32,
    /// Unit identifiers still available, popped as units are consumed.
    pub materials: Vec<String>,
    /// Set exactly when the quantity reaches zero.
    pub closed: bool,
}

impl MaterialLot {
    pub fn new(identifier: impl Into<String>, material_type: impl Into<String>, quantity: u32) -> Self {
        let identifier = identifier.into();
        let materials = (0..quantity)
            .map(|u| format!("{}_Unit{}", identifier, u))
            .collect();
        Self {
            identifier,
            material_type: material_type.into(),
            quantity,
            materials,
            closed: false,
        }
    }

    /// Derived product classification of a material lot is its material type.
    pub fn model(&self) -> String {
        self.material_type.clone()
    }

    /// Consume up to `demand` units; returns the consumed unit identifiers.
    /// The lot closes exactly when its quantity reaches zero.
    pub fn take_units(&mut self, demand: u32) -> Vec<String> {
        let take = demand.min(self.quantity);
        let mut units = Vec::with_capacity(take as usize);
        for _ in 0..take {
            if let Some(unit) = self.materials.pop() {
                units.push(unit);
            }
        }
        self.quantity -= take;
        if self.quantity == 0 {
            self.closed = true;
        }
        units
    }
}

/// Fixed-size group of finished devices; immutable once created.
#[derive(Debug)]
pub struct PackingUnit {
    pub identifier: String,
    pub devices: Vec<Device>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lot_with_steps(steps: &[&str]) -> ProductionLot {
        let mut lot = ProductionLot::new(
            "Lot1",
            vec![],
            BTreeMap::new(),
            vec![],
            vec![],
            vec![Device::new("Lot1_Device0")],
        );
        lot.executed_steps = steps.iter().map(|s| s.to_string()).collect();
        lot
    }

    #[test]
    fn model_skips_markers_and_duplicates() {
        let lot = lot_with_steps(&["Diffusion", "merge", "Diffusion", "Bonding", "split"]);
        assert_eq!(lot.model(), "Diffusion-Bonding");
    }

    #[test]
    fn model_of_fresh_lot_is_empty() {
        let lot = lot_with_steps(&[]);
        assert_eq!(lot.model(), "");
    }

    #[test]
    fn material_lot_closes_at_zero_quantity() {
        let mut lot = MaterialLot::new("Glue_0", "Glue", 3);
        assert_eq!(lot.take_units(2).len(), 2);
        assert!(!lot.closed);
        assert_eq!(lot.quantity, 1);

        // Demand beyond the remaining quantity consumes only what is left.
        let units = lot.take_units(5);
        assert_eq!(units.len(), 1);
        assert_eq!(lot.quantity, 0);
        assert!(lot.closed);
    }

    #[test]
    fn material_units_carry_the_lot_identifier() {
        let mut lot = MaterialLot::new("Glue_0", "Glue", 2);
        let units = lot.take_units(2);
        assert!(units.iter().all(|u| u.starts_with("Glue_0_Unit")));
    }

    #[test]
    fn rules_are_looked_up_by_after_step() {
        let mut lot = lot_with_steps(&["Diffusion"]);
        lot.merge_rules = vec![MergeRule {
            after_step: "Diffusion".to_string(),
            lot_identifiers: vec!["Lot1".to_string(), "Lot2".to_string()],
        }];
        lot.split_rules = vec![SplitRule {
            after_step: "Bonding".to_string(),
            number_of_sub_lots: 2,
        }];

        assert!(lot.merge_rule_after("Diffusion").is_some());
        assert!(lot.merge_rule_after("Bonding").is_none());
        assert!(lot.split_rule_after("Bonding").is_some());
        assert_eq!(lot.last_executed_step(), "Diffusion");
    }
}
