//! Core-facing configuration record.
//!
//! Argument parsing and file loading are external concerns; the loader hands
//! the core an already-parsed [`SimulationConfig`]. Everything that would
//! make a run meaningless (a step no resource offers, a non-positive mean)
//! is rejected here, at startup, before any activity is created.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::{MergeRule, SplitRule};

fn default_yield() -> f64 {
    1.0
}

/// Seed description of one initial production lot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionLotSpec {
    pub id: String,
    /// Ordered required process steps.
    pub steps: Vec<String>,
    /// Step capability -> material type consumed at that step.
    #[serde(default)]
    pub required_material: BTreeMap<String, String>,
    #[serde(default)]
    pub merge: Vec<MergeRule>,
    #[serde(default)]
    pub split: Vec<SplitRule>,
    pub n_devices: u32,
}

/// Seed description of one production resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: String,
    /// The capability: the single process step this resource performs.
    pub step: String,
    pub mean_move: f64,
    pub mean_duration: f64,
    pub mean_breakdown: f64,
    pub mean_repair: f64,
    /// Probability that a processing step leaves a device's quality intact.
    #[serde(default = "default_yield")]
    pub process_yield: f64,
}

/// The complete configuration record handed over by the external loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub production_lots: Vec<ProductionLotSpec>,
    /// Quantity per generated material lot.
    pub material_lot_size: u32,
    pub production_resources: Vec<ResourceSpec>,
    /// Devices per packing unit.
    pub packing_unit_size: usize,
    /// Deterministic RNG seed; unseeded runs are non-reproducible.
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Simulated-time cutoff for the driving loop.
    pub run_horizon: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("lot '{lot}' requires step '{step}' but no resource offers it")]
    MissingCapability { lot: String, step: String },

    #[error("resource '{resource}': {field} must be positive (got {value})")]
    NonPositiveMean {
        resource: String,
        field: &'static str,
        value: f64,
    },

    #[error("resource '{resource}': process_yield must be within 0..=1 (got {value})")]
    InvalidYield { resource: String, value: f64 },

    #[error("lot '{lot}': merge and split both configured after step '{step}'")]
    MergeSplitConflict { lot: String, step: String },

    #[error("lot '{lot}': explicit merge after '{step}' lists fewer than two lots")]
    DegenerateMerge { lot: String, step: String },

    #[error("lot '{lot}': split after '{step}' must produce at least one sub-lot")]
    DegenerateSplit { lot: String, step: String },

    #[error("packing_unit_size must be positive")]
    ZeroPackingSize,

    #[error("material_lot_size must be positive")]
    ZeroMaterialLotSize,

    #[error("run_horizon must be positive (got {0})")]
    NonPositiveHorizon(f64),
}

impl SimulationConfig {
    /// Reject configurations the simulation could not run meaningfully.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packing_unit_size == 0 {
            return Err(ConfigError::ZeroPackingSize);
        }
        if self.material_lot_size == 0 {
            return Err(ConfigError::ZeroMaterialLotSize);
        }
        if self.run_horizon <= 0.0 {
            return Err(ConfigError::NonPositiveHorizon(self.run_horizon));
        }

        for resource in &self.production_resources {
            for (field, value) in [
                ("mean_move", resource.mean_move),
                ("mean_duration", resource.mean_duration),
                ("mean_breakdown", resource.mean_breakdown),
                ("mean_repair", resource.mean_repair),
            ] {
                if !(value > 0.0) {
                    return Err(ConfigError::NonPositiveMean {
                        resource: resource.id.clone(),
                        field,
                        value,
                    });
                }
            }
            if !(0.0..=1.0).contains(&resource.process_yield) {
                return Err(ConfigError::InvalidYield {
                    resource: resource.id.clone(),
                    value: resource.process_yield,
                });
            }
        }

        for lot in &self.production_lots {
            for step in &lot.steps {
                if !self.production_resources.iter().any(|r| &r.step == step) {
                    return Err(ConfigError::MissingCapability {
                        lot: lot.id.clone(),
                        step: step.clone(),
                    });
                }
            }
            for merge in &lot.merge {
                // Merge and split after the same step is a configuration
                // defect, not a runtime condition to resolve.
                if lot.split.iter().any(|s| s.after_step == merge.after_step) {
                    return Err(ConfigError::MergeSplitConflict {
                        lot: lot.id.clone(),
                        step: merge.after_step.clone(),
                    });
                }
                if !merge.is_model_based() && merge.lot_identifiers.len() < 2 {
                    return Err(ConfigError::DegenerateMerge {
                        lot: lot.id.clone(),
                        step: merge.after_step.clone(),
                    });
                }
            }
            for split in &lot.split {
                if split.number_of_sub_lots == 0 {
                    return Err(ConfigError::DegenerateSplit {
                        lot: lot.id.clone(),
                        step: split.after_step.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SimulationConfig {
        SimulationConfig {
            production_lots: vec![ProductionLotSpec {
                id: "Lot1".to_string(),
                steps: vec!["Diffusion".to_string()],
                required_material: BTreeMap::new(),
                merge: vec![],
                split: vec![],
                n_devices: 4,
            }],
            material_lot_size: 10,
            production_resources: vec![ResourceSpec {
                id: "Res1".to_string(),
                step: "Diffusion".to_string(),
                mean_move: 1.0,
                mean_duration: 5.0,
                mean_breakdown: 100.0,
                mean_repair: 2.0,
                process_yield: 1.0,
            }],
            packing_unit_size: 4,
            random_seed: Some(7),
            run_horizon: 100.0,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn step_without_capability_is_fatal() {
        let mut config = base_config();
        config.production_lots[0].steps.push("Bonding".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCapability { step, .. }) if step == "Bonding"
        ));
    }

    #[test]
    fn non_positive_mean_is_rejected() {
        let mut config = base_config();
        config.production_resources[0].mean_duration = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveMean {
                field: "mean_duration",
                ..
            })
        ));
    }

    #[test]
    fn merge_and_split_after_same_step_conflict() {
        let mut config = base_config();
        config.production_lots[0].merge = vec![MergeRule {
            after_step: "Diffusion".to_string(),
            lot_identifiers: vec![],
        }];
        config.production_lots[0].split = vec![SplitRule {
            after_step: "Diffusion".to_string(),
            number_of_sub_lots: 2,
        }];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MergeSplitConflict { .. })
        ));
    }

    #[test]
    fn explicit_merge_needs_two_identifiers() {
        let mut config = base_config();
        config.production_lots[0].merge = vec![MergeRule {
            after_step: "Diffusion".to_string(),
            lot_identifiers: vec!["Lot1".to_string()],
        }];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DegenerateMerge { .. })
        ));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{
            "production_lots": [
                {"id": "Lot1", "steps": ["Diffusion"], "n_devices": 2}
            ],
            "material_lot_size": 5,
            "production_resources": [
                {"id": "Res1", "step": "Diffusion", "mean_move": 1.0,
                 "mean_duration": 4.0, "mean_breakdown": 50.0, "mean_repair": 2.0}
            ],
            "packing_unit_size": 2,
            "run_horizon": 50.0
        }"#;
        let config: SimulationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.production_resources[0].process_yield, 1.0);
        assert!(config.random_seed.is_none());
        assert!(config.validate().is_ok());
    }
}
