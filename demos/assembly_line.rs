//! Runnable demo: two device lots merged after diffusion, split after
//! bonding, with material consumption and breakdown-prone resources.
//!
//! The configuration is built in code (file loading belongs to an external
//! loader); the emitted trace is printed as JSON for downstream provenance
//! tooling. Set `RUST_LOG=debug` for a step-by-step account of the run.

use std::collections::BTreeMap;

use assembly_sim::config::{ProductionLotSpec, ResourceSpec, SimulationConfig};
use assembly_sim::entities::{MergeRule, SplitRule};
use assembly_sim::Simulation;

fn demo_config() -> SimulationConfig {
    let merge_after_diffusion = MergeRule {
        after_step: "Diffusion".to_string(),
        lot_identifiers: vec!["Lot1".to_string(), "Lot2".to_string()],
    };
    let glue_at_bonding: BTreeMap<String, String> =
        BTreeMap::from([("Bonding".to_string(), "Glue".to_string())]);

    SimulationConfig {
        production_lots: vec![
            ProductionLotSpec {
                id: "Lot1".to_string(),
                steps: vec![
                    "Diffusion".to_string(),
                    "Bonding".to_string(),
                    "Testing".to_string(),
                ],
                required_material: glue_at_bonding.clone(),
                merge: vec![merge_after_diffusion.clone()],
                split: vec![SplitRule {
                    after_step: "Bonding".to_string(),
                    number_of_sub_lots: 2,
                }],
                n_devices: 8,
            },
            ProductionLotSpec {
                id: "Lot2".to_string(),
                steps: vec!["Diffusion".to_string()],
                // Lot2's devices continue inside Lot1 after the merge; its
                // material requirement keeps the glue tally covering them.
                required_material: glue_at_bonding,
                merge: vec![merge_after_diffusion],
                split: vec![],
                n_devices: 8,
            },
        ],
        material_lot_size: 12,
        production_resources: vec![
            ResourceSpec {
                id: "Diffusion1".to_string(),
                step: "Diffusion".to_string(),
                mean_move: 1.0,
                mean_duration: 6.0,
                mean_breakdown: 40.0,
                mean_repair: 3.0,
                process_yield: 0.95,
            },
            ResourceSpec {
                id: "Diffusion2".to_string(),
                step: "Diffusion".to_string(),
                mean_move: 1.0,
                mean_duration: 6.0,
                mean_breakdown: 40.0,
                mean_repair: 3.0,
                process_yield: 0.95,
            },
            ResourceSpec {
                id: "Bonding1".to_string(),
                step: "Bonding".to_string(),
                mean_move: 1.5,
                mean_duration: 8.0,
                mean_breakdown: 30.0,
                mean_repair: 4.0,
                process_yield: 0.9,
            },
            ResourceSpec {
                id: "Testing1".to_string(),
                step: "Testing".to_string(),
                mean_move: 1.0,
                mean_duration: 4.0,
                mean_breakdown: 60.0,
                mean_repair: 2.0,
                process_yield: 1.0,
            },
        ],
        packing_unit_size: 5,
        random_seed: Some(42),
        run_horizon: 500.0,
    }
}

fn main() {
    env_logger::init();

    let mut simulation = match Simulation::new(demo_config()) {
        Ok(simulation) => simulation,
        Err(error) => {
            eprintln!("invalid configuration: {error}");
            std::process::exit(1);
        }
    };

    let end = simulation.run();
    eprintln!("simulation ended at t={end:.3}");
    for unit in simulation.packing_units() {
        eprintln!("  packed {} ({} devices)", unit.identifier, unit.devices.len());
    }
    eprintln!("  {} device(s) left unpacked", simulation.packing_remainder());
    for stall in simulation.stalled() {
        eprintln!("  stalled: {} waiting for {}", stall.activity, stall.waiting_for);
    }

    let trace = simulation.into_events();
    match serde_json::to_string_pretty(&trace) {
        Ok(json) => println!("{json}"),
        Err(error) => eprintln!("failed to serialize trace: {error}"),
    }
}
