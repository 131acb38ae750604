pub mod config;
pub mod controller;
pub mod core;
pub mod entities;
pub mod events;
pub mod packing;
pub mod resource;
pub mod simulation;

// Re-export commonly used types
pub use crate::config::{ConfigError, SimulationConfig};
pub use crate::core::scheduler::{ActivityId, SimTime};
pub use crate::entities::{Device, MaterialLot, PackingUnit, ProductionLot};
pub use crate::events::{EventKind, EventRecord};
pub use crate::simulation::Simulation;
