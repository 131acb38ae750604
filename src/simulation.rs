//! The simulation engine: owns the pools, the clock, and every activity, and
//! drives the single-threaded cooperative event loop.
//!
//! "Concurrent" activities are logically independent state machines
//! multiplexed onto one simulated timeline: the loop pops the earliest
//! pending suspension, advances the clock, and resumes the owning activity.
//! Activities exchange entities exclusively through the pools, never by
//! direct calls, so ownership transfer is atomic at pool `get`/`put`
//! granularity and no further synchronization exists anywhere.

use std::any::Any;
use std::collections::HashMap;

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{ConfigError, SimulationConfig};
use crate::controller::{Controller, ResourceHandle};
use crate::core::pools::{FifoPool, FilterPool, PriorityPool};
use crate::core::scheduler::{ActivityId, Scheduler, SimTime, TimerId};
use crate::entities::{Device, MaterialLot, PackingUnit, ProductionLot};
use crate::events::{EntityQuantity, EventKind, EventLog, EventRecord};
use crate::packing::PackingAggregator;
use crate::resource::{ResourceActivity, ResourceState};

/// What resumed a suspended activity.
#[derive(Debug)]
pub enum Wakeup {
    /// First resumption after the activity was registered.
    Start,
    /// A timed suspension elapsed; carries the timer's id so racing timers
    /// can be told apart.
    Timer(TimerId),
    /// A production lot handed over by a pool.
    Lot(ProductionLot),
    /// A material lot handed over by the material pool.
    Material(MaterialLot),
}

impl From<ProductionLot> for Wakeup {
    fn from(lot: ProductionLot) -> Self {
        Wakeup::Lot(lot)
    }
}

impl From<MaterialLot> for Wakeup {
    fn from(lot: MaterialLot) -> Self {
        Wakeup::Material(lot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    Running,
    Complete,
}

/// A logical, independently suspendable thread of control.
///
/// `resume` is called with whatever ended the activity's current suspension;
/// the activity performs its next stretch of work, issues its next
/// suspension (pool get, timer, or nothing when complete) and returns.
pub trait Activity {
    fn resume(&mut self, self_id: ActivityId, ctx: &mut SimContext, cause: Wakeup) -> ActivityStatus;

    /// Concrete-type access for post-run inspection.
    fn as_any(&self) -> &dyn Any;
}

/// Every pool entities travel through.
pub struct PoolSet {
    /// Controller's inbound pool of lots awaiting routing.
    pub lot_pool: FifoPool<ProductionLot>,
    /// Completed lots awaiting the packing aggregator.
    pub packing_pool: FifoPool<ProductionLot>,
    /// Partner lots parked for an explicitly targeted merge.
    pub merge_pool: FilterPool<ProductionLot>,
    /// Open lots parked for a model-based merge.
    pub merge_model_pool: FilterPool<ProductionLot>,
    /// Material lots, filtered by material type on consumption.
    pub material_pool: FilterPool<MaterialLot>,
    /// One work queue per production resource, indexed by resource handle.
    pub resource_queues: Vec<PriorityPool<ProductionLot>>,
}

impl PoolSet {
    fn with_queues(queues: usize) -> Self {
        Self {
            lot_pool: FifoPool::new(),
            packing_pool: FifoPool::new(),
            merge_pool: FilterPool::new(),
            merge_model_pool: FilterPool::new(),
            material_pool: FilterPool::new(),
            resource_queues: (0..queues).map(|_| PriorityPool::new()).collect(),
        }
    }
}

/// Shared state every activity works against while resumed.
pub struct SimContext {
    pub scheduler: Scheduler<Wakeup>,
    pub rng: StdRng,
    pub pools: PoolSet,
    pub log: EventLog,
    spawned: Vec<(String, Box<dyn Activity>)>,
}

impl SimContext {
    pub fn new(rng: StdRng, resource_queues: usize) -> Self {
        Self {
            scheduler: Scheduler::new(),
            rng,
            pools: PoolSet::with_queues(resource_queues),
            log: EventLog::new(),
            spawned: Vec::new(),
        }
    }

    /// Register a new activity; it receives its `Start` wakeup at the current
    /// simulated time, after all already-queued resumptions for this instant.
    pub fn spawn(&mut self, name: impl Into<String>, activity: Box<dyn Activity>) {
        self.spawned.push((name.into(), activity));
    }

    fn take_spawned(&mut self) -> Vec<(String, Box<dyn Activity>)> {
        std::mem::take(&mut self.spawned)
    }
}

/// A blocked waiter left over at the end of a run, usually pointing at a
/// configuration defect (a merge partner that never existed, material demand
/// exceeding supply).
#[derive(Debug, Clone)]
pub struct StallDiagnostic {
    pub activity: String,
    pub waiting_for: String,
}

/// The assembled simulation: activities, pools, clock and trace.
pub struct Simulation {
    ctx: SimContext,
    activities: HashMap<ActivityId, Box<dyn Activity>>,
    names: HashMap<ActivityId, String>,
    next_activity: u64,
    run_horizon: SimTime,
    resource_ids: Vec<ActivityId>,
    packer: ActivityId,
}

impl Simulation {
    /// Build a simulation from a validated configuration: seed the initial
    /// production and material lots, register one activity per resource, the
    /// packing aggregator and the controller.
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut ctx = SimContext::new(rng, config.production_resources.len());

        for spec in &config.production_lots {
            let devices = (0..spec.n_devices)
                .map(|d| Device::new(format!("{}_Device{}", spec.id, d)))
                .collect();
            let lot = ProductionLot::new(
                spec.id.clone(),
                spec.steps.clone(),
                spec.required_material.clone(),
                spec.merge.clone(),
                spec.split.clone(),
                devices,
            );
            let mut record = EventRecord::at(EventKind::ObjectCreation, 0.0, lot.identifier.clone());
            record.devices_after = lot.device_snapshot();
            ctx.log.push(record);
            ctx.pools.lot_pool.put(lot, &mut ctx.scheduler);
        }

        // One material unit per device per requiring step; generate enough
        // material lots to cover the total demand per type. The tally keeps
        // first-seen order so generation is reproducible.
        let mut demand: Vec<(String, u32)> = Vec::new();
        for spec in &config.production_lots {
            for material in spec.required_material.values() {
                match demand.iter_mut().find(|(m, _)| m == material) {
                    Some((_, total)) => *total += spec.n_devices,
                    None => demand.push((material.clone(), spec.n_devices)),
                }
            }
        }
        for (material, total) in demand {
            for index in 0..total.div_ceil(config.material_lot_size) {
                let lot = MaterialLot::new(
                    format!("{}_{}", material, index),
                    material.clone(),
                    config.material_lot_size,
                );
                let mut record =
                    EventRecord::at(EventKind::ObjectCreation, 0.0, lot.identifier.clone());
                record.output = Some(EntityQuantity {
                    entity: lot.identifier.clone(),
                    model: Some(lot.model()),
                    amount: lot.quantity,
                });
                ctx.log.push(record);
                ctx.pools.material_pool.put(lot, &mut ctx.scheduler);
            }
        }

        let mut simulation = Self {
            ctx,
            activities: HashMap::new(),
            names: HashMap::new(),
            next_activity: 0,
            run_horizon: config.run_horizon,
            resource_ids: Vec::new(),
            packer: ActivityId(0),
        };

        let mut by_step: HashMap<String, Vec<ResourceHandle>> = HashMap::new();
        for (index, spec) in config.production_resources.iter().enumerate() {
            let activity = ResourceActivity::new(spec, index)?;
            by_step.entry(spec.step.clone()).or_default().push(ResourceHandle {
                queue: index,
                identifier: spec.id.clone(),
            });
            let id = simulation.add_activity(spec.id.clone(), Box::new(activity));
            simulation.resource_ids.push(id);
        }

        simulation.packer = simulation.add_activity(
            "PackingResource",
            Box::new(PackingAggregator::new(config.packing_unit_size)),
        );
        simulation.add_activity("Controller", Box::new(Controller::new(by_step)));

        Ok(simulation)
    }

    fn add_activity(&mut self, name: impl Into<String>, activity: Box<dyn Activity>) -> ActivityId {
        let id = ActivityId(self.next_activity);
        self.next_activity += 1;
        self.names.insert(id, name.into());
        self.activities.insert(id, activity);
        self.ctx.scheduler.schedule_now(id, Wakeup::Start);
        id
    }

    fn name_of(&self, id: ActivityId) -> String {
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("activity {}", id.0))
    }

    /// Drive the event loop until the run horizon is reached or no
    /// suspensions remain. Returns the simulated end time.
    pub fn run(&mut self) -> SimTime {
        while let Some(next_time) = self.ctx.scheduler.next_time() {
            if next_time >= self.run_horizon {
                self.ctx.scheduler.advance_to(self.run_horizon);
                break;
            }
            let Some(suspension) = self.ctx.scheduler.pop() else {
                break;
            };
            self.ctx.scheduler.advance_to(suspension.time);

            let Some(mut activity) = self.activities.remove(&suspension.target) else {
                // A stale timer addressed to an already-completed activity.
                continue;
            };
            let status = activity.resume(suspension.target, &mut self.ctx, suspension.wake);
            match status {
                ActivityStatus::Running => {
                    self.activities.insert(suspension.target, activity);
                }
                ActivityStatus::Complete => {
                    debug!(
                        "[Simulation] [{:.3}] {} completed",
                        self.ctx.scheduler.now(),
                        self.name_of(suspension.target)
                    );
                }
            }

            for (name, spawned) in self.ctx.take_spawned() {
                self.add_activity(name, spawned);
            }
        }

        for stall in self.stalled() {
            warn!(
                "[Simulation] possible stall: {} is waiting for {}",
                stall.activity, stall.waiting_for
            );
        }
        self.ctx.scheduler.now()
    }

    /// Simulated time reached so far.
    pub fn now(&self) -> SimTime {
        self.ctx.scheduler.now()
    }

    /// The emitted trace, in (time, emission) order.
    pub fn events(&self) -> &[EventRecord] {
        self.ctx.log.records()
    }

    pub fn into_events(self) -> Vec<EventRecord> {
        self.ctx.log.into_records()
    }

    pub fn packing_units(&self) -> &[PackingUnit] {
        self.packer().map(|p| p.units()).unwrap_or(&[])
    }

    /// Devices carried over by the aggregator, short of a full unit.
    pub fn packing_remainder(&self) -> usize {
        self.packer().map(|p| p.remainder_len()).unwrap_or(0)
    }

    fn packer(&self) -> Option<&PackingAggregator> {
        self.activities
            .get(&self.packer)
            .and_then(|activity| activity.as_any().downcast_ref())
    }

    /// Current state of every production resource, in configuration order.
    pub fn resource_states(&self) -> Vec<(String, ResourceState)> {
        self.resource_ids
            .iter()
            .filter_map(|id| {
                self.activities
                    .get(id)
                    .and_then(|activity| activity.as_any().downcast_ref::<ResourceActivity>())
                    .map(|resource| (resource.identifier().to_string(), resource.state()))
            })
            .collect()
    }

    /// Blocked waiters and parked lots left over after the run: the stall
    /// diagnostic for configuration defects the core cannot recover from.
    pub fn stalled(&self) -> Vec<StallDiagnostic> {
        let mut report = Vec::new();
        for id in self.ctx.pools.merge_pool.waiting() {
            report.push(StallDiagnostic {
                activity: self.name_of(id),
                waiting_for: "a merge partner that never arrived".to_string(),
            });
        }
        for id in self.ctx.pools.material_pool.waiting() {
            report.push(StallDiagnostic {
                activity: self.name_of(id),
                waiting_for: "material that never became available".to_string(),
            });
        }
        for lot in self.ctx.pools.merge_model_pool.items() {
            report.push(StallDiagnostic {
                activity: format!("lot {}", lot.identifier),
                waiting_for: "an open lot with a matching product model".to_string(),
            });
        }
        report
    }
}
