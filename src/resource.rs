//! Production resource activity: the processing/breakdown/repair state
//! machine.
//!
//! A breakdown is not an error. It interrupts the processing timer, the
//! elapsed share of the drawn duration is kept, and after an unconditional
//! repair the race restarts with exactly the remaining duration; the
//! duration is never redrawn.

use log::{debug, info, warn};
use rand::Rng;
use rand_distr::{Distribution, Exp};

use crate::config::{ConfigError, ResourceSpec};
use crate::core::scheduler::{ActivityId, SimTime, TimerId};
use crate::entities::{MaterialLot, ProductionLot};
use crate::events::{EntityQuantity, EventKind, EventRecord};
use crate::simulation::{Activity, ActivityStatus, SimContext, Wakeup};

/// Factor applied to a device's quality when a processing draw falls outside
/// the resource's process yield.
pub const DEVICE_QUALITY_FACTOR: f64 = 0.5;

/// Externally visible resource state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Idle,
    Processing,
    Broken,
}

enum Phase {
    /// Blocked on the work queue.
    AwaitingLot,
    /// Lot in transport to the station.
    Moving {
        lot: ProductionLot,
        done_in: SimTime,
        timer: TimerId,
    },
    /// Drawing material lots until every device is covered.
    GatheringMaterial {
        lot: ProductionLot,
        done_in: SimTime,
        remaining: usize,
        consumed: Vec<(MaterialLot, u32)>,
    },
    /// Processing timer racing the breakdown timer.
    Working {
        lot: ProductionLot,
        consumed: Vec<(MaterialLot, u32)>,
        done_in: SimTime,
        started_at: SimTime,
        process_timer: TimerId,
        breakdown_timer: TimerId,
    },
    /// Broken down; the interrupted work resumes after repair.
    UnderRepair {
        lot: ProductionLot,
        consumed: Vec<(MaterialLot, u32)>,
        remaining: SimTime,
        timer: TimerId,
    },
}

pub struct ResourceActivity {
    identifier: String,
    capability: String,
    /// Index of this resource's work queue in the shared pool set.
    queue: usize,
    move_dist: Exp<f64>,
    duration_dist: Exp<f64>,
    breakdown_dist: Exp<f64>,
    repair_dist: Exp<f64>,
    process_yield: f64,
    phase: Phase,
}

fn exp_from_mean(resource: &str, field: &'static str, mean: f64) -> Result<Exp<f64>, ConfigError> {
    Exp::new(1.0 / mean).map_err(|_| ConfigError::NonPositiveMean {
        resource: resource.to_string(),
        field,
        value: mean,
    })
}

impl ResourceActivity {
    pub fn new(spec: &ResourceSpec, queue: usize) -> Result<Self, ConfigError> {
        Ok(Self {
            identifier: spec.id.clone(),
            capability: spec.step.clone(),
            queue,
            move_dist: exp_from_mean(&spec.id, "mean_move", spec.mean_move)?,
            duration_dist: exp_from_mean(&spec.id, "mean_duration", spec.mean_duration)?,
            breakdown_dist: exp_from_mean(&spec.id, "mean_breakdown", spec.mean_breakdown)?,
            repair_dist: exp_from_mean(&spec.id, "mean_repair", spec.mean_repair)?,
            process_yield: spec.process_yield,
            phase: Phase::AwaitingLot,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn state(&self) -> ResourceState {
        match self.phase {
            Phase::AwaitingLot | Phase::Moving { .. } | Phase::GatheringMaterial { .. } => {
                ResourceState::Idle
            }
            Phase::Working { .. } => ResourceState::Processing,
            Phase::UnderRepair { .. } => ResourceState::Broken,
        }
    }

    fn request_lot(&mut self, self_id: ActivityId, ctx: &mut SimContext) {
        debug!(
            "[Resource:{}] [{:.3}] waiting for next lot",
            self.identifier,
            ctx.scheduler.now()
        );
        ctx.pools.resource_queues[self.queue].get(self_id, &mut ctx.scheduler);
        self.phase = Phase::AwaitingLot;
    }

    fn receive_lot(&mut self, self_id: ActivityId, ctx: &mut SimContext, lot: ProductionLot) {
        // Draw the full processing duration up front; a later breakdown only
        // ever consumes part of it.
        let done_in = self.duration_dist.sample(&mut ctx.rng);
        let move_delay = self.move_dist.sample(&mut ctx.rng);
        let timer = ctx.scheduler.schedule_timer(move_delay, self_id, Wakeup::Timer);
        debug!(
            "[Resource:{}] [{:.3}] {} in transport, arriving in {:.3}",
            self.identifier,
            ctx.scheduler.now(),
            lot.identifier,
            move_delay
        );
        self.phase = Phase::Moving {
            lot,
            done_in,
            timer,
        };
    }

    fn arrive(&mut self, self_id: ActivityId, ctx: &mut SimContext, lot: ProductionLot, done_in: SimTime) {
        let now = ctx.scheduler.now();
        let mut record = EventRecord::at(EventKind::ObjectMove, now, lot.identifier.clone());
        record.step = Some("arriving".to_string());
        record.location = Some(self.identifier.clone());
        record.output = Some(EntityQuantity {
            entity: lot.identifier.clone(),
            model: Some(lot.model()),
            amount: lot.devices.len() as u32,
        });
        record.devices_after = lot.device_snapshot();
        ctx.log.push(record);

        let demand = if lot.required_material.contains_key(&self.capability) {
            lot.devices.len()
        } else {
            0
        };
        if demand > 0 {
            self.request_material(self_id, ctx, &lot);
            self.phase = Phase::GatheringMaterial {
                lot,
                done_in,
                remaining: demand,
                consumed: Vec::new(),
            };
        } else {
            info!(
                "[Resource:{}] [{:.3}] start processing {}",
                self.identifier, now, lot.identifier
            );
            self.begin_race(self_id, ctx, lot, Vec::new(), done_in);
        }
    }

    fn request_material(&self, self_id: ActivityId, ctx: &mut SimContext, lot: &ProductionLot) {
        let material_type = lot.required_material[&self.capability].clone();
        ctx.pools.material_pool.get_match(
            self_id,
            move |mat: &MaterialLot| mat.material_type == material_type,
            &mut ctx.scheduler,
        );
    }

    fn consume_material(
        &mut self,
        self_id: ActivityId,
        ctx: &mut SimContext,
        mut lot: ProductionLot,
        done_in: SimTime,
        mut remaining: usize,
        mut consumed: Vec<(MaterialLot, u32)>,
        mut material: MaterialLot,
    ) {
        // Take at most the quantity still present in this material lot; each
        // consumed unit is bound to one device of the production lot.
        let take = (remaining as u32).min(material.quantity);
        for unit in material.take_units(take) {
            remaining -= 1;
            lot.devices[remaining].materials.push(unit);
        }
        debug!(
            "[Resource:{}] [{:.3}] consumed {} x {} from {} for {}",
            self.identifier,
            ctx.scheduler.now(),
            take,
            material.material_type,
            material.identifier,
            lot.identifier
        );
        consumed.push((material, take));

        if remaining > 0 {
            self.request_material(self_id, ctx, &lot);
            self.phase = Phase::GatheringMaterial {
                lot,
                done_in,
                remaining,
                consumed,
            };
        } else {
            info!(
                "[Resource:{}] [{:.3}] start processing {}",
                self.identifier,
                ctx.scheduler.now(),
                lot.identifier
            );
            self.begin_race(self_id, ctx, lot, consumed, done_in);
        }
    }

    /// Start (or restart, after a repair) the processing-vs-breakdown race.
    /// The processing timer is scheduled first, so a dead-heat resolves in
    /// favour of completed work.
    fn begin_race(
        &mut self,
        self_id: ActivityId,
        ctx: &mut SimContext,
        lot: ProductionLot,
        consumed: Vec<(MaterialLot, u32)>,
        duration: SimTime,
    ) {
        let started_at = ctx.scheduler.now();
        let process_timer = ctx.scheduler.schedule_timer(duration, self_id, Wakeup::Timer);
        let breakdown_delay = self.breakdown_dist.sample(&mut ctx.rng);
        let breakdown_timer = ctx
            .scheduler
            .schedule_timer(breakdown_delay, self_id, Wakeup::Timer);
        self.phase = Phase::Working {
            lot,
            consumed,
            done_in: duration,
            started_at,
            process_timer,
            breakdown_timer,
        };
    }

    fn finish_processing(
        &mut self,
        self_id: ActivityId,
        ctx: &mut SimContext,
        mut lot: ProductionLot,
        consumed: Vec<(MaterialLot, u32)>,
        breakdown_timer: TimerId,
    ) {
        ctx.scheduler.cancel(breakdown_timer);
        let now = ctx.scheduler.now();

        let devices_before = lot.device_snapshot();
        let model_before = lot.model();

        // Per-device quality degradation against the process yield.
        for device in &mut lot.devices {
            if !(ctx.rng.gen::<f64>() < self.process_yield) {
                device.quality *= DEVICE_QUALITY_FACTOR;
            }
        }
        lot.executed_steps.push(self.capability.clone());

        let mut departing = EventRecord::at(EventKind::ObjectMove, now, lot.identifier.clone());
        departing.step = Some("departing".to_string());
        departing.location = Some(self.identifier.clone());
        departing.output = Some(EntityQuantity {
            entity: lot.identifier.clone(),
            model: Some(lot.model()),
            amount: lot.devices.len() as u32,
        });
        departing.devices_after = lot.device_snapshot();
        ctx.log.push(departing);

        let mut transformation =
            EventRecord::at(EventKind::Transformation, now, lot.identifier.clone());
        transformation.step = Some(self.capability.clone());
        transformation.location = Some(self.identifier.clone());
        transformation.inputs = consumed
            .iter()
            .map(|(material, quantity)| EntityQuantity {
                entity: material.identifier.clone(),
                model: Some(material.model()),
                amount: *quantity,
            })
            .collect();
        transformation.inputs.push(EntityQuantity {
            entity: lot.identifier.clone(),
            model: Some(model_before),
            amount: devices_before.len() as u32,
        });
        transformation.output = Some(EntityQuantity {
            entity: lot.identifier.clone(),
            model: Some(lot.model()),
            amount: lot.devices.len() as u32,
        });
        transformation.devices_before = devices_before;
        transformation.devices_after = lot.device_snapshot();
        ctx.log.push(transformation);

        // Exhausted material lots are closed and not returned.
        for (material, _) in consumed {
            if !material.closed {
                ctx.pools.material_pool.put(material, &mut ctx.scheduler);
            }
        }

        info!(
            "[Resource:{}] [{:.3}] finished processing {}",
            self.identifier, now, lot.identifier
        );
        ctx.pools.lot_pool.put(lot, &mut ctx.scheduler);
        self.request_lot(self_id, ctx);
    }

    fn break_down(
        &mut self,
        self_id: ActivityId,
        ctx: &mut SimContext,
        lot: ProductionLot,
        consumed: Vec<(MaterialLot, u32)>,
        done_in: SimTime,
        started_at: SimTime,
    ) {
        let now = ctx.scheduler.now();
        let elapsed = now - started_at;
        let remaining = done_in - elapsed;
        warn!(
            "[Resource:{}] [{:.3}] breakdown while processing {} ({:.3} of {:.3} left)",
            self.identifier, now, lot.identifier, remaining, done_in
        );
        let repair_delay = self.repair_dist.sample(&mut ctx.rng);
        let timer = ctx.scheduler.schedule_timer(repair_delay, self_id, Wakeup::Timer);
        self.phase = Phase::UnderRepair {
            lot,
            consumed,
            remaining,
            timer,
        };
    }
}

impl Activity for ResourceActivity {
    fn resume(&mut self, self_id: ActivityId, ctx: &mut SimContext, cause: Wakeup) -> ActivityStatus {
        let phase = std::mem::replace(&mut self.phase, Phase::AwaitingLot);
        match (phase, cause) {
            (Phase::AwaitingLot, Wakeup::Start) => {
                self.request_lot(self_id, ctx);
            }
            (Phase::AwaitingLot, Wakeup::Lot(lot)) => {
                self.receive_lot(self_id, ctx, lot);
            }
            (Phase::Moving { lot, done_in, timer }, Wakeup::Timer(fired)) if fired == timer => {
                self.arrive(self_id, ctx, lot, done_in);
            }
            (
                Phase::GatheringMaterial {
                    lot,
                    done_in,
                    remaining,
                    consumed,
                },
                Wakeup::Material(material),
            ) => {
                self.consume_material(self_id, ctx, lot, done_in, remaining, consumed, material);
            }
            (
                Phase::Working {
                    lot,
                    consumed,
                    breakdown_timer,
                    process_timer,
                    ..
                },
                Wakeup::Timer(fired),
            ) if fired == process_timer => {
                self.finish_processing(self_id, ctx, lot, consumed, breakdown_timer);
            }
            (
                Phase::Working {
                    lot,
                    consumed,
                    done_in,
                    started_at,
                    breakdown_timer,
                    ..
                },
                Wakeup::Timer(fired),
            ) if fired == breakdown_timer => {
                self.break_down(self_id, ctx, lot, consumed, done_in, started_at);
            }
            (
                Phase::UnderRepair {
                    lot,
                    consumed,
                    remaining,
                    timer,
                },
                Wakeup::Timer(fired),
            ) if fired == timer => {
                info!(
                    "[Resource:{}] [{:.3}] repaired, resume processing {}",
                    self.identifier,
                    ctx.scheduler.now(),
                    lot.identifier
                );
                // Restart the race with the leftover duration, racing a
                // freshly drawn breakdown interval.
                self.begin_race(self_id, ctx, lot, consumed, remaining);
            }
            // A timer from a superseded race (the processing timer of an
            // interrupted run is left pending on purpose) resumes us with a
            // stale id; the current phase is restored untouched.
            (phase, _) => {
                self.phase = phase;
            }
        }
        ActivityStatus::Running
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ResourceSpec {
        ResourceSpec {
            id: "Res1".to_string(),
            step: "Diffusion".to_string(),
            mean_move: 1.0,
            mean_duration: 5.0,
            mean_breakdown: 50.0,
            mean_repair: 2.0,
            process_yield: 1.0,
        }
    }

    #[test]
    fn fresh_resource_is_idle() {
        let resource = ResourceActivity::new(&spec(), 0).unwrap();
        assert_eq!(resource.state(), ResourceState::Idle);
        assert_eq!(resource.capability(), "Diffusion");
    }

    #[test]
    fn non_positive_mean_fails_construction() {
        let mut bad = spec();
        bad.mean_repair = -1.0;
        assert!(matches!(
            ResourceActivity::new(&bad, 0),
            Err(ConfigError::NonPositiveMean {
                field: "mean_repair",
                ..
            })
        ));
    }
}
