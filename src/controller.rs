//! Dispatch controller: routes every lot leaving a process step into
//! scheduling, merging, splitting or packing.
//!
//! The controller itself never blocks on anything but its inbound pool.
//! Merging blocks on partner lots, so each merge runs as its own spawned
//! activity; splitting has no suspension point and happens inline.

use std::collections::HashMap;

use log::{debug, info, warn};
use rand::seq::SliceRandom;

use crate::core::scheduler::ActivityId;
use crate::entities::{Device, ProductionLot, MERGE_MARKER, SPLIT_MARKER};
use crate::events::{EntityQuantity, EventKind, EventRecord};
use crate::simulation::{Activity, ActivityStatus, SimContext, Wakeup};

/// Priority tag used for every dispatched lot. The priority pool keeps the
/// tag explicit so urgent-lot scheduling can be layered on later.
pub const DISPATCH_PRIORITY: u32 = 1;

/// Stable handle of a production resource: its work-queue index and its
/// identifier (for logging).
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub queue: usize,
    pub identifier: String,
}

pub struct Controller {
    /// Capability -> resources offering it, in configuration order.
    resources_by_step: HashMap<String, Vec<ResourceHandle>>,
}

impl Controller {
    pub fn new(resources_by_step: HashMap<String, Vec<ResourceHandle>>) -> Self {
        Self { resources_by_step }
    }

    fn request_lot(&self, self_id: ActivityId, ctx: &mut SimContext) {
        ctx.pools.lot_pool.get(self_id, &mut ctx.scheduler);
    }

    fn route(&self, ctx: &mut SimContext, mut lot: ProductionLot) {
        debug_assert!(!lot.closed, "closed lot reintroduced to routing");
        let now = ctx.scheduler.now();
        let last = lot.last_executed_step().to_string();

        if let Some(rule) = lot.merge_rule_after(&last).cloned() {
            if rule.is_model_based() {
                self.model_merge(ctx, lot);
            } else if rule.lot_identifiers[0] == lot.identifier {
                let partners = rule.lot_identifiers[1..].to_vec();
                info!(
                    "[Controller] [{:.3}] {} starts merge, absorbing {:?}",
                    now, lot.identifier, partners
                );
                let name = format!("Merge:{}", lot.identifier);
                ctx.spawn(name, Box::new(MergeSequence::new(lot, partners)));
            } else {
                debug!(
                    "[Controller] [{:.3}] {} joins the merge pool",
                    now, lot.identifier
                );
                lot.closed = true;
                ctx.pools.merge_pool.put(lot, &mut ctx.scheduler);
            }
        } else if let Some(rule) = lot.split_rule_after(&last).cloned() {
            self.split_lot(ctx, lot, rule.number_of_sub_lots);
        } else if !lot.required_steps.is_empty() {
            self.dispatch(ctx, lot);
        } else {
            debug!(
                "[Controller] [{:.3}] {} has no steps left, off to packing",
                now, lot.identifier
            );
            lot.closed = true;
            ctx.pools.packing_pool.put(lot, &mut ctx.scheduler);
        }
    }

    /// Model-based merge: fold the earliest-arrived open lot with the same
    /// derived product classification into this one, or park this lot until
    /// such a partner shows up.
    fn model_merge(&self, ctx: &mut SimContext, mut lot: ProductionLot) {
        let model = lot.model();
        let source = ctx
            .pools
            .merge_model_pool
            .take_match(|candidate| candidate.model() == model);
        match source {
            Some(source) => {
                fold_into(ctx, &mut lot, source);
                ctx.pools.lot_pool.put(lot, &mut ctx.scheduler);
            }
            None => {
                debug!(
                    "[Controller] [{:.3}] {} awaits a partner with model '{}'",
                    ctx.scheduler.now(),
                    lot.identifier,
                    model
                );
                ctx.pools.merge_model_pool.put(lot, &mut ctx.scheduler);
            }
        }
    }

    /// Schedule the lot's next required step at the offering resource with
    /// the shortest work queue (first seen wins a tie).
    fn dispatch(&self, ctx: &mut SimContext, mut lot: ProductionLot) {
        let step = lot
            .required_steps
            .pop_front()
            .expect("dispatch called with remaining steps");
        let offers = self
            .resources_by_step
            .get(&step)
            .expect("capability validated at startup");

        let mut selected = &offers[0];
        let mut shortest = ctx.pools.resource_queues[selected.queue].len();
        for handle in &offers[1..] {
            let len = ctx.pools.resource_queues[handle.queue].len();
            if len < shortest {
                selected = handle;
                shortest = len;
            }
        }

        debug!(
            "[Controller] [{:.3}] {} scheduled for step {} at {} (queue length {})",
            ctx.scheduler.now(),
            lot.identifier,
            step,
            selected.identifier,
            shortest
        );
        ctx.pools.resource_queues[selected.queue].put(lot, DISPATCH_PRIORITY, &mut ctx.scheduler);
    }

    /// Partition the lot's devices into `n` shuffled, roughly-equal sub-lots.
    /// Empty partitions are dropped; the parent ends closed and empty.
    fn split_lot(&self, ctx: &mut SimContext, mut lot: ProductionLot, n: usize) {
        let now = ctx.scheduler.now();
        let mut devices = std::mem::take(&mut lot.devices);
        let devices_before: Vec<Device> = devices.clone();
        devices.shuffle(&mut ctx.rng);

        let mut partitions: Vec<Vec<Device>> = (0..n).map(|_| Vec::new()).collect();
        for (index, device) in devices.into_iter().enumerate() {
            partitions[index % n].push(device);
        }

        let mut sub_lots = Vec::new();
        for (index, partition) in partitions.into_iter().enumerate() {
            if partition.is_empty() {
                continue;
            }
            let mut sub_lot = ProductionLot::new(
                format!("{}_{}", lot.identifier, index),
                lot.required_steps.iter().cloned().collect(),
                lot.required_material.clone(),
                lot.merge_rules.clone(),
                lot.split_rules.clone(),
                partition,
            );
            sub_lot.executed_steps = lot.executed_steps.clone();
            sub_lot.executed_steps.push(SPLIT_MARKER.to_string());
            sub_lots.push(sub_lot);
        }

        if sub_lots.is_empty() {
            warn!(
                "[Controller] [{:.3}] split of {} produced no sub-lots; the lot closes without successor",
                now, lot.identifier
            );
        } else {
            info!(
                "[Controller] [{:.3}] split {} into {:?}",
                now,
                lot.identifier,
                sub_lots.iter().map(|s| &s.identifier).collect::<Vec<_>>()
            );
        }

        for sub_lot in &sub_lots {
            let mut record = EventRecord::at(EventKind::ObjectCreation, now, sub_lot.identifier.clone());
            record.devices_after = sub_lot.device_snapshot();
            ctx.log.push(record);
        }

        let mut record = EventRecord::at(EventKind::AggregationDelete, now, lot.identifier.clone());
        record.step = Some(SPLIT_MARKER.to_string());
        record.inputs = sub_lots
            .iter()
            .map(|sub_lot| EntityQuantity {
                entity: sub_lot.identifier.clone(),
                model: Some(sub_lot.model()),
                amount: sub_lot.devices.len() as u32,
            })
            .collect();
        record.devices_before = devices_before;
        ctx.log.push(record);

        lot.executed_steps.push(SPLIT_MARKER.to_string());
        lot.closed = true;
        for sub_lot in sub_lots {
            ctx.pools.lot_pool.put(sub_lot, &mut ctx.scheduler);
        }
    }
}

impl Activity for Controller {
    fn resume(&mut self, self_id: ActivityId, ctx: &mut SimContext, cause: Wakeup) -> ActivityStatus {
        match cause {
            Wakeup::Start => self.request_lot(self_id, ctx),
            Wakeup::Lot(lot) => {
                self.route(ctx, lot);
                self.request_lot(self_id, ctx);
            }
            _ => {}
        }
        ActivityStatus::Running
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Fold `source` into `target`: devices move over, the source empties and
/// closes, both lots record the merge in their executed steps.
pub(crate) fn fold_into(ctx: &mut SimContext, target: &mut ProductionLot, mut source: ProductionLot) {
    let now = ctx.scheduler.now();

    let mut record = EventRecord::at(EventKind::AggregationAdd, now, target.identifier.clone());
    record.step = Some(MERGE_MARKER.to_string());
    record.inputs = vec![
        EntityQuantity {
            entity: source.identifier.clone(),
            model: Some(source.model()),
            amount: source.devices.len() as u32,
        },
        EntityQuantity {
            entity: target.identifier.clone(),
            model: Some(target.model()),
            amount: target.devices.len() as u32,
        },
    ];
    record.devices_before = target.device_snapshot();
    target.devices.append(&mut source.devices);
    record.devices_after = target.device_snapshot();
    ctx.log.push(record);

    source.closed = true;
    source.executed_steps.push(MERGE_MARKER.to_string());
    target.executed_steps.push(MERGE_MARKER.to_string());
    info!(
        "[Controller] [{:.3}] merged {} into {}",
        now, source.identifier, target.identifier
    );
}

/// Spawned activity folding listed partner lots into the merge target, one
/// blocking wait per partner, then re-enqueueing the target for routing.
pub struct MergeSequence {
    target: Option<ProductionLot>,
    partners: Vec<String>,
    next_partner: usize,
}

impl MergeSequence {
    pub fn new(target: ProductionLot, partners: Vec<String>) -> Self {
        Self {
            target: Some(target),
            partners,
            next_partner: 0,
        }
    }

    fn await_next(&mut self, self_id: ActivityId, ctx: &mut SimContext) -> ActivityStatus {
        if let Some(partner_id) = self.partners.get(self.next_partner).cloned() {
            ctx.pools.merge_pool.get_match(
                self_id,
                move |lot: &ProductionLot| lot.identifier == partner_id,
                &mut ctx.scheduler,
            );
            ActivityStatus::Running
        } else {
            let target = self.target.take().expect("merge target still held");
            ctx.pools.lot_pool.put(target, &mut ctx.scheduler);
            ActivityStatus::Complete
        }
    }
}

impl Activity for MergeSequence {
    fn resume(&mut self, self_id: ActivityId, ctx: &mut SimContext, cause: Wakeup) -> ActivityStatus {
        match cause {
            Wakeup::Start => self.await_next(self_id, ctx),
            Wakeup::Lot(partner) => {
                let target = self.target.as_mut().expect("merge target still held");
                fold_into(ctx, target, partner);
                self.next_partner += 1;
                self.await_next(self_id, ctx)
            }
            _ => ActivityStatus::Running,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn lot_with_devices(id: &str, count: usize) -> ProductionLot {
        let devices = (0..count)
            .map(|d| Device::new(format!("{id}_Device{d}")))
            .collect();
        ProductionLot::new(id, vec![], BTreeMap::new(), vec![], vec![], devices)
    }

    fn test_ctx() -> SimContext {
        SimContext::new(StdRng::seed_from_u64(42), 0)
    }

    #[test]
    fn split_conserves_devices_and_drops_empty_partitions() {
        let mut ctx = test_ctx();
        let controller = Controller::new(HashMap::new());
        let lot = lot_with_devices("Lot1", 5);

        // More partitions than devices: some partitions stay empty.
        controller.split_lot(&mut ctx, lot, 8);

        let mut seen: Vec<String> = Vec::new();
        let mut sub_lots = 0;
        while let Some(suspension) = ctx.scheduler.pop() {
            if let Wakeup::Lot(sub_lot) = suspension.wake {
                sub_lots += 1;
                assert!(!sub_lot.devices.is_empty());
                assert_eq!(sub_lot.last_executed_step(), SPLIT_MARKER);
                seen.extend(sub_lot.devices.iter().map(|d| d.identifier.clone()));
            }
        }
        assert_eq!(sub_lots, 5);
        seen.sort();
        let mut expected: Vec<String> =
            (0..5).map(|d| format!("Lot1_Device{d}")).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn split_partitions_are_roughly_equal() {
        let mut ctx = test_ctx();
        let controller = Controller::new(HashMap::new());
        let lot = lot_with_devices("Lot1", 10);

        controller.split_lot(&mut ctx, lot, 3);

        let mut sizes = Vec::new();
        while let Some(suspension) = ctx.scheduler.pop() {
            if let Wakeup::Lot(sub_lot) = suspension.wake {
                sizes.push(sub_lot.devices.len());
            }
        }
        sizes.sort();
        assert_eq!(sizes, vec![3, 3, 4]);
    }

    #[test]
    fn degenerate_split_closes_parent_without_successor() {
        let mut ctx = test_ctx();
        let controller = Controller::new(HashMap::new());
        let lot = lot_with_devices("Lot1", 0);

        controller.split_lot(&mut ctx, lot, 4);
        assert!(ctx.scheduler.pop().is_none());
        // Only the (empty-input) aggregation record is emitted.
        assert_eq!(ctx.log.len(), 1);
        assert_eq!(ctx.log.records()[0].kind, EventKind::AggregationDelete);
    }

    #[test]
    fn fold_moves_every_device_and_marks_both_lots() {
        let mut ctx = test_ctx();
        let mut target = lot_with_devices("Lot1", 3);
        let source = lot_with_devices("Lot2", 2);

        fold_into(&mut ctx, &mut target, source);

        assert_eq!(target.devices.len(), 5);
        assert_eq!(target.last_executed_step(), MERGE_MARKER);
        let record = &ctx.log.records()[0];
        assert_eq!(record.kind, EventKind::AggregationAdd);
        assert_eq!(record.devices_before.len(), 3);
        assert_eq!(record.devices_after.len(), 5);
    }
}
