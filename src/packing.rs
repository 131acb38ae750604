//! Packing aggregator: regroups the devices of completed lots into
//! fixed-size packing units.
//!
//! Devices that do not fill a whole unit stay in a carry-over remainder and
//! are packed together with devices from later lots, so units routinely mix
//! devices from several source lots.

use log::info;
use rand::seq::SliceRandom;

use crate::core::scheduler::ActivityId;
use crate::entities::{Device, PackingUnit, ProductionLot};
use crate::events::{EntityQuantity, EventKind, EventRecord};
use crate::simulation::{Activity, ActivityStatus, SimContext, Wakeup};

/// A device together with the lot it came from, as queued in the remainder.
struct SourcedDevice {
    lot: String,
    model: String,
    device: Device,
}

pub struct PackingAggregator {
    packing_size: usize,
    remainder: Vec<SourcedDevice>,
    units: Vec<PackingUnit>,
}

impl PackingAggregator {
    pub fn new(packing_size: usize) -> Self {
        Self {
            packing_size,
            remainder: Vec::new(),
            units: Vec::new(),
        }
    }

    pub fn units(&self) -> &[PackingUnit] {
        &self.units
    }

    /// Devices currently waiting for enough companions to fill a unit.
    pub fn remainder_len(&self) -> usize {
        self.remainder.len()
    }

    fn request_lot(&self, self_id: ActivityId, ctx: &mut SimContext) {
        ctx.pools.packing_pool.get(self_id, &mut ctx.scheduler);
    }

    /// Absorb a completed lot: shuffle its devices into the remainder, then
    /// peel off complete packing units from the front in arrival order.
    fn absorb(&mut self, ctx: &mut SimContext, mut lot: ProductionLot) {
        let now = ctx.scheduler.now();
        let model = lot.model();
        let mut devices = std::mem::take(&mut lot.devices);
        devices.shuffle(&mut ctx.rng);
        self.remainder.extend(devices.into_iter().map(|device| SourcedDevice {
            lot: lot.identifier.clone(),
            model: model.clone(),
            device,
        }));

        let mut unit_index = 0;
        while self.remainder.len() >= self.packing_size {
            let group: Vec<SourcedDevice> = self.remainder.drain(..self.packing_size).collect();
            let identifier = format!("{}_Pack{}", lot.identifier, unit_index);
            unit_index += 1;

            // Per-source contributed quantities, sources in first-contribution
            // order.
            let mut contributions: Vec<EntityQuantity> = Vec::new();
            for entry in &group {
                match contributions.iter_mut().find(|c| c.entity == entry.lot) {
                    Some(contribution) => contribution.amount += 1,
                    None => contributions.push(EntityQuantity {
                        entity: entry.lot.clone(),
                        model: Some(entry.model.clone()),
                        amount: 1,
                    }),
                }
            }
            let devices: Vec<Device> = group.into_iter().map(|entry| entry.device).collect();

            let mut created = EventRecord::at(EventKind::ObjectCreation, now, identifier.clone());
            created.devices_after = devices.clone();
            ctx.log.push(created);

            let mut packed = EventRecord::at(EventKind::AggregationAdd, now, identifier.clone());
            packed.step = Some("packing".to_string());
            packed.inputs = contributions;
            packed.devices_after = devices.clone();
            ctx.log.push(packed);

            info!(
                "[Packing] [{:.3}] created {} with {} devices ({} left over)",
                now,
                identifier,
                devices.len(),
                self.remainder.len()
            );
            self.units.push(PackingUnit { identifier, devices });
        }
    }
}

impl Activity for PackingAggregator {
    fn resume(&mut self, self_id: ActivityId, ctx: &mut SimContext, cause: Wakeup) -> ActivityStatus {
        match cause {
            Wakeup::Start => self.request_lot(self_id, ctx),
            Wakeup::Lot(lot) => {
                self.absorb(ctx, lot);
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
        let mut lot = ProductionLot::new(id, vec![], BTreeMap::new(), vec![], vec![], devices);
        lot.closed = true;
        lot
    }

    fn test_ctx() -> SimContext {
        SimContext::new(StdRng::seed_from_u64(7), 0)
    }

    #[test]
    fn complete_units_are_peeled_and_remainder_carries_over() {
        let mut ctx = test_ctx();
        let mut packer = PackingAggregator::new(4);

        packer.absorb(&mut ctx, lot_with_devices("Lot1", 6));
        assert_eq!(packer.units().len(), 1);
        assert_eq!(packer.remainder_len(), 2);

        packer.absorb(&mut ctx, lot_with_devices("Lot2", 6));
        assert_eq!(packer.units().len(), 3);
        assert_eq!(packer.remainder_len(), 0);

        for unit in packer.units() {
            assert_eq!(unit.devices.len(), 4);
        }
    }

    #[test]
    fn units_report_contributions_per_source_lot() {
        let mut ctx = test_ctx();
        let mut packer = PackingAggregator::new(4);

        packer.absorb(&mut ctx, lot_with_devices("Lot1", 2));
        assert!(packer.units().is_empty());
        packer.absorb(&mut ctx, lot_with_devices("Lot2", 2));
        assert_eq!(packer.units().len(), 1);

        let packed = ctx
            .log
            .iter()
            .find(|r| r.kind == EventKind::AggregationAdd)
            .expect("aggregation event emitted");
        let total: u32 = packed.inputs.iter().map(|c| c.amount).sum();
        assert_eq!(total, 4);
        assert_eq!(packed.inputs.len(), 2);
        assert_eq!(packed.inputs[0].entity, "Lot1");
        assert_eq!(packed.inputs[1].entity, "Lot2");
    }

    #[test]
    fn unit_identifiers_derive_from_the_triggering_lot() {
        let mut ctx = test_ctx();
        let mut packer = PackingAggregator::new(2);

        packer.absorb(&mut ctx, lot_with_devices("Lot9", 4));
        let ids: Vec<&str> = packer.units().iter().map(|u| u.identifier.as_str()).collect();
        assert_eq!(ids, vec!["Lot9_Pack0", "Lot9_Pack1"]);
    }

    #[test]
    fn no_unit_is_emitted_below_packing_size() {
        let mut ctx = test_ctx();
        let mut packer = PackingAggregator::new(5);

        packer.absorb(&mut ctx, lot_with_devices("Lot1", 4));
        assert!(packer.units().is_empty());
        assert_eq!(packer.remainder_len(), 4);
        assert!(ctx.log.is_empty());
    }
}
