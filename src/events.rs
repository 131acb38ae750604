//! State-change records emitted by the simulation core.
//!
//! The trace is the core's only output surface: an external renderer turns it
//! into a provenance/data-lineage document. The core appends records in
//! simulated-time order and never formats or persists them itself.

use serde::Serialize;

use crate::core::scheduler::SimTime;
use crate::entities::Device;

/// Kind of a state-changing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    /// A lot, material lot or packing unit came into existence.
    ObjectCreation,
    /// A lot arrived at or departed from a resource.
    ObjectMove,
    /// A processing step turned material + lot into the processed lot.
    Transformation,
    /// Devices were folded into a parent entity (merge, packing).
    AggregationAdd,
    /// Devices were removed from a parent entity (split).
    AggregationDelete,
}

/// An entity reference with an attached quantity, used for the per-source
/// breakdown of transformation and aggregation events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityQuantity {
    pub entity: String,
    /// Derived product classification of the entity, where it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub amount: u32,
}

/// One record of the emitted trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Monotonically increasing record identifier, assigned on append.
    pub record_id: u64,
    pub kind: EventKind,
    pub timestamp: SimTime,
    /// Process step or lifecycle marker this record belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Primary entity the event is about.
    pub entity: String,
    /// Resource at which the event took place, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Contributing entities and their quantities.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<EntityQuantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<EntityQuantity>,
    /// Device snapshot before the state change took effect.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices_before: Vec<Device>,
    /// Device snapshot after the state change took effect.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices_after: Vec<Device>,
}

impl EventRecord {
    /// A bare record; callers fill in the relevant optional fields.
    pub fn at(kind: EventKind, timestamp: SimTime, entity: impl Into<String>) -> Self {
        Self {
            record_id: 0,
            kind,
            timestamp,
            step: None,
            entity: entity.into(),
            location: None,
            inputs: Vec::new(),
            output: None,
            devices_before: Vec::new(),
            devices_after: Vec::new(),
        }
    }
}

/// Append-only, time-ordered trace of the whole run.
#[derive(Default)]
pub struct EventLog {
    records: Vec<EventRecord>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, assigning its record id. Timestamps must be
    /// non-decreasing, which the single simulated clock guarantees.
    pub fn push(&mut self, mut record: EventRecord) {
        debug_assert!(
            self.records
                .last()
                .map_or(true, |last| last.timestamp <= record.timestamp),
            "trace out of time order"
        );
        record.record_id = self.records.len() as u64;
        self.records.push(record);
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<EventRecord> {
        self.records
    }
}
