//! Raw record to security event.

use super::dispatch::{DispatchTable, FieldFailure};
use super::schema::{RawRecord, SchemaRegistry};
use super::SecurityEvent;
use crate::config::EffectiveConfig;

/// An event built from a routed record, with the payload fields that could
/// not be read.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub event: SecurityEvent,
    pub failures: Vec<FieldFailure>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    table: DispatchTable,
    registry: SchemaRegistry,
}

impl Normalizer {
    pub fn new(table: DispatchTable) -> Self {
        let registry = table.schema_registry();
        Self { table, registry }
    }

    /// Routes enabled by the effective configuration.
    pub fn for_config(config: &EffectiveConfig) -> Self {
        Self::new(DispatchTable::for_config(config))
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    /// `None` for records with no route. Field failures never prevent the
    /// event from being built.
    pub fn normalize(&self, record: &RawRecord) -> Option<Normalized> {
        let schema = self.registry.parse(record);
        let route = self.table.route(schema.provider(), schema.event_id())?;
        let mut event = SecurityEvent::envelope(route.kind, route.vector, route.provider, &schema);
        let failures = (route.handler)(&schema, &mut event);
        Some(Normalized { event, failures })
    }
}
