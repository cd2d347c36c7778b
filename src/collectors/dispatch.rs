//! Dispatch table: (provider, event id) to the routine that fills a
//! security event from a parsed record.

use std::collections::HashMap;

use super::schema::{EventSchema, PropertyDef, SchemaRegistry};
use super::{CollectorVector, SecurityEvent, SecurityEventKind};
use crate::config::{EffectiveConfig, TrackingOption};
use crate::error::ExtractError;

/// A payload field that could not be extracted. The event is still emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    pub field: &'static str,
    pub error: ExtractError,
}

/// Fills the payload of an event whose envelope is already set. Returns the
/// fields it could not extract.
pub type RouteHandler = fn(&EventSchema<'_>, &mut SecurityEvent) -> Vec<FieldFailure>;

#[derive(Debug, Clone, Copy)]
pub struct EventRoute {
    pub provider: &'static str,
    pub provider_event: u16,
    pub kind: SecurityEventKind,
    pub vector: CollectorVector,
    /// Registered only when this tracking option is enabled.
    pub requires: Option<TrackingOption>,
    pub properties: &'static [PropertyDef],
    pub handler: RouteHandler,
}

/// Every route the agent knows, gated or not.
pub fn known_routes() -> Vec<EventRoute> {
    let mut routes = super::powershell::routes();
    routes.extend(super::kernel::routes());
    routes
}

#[derive(Debug, Default, Clone)]
pub struct DispatchTable {
    routes: HashMap<&'static str, HashMap<u16, EventRoute>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known routes whose tracking option is enabled in `config`.
    pub fn for_config(config: &EffectiveConfig) -> Self {
        let enabled = config.options.current;
        Self::from_routes(
            known_routes()
                .into_iter()
                .filter(|r| r.requires.map_or(true, |opt| enabled.contains(opt))),
        )
    }

    /// Every known route, ignoring tracking options.
    pub fn all() -> Self {
        Self::from_routes(known_routes())
    }

    pub fn from_routes(routes: impl IntoIterator<Item = EventRoute>) -> Self {
        let mut table = Self::new();
        for route in routes {
            table.insert(route);
        }
        table
    }

    pub fn insert(&mut self, route: EventRoute) {
        self.routes
            .entry(route.provider)
            .or_default()
            .insert(route.provider_event, route);
    }

    pub fn route(&self, provider: &str, event_id: u16) -> Option<&EventRoute> {
        self.routes.get(provider)?.get(&event_id)
    }

    /// Providers with at least one route; one subscription each.
    pub fn providers(&self) -> Vec<&'static str> {
        let mut providers: Vec<_> = self.routes.keys().copied().collect();
        providers.sort_unstable();
        providers
    }

    pub fn routes(&self) -> impl Iterator<Item = &EventRoute> {
        self.routes.values().flat_map(|by_id| by_id.values())
    }

    /// Schemas for every routed event.
    pub fn schema_registry(&self) -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        for route in self.routes() {
            registry.register(route.provider, route.provider_event, route.properties);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run one extraction, recording the failure instead of propagating it.
pub(crate) fn extract_into<T: super::FromProperty>(
    schema: &EventSchema<'_>,
    field: &'static str,
    failures: &mut Vec<FieldFailure>,
) -> Option<T> {
    match schema.try_extract::<T>(field) {
        Ok(v) => Some(v),
        Err(error) => {
            failures.push(FieldFailure { field, error });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptionFlags;
    use crate::collectors::{RawRecord, UserDataBuilder};
    use chrono::Utc;

    fn config_with(flags: OptionFlags) -> EffectiveConfig {
        let mut c = crate::config::PersistedRecord::default().to_effective();
        c.options.current = flags;
        c
    }

    #[test]
    fn gated_routes_follow_tracking_options() {
        let none = DispatchTable::for_config(&config_with(OptionFlags::default()));
        assert!(none.route(super::super::POWERSHELL_PROVIDER, 4104).is_some());
        assert!(none.routes().all(|r| r.requires.is_none()));

        let all = OptionFlags::default()
            .with(TrackingOption::ImageLoad, true)
            .with(TrackingOption::Network, true);
        let table = DispatchTable::for_config(&config_with(all));
        assert_eq!(table.len(), known_routes().len());
        assert!(table.routes().any(|r| r.requires == Some(TrackingOption::Network)));
    }

    #[test]
    fn unknown_pairs_have_no_route() {
        let table = DispatchTable::all();
        assert!(table.route(super::super::POWERSHELL_PROVIDER, 4103).is_none());
        assert!(table.route("Some-Other-Provider", 4104).is_none());
    }

    /// Every known route turns a well-formed record into an event of its
    /// kind without field failures.
    #[test]
    fn all_known_routes_produce_valid_events() {
        let table = DispatchTable::all();
        let registry = table.schema_registry();
        for route in table.routes() {
            let user_data = route
                .properties
                .iter()
                .fold(UserDataBuilder::new(), |b, p| sample_value(b, p))
                .build();
            let rec = RawRecord {
                provider: route.provider.to_string(),
                event_id: route.provider_event,
                opcode: 0,
                process_id: 100,
                thread_id: 0,
                timestamp: Utc::now(),
                user_data,
            };
            let schema = registry.parse(&rec);
            let mut ev = SecurityEvent::envelope(route.kind, route.vector, route.provider, &schema);
            let failures = (route.handler)(&schema, &mut ev);
            assert!(failures.is_empty(), "{}: {:?}", route.provider, failures);
            assert_eq!(ev.event_id, route.kind.id());
            assert!(!ev.free_text.is_empty(), "{} left free text empty", route.provider);
        }
    }

    fn sample_value(b: UserDataBuilder, p: &PropertyDef) -> UserDataBuilder {
        use crate::collectors::PropertyType::*;
        match p.ty {
            Utf16String => b.utf16("sample"),
            AnsiString => b.ansi("sample"),
            U8 => b.raw(&[1]),
            U16 => b.u16(443),
            U32 | I32 | Bool => b.u32(1),
            U64 | I64 | Pointer => b.u64(0x1000),
            Guid => b.raw(&[7u8; 16]),
        }
    }
}
