//! PowerShell script-block logging.

use super::dispatch::{extract_into, EventRoute, FieldFailure};
use super::schema::{EventSchema, PropertyDef, PropertyType};
use super::{CollectorVector, SecurityEvent, SecurityEventKind};

pub const POWERSHELL_PROVIDER: &str = "Microsoft-Windows-PowerShell";

/// Script block logging
const SCRIPT_BLOCK_LOGGING: u16 = 4104;

const SCRIPT_BLOCK_PROPERTIES: &[PropertyDef] = &[
    PropertyDef::new("MessageNumber", PropertyType::U32),
    PropertyDef::new("MessageTotal", PropertyType::U32),
    PropertyDef::new("ScriptBlockText", PropertyType::Utf16String),
    PropertyDef::new("ScriptBlockId", PropertyType::Utf16String),
    PropertyDef::new("Path", PropertyType::Utf16String),
];

pub(super) fn routes() -> Vec<EventRoute> {
    vec![EventRoute {
        provider: POWERSHELL_PROVIDER,
        provider_event: SCRIPT_BLOCK_LOGGING,
        kind: SecurityEventKind::PowershellStartCommand,
        vector: CollectorVector::CustomUserEvent,
        requires: None,
        properties: SCRIPT_BLOCK_PROPERTIES,
        handler: script_block,
    }]
}

fn script_block(schema: &EventSchema<'_>, event: &mut SecurityEvent) -> Vec<FieldFailure> {
    let mut failures = Vec::new();

    if let Some(text) = extract_into::<String>(schema, "ScriptBlockText", &mut failures) {
        event.free_text = text;
    }
    // Long blocks arrive split across several records.
    if let Some(n) = extract_into::<u32>(schema, "MessageNumber", &mut failures) {
        event.set_meta("message_number", n);
    }
    if let Some(total) = extract_into::<u32>(schema, "MessageTotal", &mut failures) {
        event.set_meta("message_total", total);
    }
    if let Some(id) = extract_into::<String>(schema, "ScriptBlockId", &mut failures) {
        event.set_meta("script_block_id", id);
    }
    if let Some(path) = extract_into::<String>(schema, "Path", &mut failures) {
        if !path.is_empty() {
            event.set_meta("path", path);
        }
    }
    failures
}
