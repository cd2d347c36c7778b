//! Kernel image-load and TCP connect events, each gated on its tracking
//! option.

use std::net::Ipv4Addr;

use super::dispatch::{extract_into, EventRoute, FieldFailure};
use super::schema::{EventSchema, PropertyDef, PropertyType};
use super::{CollectorVector, SecurityEvent, SecurityEventKind};
use crate::config::TrackingOption;

pub const KERNEL_PROCESS_PROVIDER: &str = "Microsoft-Windows-Kernel-Process";
pub const KERNEL_NETWORK_PROVIDER: &str = "Microsoft-Windows-Kernel-Network";

const IMAGE_LOAD: u16 = 5;
const TCP_CONNECT_V4: u16 = 12;

const IMAGE_LOAD_PROPERTIES: &[PropertyDef] = &[
    PropertyDef::new("ImageBase", PropertyType::Pointer),
    PropertyDef::new("ImageSize", PropertyType::Pointer),
    PropertyDef::new("ProcessID", PropertyType::U32),
    PropertyDef::new("ImageCheckSum", PropertyType::U32),
    PropertyDef::new("TimeDateStamp", PropertyType::U32),
    PropertyDef::new("DefaultBase", PropertyType::Pointer),
    PropertyDef::new("ImageName", PropertyType::Utf16String),
];

// Addresses and ports are in network byte order.
const TCP_CONNECT_PROPERTIES: &[PropertyDef] = &[
    PropertyDef::new("PID", PropertyType::U32),
    PropertyDef::new("size", PropertyType::U32),
    PropertyDef::new("daddr", PropertyType::U32),
    PropertyDef::new("saddr", PropertyType::U32),
    PropertyDef::new("dport", PropertyType::U16),
    PropertyDef::new("sport", PropertyType::U16),
];

pub(super) fn routes() -> Vec<EventRoute> {
    vec![
        EventRoute {
            provider: KERNEL_PROCESS_PROVIDER,
            provider_event: IMAGE_LOAD,
            kind: SecurityEventKind::ImageLoad,
            vector: CollectorVector::KernelEvent,
            requires: Some(TrackingOption::ImageLoad),
            properties: IMAGE_LOAD_PROPERTIES,
            handler: image_load,
        },
        EventRoute {
            provider: KERNEL_NETWORK_PROVIDER,
            provider_event: TCP_CONNECT_V4,
            kind: SecurityEventKind::NetworkConnect,
            vector: CollectorVector::KernelEvent,
            requires: Some(TrackingOption::Network),
            properties: TCP_CONNECT_PROPERTIES,
            handler: tcp_connect,
        },
    ]
}

fn image_load(schema: &EventSchema<'_>, event: &mut SecurityEvent) -> Vec<FieldFailure> {
    let mut failures = Vec::new();
    if let Some(pid) = extract_into::<u32>(schema, "ProcessID", &mut failures) {
        event.process_id = pid;
    }
    if let Some(name) = extract_into::<String>(schema, "ImageName", &mut failures) {
        event.free_text = name;
    }
    if let Some(base) = extract_into::<u64>(schema, "ImageBase", &mut failures) {
        event.set_meta("image_base", format!("{base:#x}"));
    }
    failures
}

fn tcp_connect(schema: &EventSchema<'_>, event: &mut SecurityEvent) -> Vec<FieldFailure> {
    let mut failures = Vec::new();
    if let Some(pid) = extract_into::<u32>(schema, "PID", &mut failures) {
        event.process_id = pid;
    }
    let addr = |raw: u32| Ipv4Addr::from(raw.to_le_bytes());
    let port = |raw: u16| u16::from_be_bytes(raw.to_le_bytes());

    let source = extract_into::<u32>(schema, "saddr", &mut failures).map(addr);
    let sport = extract_into::<u16>(schema, "sport", &mut failures).map(port);
    let dest = extract_into::<u32>(schema, "daddr", &mut failures).map(addr);
    let dport = extract_into::<u16>(schema, "dport", &mut failures).map(port);

    if let (Some(d), Some(dp)) = (dest, dport) {
        event.set_meta("remote", format!("{d}:{dp}"));
        event.free_text = match (source, sport) {
            (Some(s), Some(sp)) => format!("{s}:{sp} -> {d}:{dp}"),
            _ => format!("-> {d}:{dp}"),
        };
    }
    failures
}
