//! Event capture: provider subscriptions, schema-driven parsing, and
//! normalization of raw provider records into security events.
//!
//! Flow: [`TraceSession`] delivers [`RawRecord`]s on its consumer thread to
//! each subscribed [`EventCollector`], which runs them through the
//! [`Normalizer`] and hands the result to an [`EventProcessor`].

mod collector;
mod dispatch;
mod kernel;
mod normalize;
mod powershell;
mod processor;
mod schema;
mod session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use collector::{CollectorStats, EventCollector, SubscriptionState};
pub use dispatch::{DispatchTable, EventRoute, FieldFailure, RouteHandler};
pub use normalize::{Normalized, Normalizer};
pub use processor::{ChannelProcessor, EventProcessor};
pub use schema::{
    EventSchema, FromProperty, PropertyDef, PropertyType, PropertyValue, RawRecord,
    SchemaRegistry, UserDataBuilder,
};
pub use session::{RecordFeeder, SubscriptionHandle, TraceSession};

pub use kernel::{KERNEL_NETWORK_PROVIDER, KERNEL_PROCESS_PROVIDER};
pub use powershell::POWERSHELL_PROVIDER;

/// Version stamped on every security event.
pub const CURRENT_EVENT_VERSION: u32 = 1;

/// Normalized security event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    PowershellStartCommand,
    ImageLoad,
    NetworkConnect,
}

impl SecurityEventKind {
    pub fn id(self) -> u32 {
        match self {
            SecurityEventKind::PowershellStartCommand => 1001,
            SecurityEventKind::ImageLoad => 1002,
            SecurityEventKind::NetworkConnect => 1003,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectorTech {
    #[serde(rename = "trace-provider")]
    TraceProvider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectorVector {
    #[serde(rename = "custom user event")]
    CustomUserEvent,
    #[serde(rename = "kernel event")]
    KernelEvent,
}

/// Normalized output record. Envelope fields are always populated; the
/// payload fields are best-effort and stay empty when extraction failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub version: u32,
    pub event_id: u32,
    pub kind: SecurityEventKind,
    pub collector_tech: CollectorTech,
    pub collector_vector: CollectorVector,
    pub timestamp: DateTime<Utc>,
    pub provider_pid: u32,
    pub provider_name: String,
    pub process_id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub free_text: String,
    /// Provider-specific fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SecurityEvent {
    /// Envelope for `kind` filled from the record header. The target process
    /// defaults to the provider process.
    pub fn envelope(
        kind: SecurityEventKind,
        vector: CollectorVector,
        provider_name: &str,
        schema: &EventSchema<'_>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: CURRENT_EVENT_VERSION,
            event_id: kind.id(),
            kind,
            collector_tech: CollectorTech::TraceProvider,
            collector_vector: vector,
            timestamp: schema.timestamp(),
            provider_pid: schema.process_id(),
            provider_name: provider_name.to_string(),
            process_id: schema.process_id(),
            free_text: String::new(),
            metadata: None,
        }
    }

    /// Add one provider-specific field.
    pub fn set_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        let map = self
            .metadata
            .get_or_insert_with(|| serde_json::Value::Object(Default::default()));
        if let serde_json::Value::Object(m) = map {
            m.insert(key.to_string(), value.into());
        }
    }
}
