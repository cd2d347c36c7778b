//! Schema-driven parsing of raw provider records.
//!
//! A provider publishes, per event id, the ordered list of properties packed
//! into a record's user data. Properties have in-band types; variable-length
//! strings are NUL-terminated, so locating a property means walking every
//! property before it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

use crate::error::ExtractError;

/// One record as delivered by a provider subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub provider: String,
    pub event_id: u16,
    #[serde(default)]
    pub opcode: u8,
    pub process_id: u32,
    #[serde(default)]
    pub thread_id: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        serialize_with = "user_data_to_base64",
        deserialize_with = "user_data_from_base64"
    )]
    pub user_data: Vec<u8>,
}

fn user_data_to_base64<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&BASE64.encode(data))
}

fn user_data_from_base64<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(d)?;
    BASE64.decode(encoded).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// NUL-terminated UTF-16LE.
    Utf16String,
    /// NUL-terminated single-byte string.
    AnsiString,
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    /// 4-byte boolean.
    Bool,
    Guid,
    /// Pointer-sized integer; records are assumed to come from 64-bit hosts.
    Pointer,
}

impl PropertyType {
    fn fixed_len(self) -> Option<usize> {
        match self {
            PropertyType::Utf16String | PropertyType::AnsiString => None,
            PropertyType::U8 => Some(1),
            PropertyType::U16 => Some(2),
            PropertyType::U32 | PropertyType::I32 | PropertyType::Bool => Some(4),
            PropertyType::U64 | PropertyType::I64 | PropertyType::Pointer => Some(8),
            PropertyType::Guid => Some(16),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDef {
    pub name: &'static str,
    pub ty: PropertyType,
}

impl PropertyDef {
    pub const fn new(name: &'static str, ty: PropertyType) -> Self {
        Self { name, ty }
    }
}

/// A decoded property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Str(String),
    Unsigned(u64),
    Signed(i64),
    Bool(bool),
    Guid([u8; 16]),
}

impl PropertyValue {
    fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Str(_) => "string",
            PropertyValue::Unsigned(_) => "unsigned integer",
            PropertyValue::Signed(_) => "signed integer",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Guid(_) => "guid",
        }
    }
}

/// Types a property can be extracted as.
pub trait FromProperty: Sized {
    const TYPE_NAME: &'static str;

    fn from_value(value: PropertyValue) -> Option<Self>;
}

impl FromProperty for String {
    const TYPE_NAME: &'static str = "string";

    fn from_value(value: PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl FromProperty for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_value(value: PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl FromProperty for [u8; 16] {
    const TYPE_NAME: &'static str = "guid";

    fn from_value(value: PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Guid(g) => Some(g),
            _ => None,
        }
    }
}

macro_rules! from_unsigned {
    ($($t:ty),*) => {$(
        impl FromProperty for $t {
            const TYPE_NAME: &'static str = stringify!($t);

            fn from_value(value: PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::Unsigned(v) => <$t>::try_from(v).ok(),
                    _ => None,
                }
            }
        }
    )*};
}

macro_rules! from_signed {
    ($($t:ty),*) => {$(
        impl FromProperty for $t {
            const TYPE_NAME: &'static str = stringify!($t);

            fn from_value(value: PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::Signed(v) => <$t>::try_from(v).ok(),
                    _ => None,
                }
            }
        }
    )*};
}

from_unsigned!(u8, u16, u32, u64);
from_signed!(i32, i64);

/// Published schemas, keyed by provider then provider event id.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    providers: HashMap<String, HashMap<u16, &'static [PropertyDef]>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: &str, event_id: u16, properties: &'static [PropertyDef]) {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .insert(event_id, properties);
    }

    pub fn lookup(&self, provider: &str, event_id: u16) -> Option<&'static [PropertyDef]> {
        self.providers.get(provider)?.get(&event_id).copied()
    }

    /// Bind a record to its schema. A record from an unpublished event still
    /// exposes its header; every property extraction on it fails.
    pub fn parse<'r>(&self, record: &'r RawRecord) -> EventSchema<'r> {
        EventSchema {
            record,
            properties: self.lookup(&record.provider, record.event_id),
        }
    }
}

/// A raw record viewed through its provider schema.
#[derive(Debug, Clone, Copy)]
pub struct EventSchema<'r> {
    record: &'r RawRecord,
    properties: Option<&'static [PropertyDef]>,
}

impl<'r> EventSchema<'r> {
    pub fn event_id(&self) -> u16 {
        self.record.event_id
    }

    pub fn process_id(&self) -> u32 {
        self.record.process_id
    }

    pub fn opcode(&self) -> u8 {
        self.record.opcode
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.record.timestamp
    }

    pub fn provider(&self) -> &'r str {
        &self.record.provider
    }

    pub fn has_schema(&self) -> bool {
        self.properties.is_some()
    }

    /// Extract one named property. Failure is local to the property.
    pub fn try_extract<T: FromProperty>(&self, name: &str) -> Result<T, ExtractError> {
        let value = self.value(name)?;
        let actual = value.type_name();
        T::from_value(value).ok_or_else(|| ExtractError::TypeMismatch {
            name: name.to_string(),
            actual,
            requested: T::TYPE_NAME,
        })
    }

    pub fn value(&self, name: &str) -> Result<PropertyValue, ExtractError> {
        let properties = self
            .properties
            .ok_or_else(|| ExtractError::UnknownProperty(name.to_string()))?;
        let data = self.record.user_data.as_slice();
        let mut offset = 0usize;

        for def in properties {
            let rest = data.get(offset..).unwrap_or_default();
            let len = match def.ty.fixed_len() {
                Some(len) => len,
                None => string_len(def.ty, rest).ok_or_else(|| truncated(name))?,
            };
            if def.name == name {
                let bytes = rest.get(..len).ok_or_else(|| truncated(name))?;
                return decode(def, bytes);
            }
            offset += len;
        }
        Err(ExtractError::UnknownProperty(name.to_string()))
    }
}

fn truncated(name: &str) -> ExtractError {
    ExtractError::Truncated {
        name: name.to_string(),
    }
}

/// Length of a NUL-terminated string including its terminator.
fn string_len(ty: PropertyType, bytes: &[u8]) -> Option<usize> {
    match ty {
        PropertyType::Utf16String => bytes
            .chunks_exact(2)
            .position(|c| c == [0, 0])
            .map(|units| (units + 1) * 2),
        _ => bytes.iter().position(|b| *b == 0).map(|n| n + 1),
    }
}

fn decode(def: &PropertyDef, bytes: &[u8]) -> Result<PropertyValue, ExtractError> {
    let le = |n: usize| -> u64 {
        bytes[..n]
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    };
    Ok(match def.ty {
        PropertyType::Utf16String => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .take_while(|u| *u != 0)
                .collect();
            PropertyValue::Str(String::from_utf16(&units).map_err(|_| {
                ExtractError::BadString {
                    name: def.name.to_string(),
                    encoding: "UTF-16",
                }
            })?)
        }
        PropertyType::AnsiString => {
            let text = &bytes[..bytes.len() - 1];
            PropertyValue::Str(
                std::str::from_utf8(text)
                    .map_err(|_| ExtractError::BadString {
                        name: def.name.to_string(),
                        encoding: "ANSI",
                    })?
                    .to_string(),
            )
        }
        PropertyType::U8 | PropertyType::U16 | PropertyType::U32 | PropertyType::U64 => {
            PropertyValue::Unsigned(le(bytes.len()))
        }
        PropertyType::Pointer => PropertyValue::Unsigned(le(8)),
        PropertyType::I32 => PropertyValue::Signed(i64::from(le(4) as u32 as i32)),
        PropertyType::I64 => PropertyValue::Signed(le(8) as i64),
        PropertyType::Bool => PropertyValue::Bool(le(4) != 0),
        PropertyType::Guid => {
            let mut guid = [0u8; 16];
            guid.copy_from_slice(bytes);
            PropertyValue::Guid(guid)
        }
    })
}

/// Builds user-data buffers in schema order. Used by replay tooling and tests.
#[derive(Debug, Default, Clone)]
pub struct UserDataBuilder {
    buf: Vec<u8>,
}

impl UserDataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn utf16(mut self, s: &str) -> Self {
        for unit in s.encode_utf16().chain(std::iter::once(0)) {
            self.buf.extend_from_slice(&unit.to_le_bytes());
        }
        self
    }

    pub fn ansi(mut self, s: &str) -> Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[PropertyDef] = &[
        PropertyDef::new("Count", PropertyType::U32),
        PropertyDef::new("Name", PropertyType::Utf16String),
        PropertyDef::new("Tag", PropertyType::AnsiString),
        PropertyDef::new("Base", PropertyType::Pointer),
        PropertyDef::new("Delta", PropertyType::I32),
        PropertyDef::new("Enabled", PropertyType::Bool),
    ];

    fn record(user_data: Vec<u8>) -> RawRecord {
        RawRecord {
            provider: "Sample-Provider".into(),
            event_id: 7,
            opcode: 1,
            process_id: 4242,
            thread_id: 1,
            timestamp: Utc::now(),
            user_data,
        }
    }

    fn registry() -> SchemaRegistry {
        let mut r = SchemaRegistry::new();
        r.register("Sample-Provider", 7, SAMPLE);
        r
    }

    fn full() -> Vec<u8> {
        UserDataBuilder::new()
            .u32(3)
            .utf16("héllo")
            .ansi("tag")
            .u64(0x7ff6_0000_1000)
            .u32((-5i32) as u32)
            .u32(1)
            .build()
    }

    #[test]
    fn extracts_every_type_in_order() {
        let rec = record(full());
        let schema = registry().parse(&rec);
        assert_eq!(schema.event_id(), 7);
        assert_eq!(schema.process_id(), 4242);
        assert_eq!(schema.try_extract::<u32>("Count"), Ok(3));
        assert_eq!(schema.try_extract::<String>("Name").unwrap(), "héllo");
        assert_eq!(schema.try_extract::<String>("Tag").unwrap(), "tag");
        assert_eq!(schema.try_extract::<u64>("Base"), Ok(0x7ff6_0000_1000));
        assert_eq!(schema.try_extract::<i32>("Delta"), Ok(-5));
        assert_eq!(schema.try_extract::<bool>("Enabled"), Ok(true));
    }

    #[test]
    fn type_mismatch_and_unknown_names() {
        let rec = record(full());
        let schema = registry().parse(&rec);
        assert!(matches!(
            schema.try_extract::<String>("Count"),
            Err(ExtractError::TypeMismatch { .. })
        ));
        assert_eq!(
            schema.try_extract::<u32>("Missing"),
            Err(ExtractError::UnknownProperty("Missing".into()))
        );
    }

    #[test]
    fn truncation_fails_only_later_properties() {
        let data = UserDataBuilder::new().u32(3).raw(&[b'a', 0]).build();
        let rec = record(data);
        let schema = registry().parse(&rec);
        assert_eq!(schema.try_extract::<u32>("Count"), Ok(3));
        assert!(matches!(
            schema.try_extract::<String>("Name"),
            Err(ExtractError::Truncated { .. })
        ));
        assert!(matches!(
            schema.try_extract::<bool>("Enabled"),
            Err(ExtractError::Truncated { .. })
        ));
    }

    #[test]
    fn unpaired_surrogate_is_a_bad_string() {
        let data = UserDataBuilder::new()
            .u32(1)
            .raw(&[0x00, 0xd8, 0, 0])
            .build();
        let rec = record(data);
        assert!(matches!(
            registry().parse(&rec).try_extract::<String>("Name"),
            Err(ExtractError::BadString { .. })
        ));
    }

    #[test]
    fn unpublished_event_exposes_header_only() {
        let mut rec = record(full());
        rec.event_id = 8;
        let schema = registry().parse(&rec);
        assert!(!schema.has_schema());
        assert_eq!(schema.opcode(), 1);
        assert!(schema.try_extract::<u32>("Count").is_err());
    }

    #[test]
    fn raw_record_json_carries_base64_user_data() {
        let rec = record(vec![1, 2, 3]);
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"user_data\":\"AQID\""));
        let back: RawRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
