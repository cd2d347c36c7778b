//! Flat, offset-based binary layout for [`PersistedRecord`].
//!
//! ```text
//! 0            u32 version
//! 4            u32 scalar count (S)
//! 8            u32 slot count (N)
//! 12           S x u32 scalars
//! 12 + 4S      N x (u32 offset, u32 len) slots
//! ...          heap
//! ```
//!
//! All integers are little-endian and offsets are absolute. A string slot
//! points at UTF-8 bytes. A code-list slot points at `len / 4` u32 values. A
//! string-list slot points at a `u32` count followed by that many nested
//! `(offset, len)` pairs. Every tracked field uses two consecutive entries,
//! current then previous.
//!
//! Decoding reads exactly the scalars and slots the current schema defines.
//! Records written by a later schema may declare more; the extras are
//! skipped. Records declaring fewer are rejected.

use crate::error::DecodeError;

use super::record::PersistedRecord;
use super::runtime::Tracked;

const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    OptionFlags = 0,
    WorkerThreads,
    Verbosity,
    RevocationCheck,
}

const SCALAR_FIELDS: usize = 4;
const SCALAR_COUNT: usize = SCALAR_FIELDS * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    BackendName = 0,
    Backend32Service,
    Backend64Service,
    CollectionService,
    WorkingDirectory,
    ConfigFile,
    CollectionLogfile,
    HashAlgorithms,
    LoggingChannels,
    ReportChannels,
    ModuleLoadProcesses,
    NetworkProcesses,
}

const SLOT_FIELDS: usize = 12;
const SLOT_COUNT: usize = SLOT_FIELDS * 2;

impl Field {
    fn name(self) -> &'static str {
        match self {
            Field::BackendName => "backend_name",
            Field::Backend32Service => "backend32_service",
            Field::Backend64Service => "backend64_service",
            Field::CollectionService => "collection_service",
            Field::WorkingDirectory => "working_directory",
            Field::ConfigFile => "config_file",
            Field::CollectionLogfile => "collection_logfile",
            Field::HashAlgorithms => "hash_algorithms",
            Field::LoggingChannels => "logging_channels",
            Field::ReportChannels => "report_channels",
            Field::ModuleLoadProcesses => "module_load_processes",
            Field::NetworkProcesses => "network_processes",
        }
    }
}

fn slot_index(field: Field, previous: bool) -> usize {
    field as usize * 2 + usize::from(previous)
}

fn scalar_index(scalar: Scalar, previous: bool) -> usize {
    scalar as usize * 2 + usize::from(previous)
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, DecodeError> {
    let end = at.checked_add(4).unwrap_or(usize::MAX);
    let bytes = buf.get(at..end).ok_or(DecodeError::Truncated {
        need: end,
        have: buf.len(),
    })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Borrowed view over an encoded record. String accessors return slices of
/// the input buffer; nothing is copied until [`RecordView::to_record`].
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    buf: &'a [u8],
    version: u32,
    scalars_at: usize,
    slots_at: usize,
}

impl<'a> RecordView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        let version = read_u32(buf, 0)?;
        let scalar_count = read_u32(buf, 4)?;
        let slot_count = read_u32(buf, 8)?;

        if (scalar_count as usize) < SCALAR_COUNT {
            return Err(DecodeError::MissingFields {
                section: "scalar",
                declared: scalar_count,
                required: SCALAR_COUNT as u32,
            });
        }
        if (slot_count as usize) < SLOT_COUNT {
            return Err(DecodeError::MissingFields {
                section: "slot",
                declared: slot_count,
                required: SLOT_COUNT as u32,
            });
        }

        let slots_at = HEADER_LEN as u64 + u64::from(scalar_count) * 4;
        let table_end = slots_at + u64::from(slot_count) * 8;
        if table_end > buf.len() as u64 {
            return Err(DecodeError::Truncated {
                need: usize::try_from(table_end).unwrap_or(usize::MAX),
                have: buf.len(),
            });
        }

        Ok(Self {
            buf,
            version,
            scalars_at: HEADER_LEN,
            slots_at: slots_at as usize,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn scalar(&self, scalar: Scalar, previous: bool) -> u32 {
        let at = self.scalars_at + scalar_index(scalar, previous) * 4;
        // Bounds were checked in `parse`.
        read_u32(self.buf, at).unwrap_or_default()
    }

    fn region(&self, field: Field, previous: bool) -> Result<&'a [u8], DecodeError> {
        let at = self.slots_at + slot_index(field, previous) * 8;
        let offset = read_u32(self.buf, at)?;
        let len = read_u32(self.buf, at + 4)?;
        self.bytes(field, offset, len)
    }

    fn bytes(&self, field: Field, offset: u32, len: u32) -> Result<&'a [u8], DecodeError> {
        let start = offset as usize;
        let end = start.checked_add(len as usize);
        end.and_then(|end| self.buf.get(start..end))
            .ok_or(DecodeError::OutOfBounds {
                slot: field.name(),
                offset,
                len,
                size: self.buf.len(),
            })
    }

    fn string(&self, field: Field, previous: bool) -> Result<&'a str, DecodeError> {
        let bytes = self.region(field, previous)?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(field.name()))
    }

    fn codes(&self, field: Field, previous: bool) -> Result<Vec<u32>, DecodeError> {
        let bytes = self.region(field, previous)?;
        if bytes.len() % 4 != 0 {
            return Err(DecodeError::BadLength {
                slot: field.name(),
                len: bytes.len() as u32,
            });
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn strings(&self, field: Field, previous: bool) -> Result<Vec<&'a str>, DecodeError> {
        let region = self.region(field, previous)?;
        if region.is_empty() {
            return Ok(Vec::new());
        }
        let count = read_u32(region, 0)?;
        let needed = 4u64 + u64::from(count) * 8;
        if needed > region.len() as u64 {
            return Err(DecodeError::BadLength {
                slot: field.name(),
                len: region.len() as u32,
            });
        }
        (0..count as usize)
            .map(|i| {
                let offset = read_u32(region, 4 + i * 8)?;
                let len = read_u32(region, 8 + i * 8)?;
                let bytes = self.bytes(field, offset, len)?;
                std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(field.name()))
            })
            .collect()
    }

    fn tracked<T>(
        &self,
        field: Field,
        read: impl Fn(&Self, Field, bool) -> Result<T, DecodeError>,
    ) -> Result<Tracked<T>, DecodeError> {
        Ok(Tracked {
            current: read(self, field, false)?,
            previous: read(self, field, true)?,
        })
    }

    fn tracked_scalar(&self, scalar: Scalar) -> Tracked<u32> {
        Tracked {
            current: self.scalar(scalar, false),
            previous: self.scalar(scalar, true),
        }
    }

    pub fn to_record(&self) -> Result<PersistedRecord, DecodeError> {
        let owned = |v: &Self, f, p| v.string(f, p).map(String::from);
        let owned_list = |v: &Self, f, p| {
            v.strings(f, p)
                .map(|l| l.into_iter().map(String::from).collect::<Vec<_>>())
        };
        Ok(PersistedRecord {
            version: self.version,
            option_flags: self.tracked_scalar(Scalar::OptionFlags),
            worker_threads: self.tracked_scalar(Scalar::WorkerThreads),
            verbosity: self.tracked_scalar(Scalar::Verbosity),
            revocation_check: self.tracked_scalar(Scalar::RevocationCheck),
            backend_name: self.tracked(Field::BackendName, owned)?,
            backend32_service: self.tracked(Field::Backend32Service, owned)?,
            backend64_service: self.tracked(Field::Backend64Service, owned)?,
            collection_service: self.tracked(Field::CollectionService, owned)?,
            working_directory: self.tracked(Field::WorkingDirectory, owned)?,
            config_file: self.tracked(Field::ConfigFile, owned)?,
            collection_logfile: self.tracked(Field::CollectionLogfile, owned)?,
            hash_algorithms: self.tracked(Field::HashAlgorithms, owned)?,
            logging_channels: self.tracked(Field::LoggingChannels, Self::codes)?,
            report_channels: self.tracked(Field::ReportChannels, Self::codes)?,
            module_load_processes: self.tracked(Field::ModuleLoadProcesses, owned_list)?,
            network_processes: self.tracked(Field::NetworkProcesses, owned_list)?,
        })
    }
}

pub fn decode(buf: &[u8]) -> Result<PersistedRecord, DecodeError> {
    RecordView::parse(buf)?.to_record()
}

struct Encoder {
    scalars: [u32; SCALAR_COUNT],
    slots: [(u32, u32); SLOT_COUNT],
    heap: Vec<u8>,
}

const HEAP_BASE: usize = HEADER_LEN + SCALAR_COUNT * 4 + SLOT_COUNT * 8;

impl Encoder {
    fn new() -> Self {
        Self {
            scalars: [0; SCALAR_COUNT],
            slots: [(0, 0); SLOT_COUNT],
            heap: Vec::new(),
        }
    }

    fn cursor(&self) -> u32 {
        (HEAP_BASE + self.heap.len()) as u32
    }

    fn scalar(&mut self, scalar: Scalar, value: &Tracked<u32>) {
        self.scalars[scalar_index(scalar, false)] = value.current;
        self.scalars[scalar_index(scalar, true)] = value.previous;
    }

    fn push(&mut self, bytes: &[u8]) -> (u32, u32) {
        let at = self.cursor();
        self.heap.extend_from_slice(bytes);
        (at, bytes.len() as u32)
    }

    fn string(&mut self, field: Field, value: &Tracked<String>) {
        self.slots[slot_index(field, false)] = self.push(value.current.as_bytes());
        self.slots[slot_index(field, true)] = self.push(value.previous.as_bytes());
    }

    fn codes(&mut self, field: Field, value: &Tracked<Vec<u32>>) {
        for (previous, codes) in [(false, &value.current), (true, &value.previous)] {
            let bytes: Vec<u8> = codes.iter().flat_map(|c| c.to_le_bytes()).collect();
            self.slots[slot_index(field, previous)] = self.push(&bytes);
        }
    }

    fn strings(&mut self, field: Field, value: &Tracked<Vec<String>>) {
        for (previous, list) in [(false, &value.current), (true, &value.previous)] {
            let start = self.heap.len();
            let at = self.cursor();
            self.heap.extend_from_slice(&(list.len() as u32).to_le_bytes());
            let table = self.heap.len();
            self.heap.resize(table + list.len() * 8, 0);
            let directory_len = (self.heap.len() - start) as u32;

            for (i, item) in list.iter().enumerate() {
                let (offset, len) = self.push(item.as_bytes());
                let entry = table + i * 8;
                self.heap[entry..entry + 4].copy_from_slice(&offset.to_le_bytes());
                self.heap[entry + 4..entry + 8].copy_from_slice(&len.to_le_bytes());
            }
            self.slots[slot_index(field, previous)] = (at, directory_len);
        }
    }

    fn finish(self, version: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEAP_BASE + self.heap.len());
        out.extend_from_slice(&version.to_le_bytes());
        out.extend_from_slice(&(SCALAR_COUNT as u32).to_le_bytes());
        out.extend_from_slice(&(SLOT_COUNT as u32).to_le_bytes());
        for scalar in self.scalars {
            out.extend_from_slice(&scalar.to_le_bytes());
        }
        for (offset, len) in self.slots {
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
        }
        out.extend_from_slice(&self.heap);
        out
    }
}

pub fn encode(record: &PersistedRecord) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.scalar(Scalar::OptionFlags, &record.option_flags);
    enc.scalar(Scalar::WorkerThreads, &record.worker_threads);
    enc.scalar(Scalar::Verbosity, &record.verbosity);
    enc.scalar(Scalar::RevocationCheck, &record.revocation_check);
    enc.string(Field::BackendName, &record.backend_name);
    enc.string(Field::Backend32Service, &record.backend32_service);
    enc.string(Field::Backend64Service, &record.backend64_service);
    enc.string(Field::CollectionService, &record.collection_service);
    enc.string(Field::WorkingDirectory, &record.working_directory);
    enc.string(Field::ConfigFile, &record.config_file);
    enc.string(Field::CollectionLogfile, &record.collection_logfile);
    enc.string(Field::HashAlgorithms, &record.hash_algorithms);
    enc.codes(Field::LoggingChannels, &record.logging_channels);
    enc.codes(Field::ReportChannels, &record.report_channels);
    enc.strings(Field::ModuleLoadProcesses, &record.module_load_processes);
    enc.strings(Field::NetworkProcesses, &record.network_processes);
    enc.finish(record.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::record::CURRENT_SCHEMA_VERSION;

    fn sample() -> PersistedRecord {
        PersistedRecord {
            version: CURRENT_SCHEMA_VERSION,
            option_flags: Tracked { current: 3, previous: 1 },
            worker_threads: Tracked { current: 8, previous: 4 },
            verbosity: Tracked::fresh(2),
            revocation_check: Tracked { current: 1, previous: 0 },
            backend_name: Tracked { current: "tkb".into(), previous: "tkbackend".into() },
            backend32_service: Tracked::fresh("tkb32.exe".into()),
            backend64_service: Tracked::fresh("tkb64.exe".into()),
            collection_service: Tracked::fresh("tracekeep".into()),
            working_directory: Tracked::fresh("/var/lib/tracekeep".into()),
            config_file: Tracked::fresh("/var/lib/tracekeep/tracekeep_config.xml".into()),
            collection_logfile: Tracked::fresh(String::new()),
            hash_algorithms: Tracked { current: "sha1|sha256".into(), previous: "*".into() },
            logging_channels: Tracked { current: vec![1, 2], previous: vec![] },
            report_channels: Tracked::fresh(vec![1, 2]),
            module_load_processes: Tracked {
                current: vec!["powershell.exe".into(), "".into(), "cmd.exe".into()],
                previous: vec![],
            },
            network_processes: Tracked::fresh(vec!["svchost.exe".into()]),
        }
    }

    #[test]
    fn roundtrip_populated_and_empty() {
        for record in [sample(), PersistedRecord::default()] {
            let bytes = encode(&record);
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, record);
            assert_eq!(encode(&decoded), bytes);
        }
    }

    #[test]
    fn view_borrows_without_copying() {
        let bytes = encode(&sample());
        let view = RecordView::parse(&bytes).unwrap();
        let name = view.string(Field::BackendName, false).unwrap();
        assert_eq!(name, "tkb");
        let range = bytes.as_ptr_range();
        assert!(range.contains(&name.as_ptr()));
        assert_eq!(
            view.strings(Field::ModuleLoadProcesses, false).unwrap(),
            vec!["powershell.exe", "", "cmd.exe"]
        );
    }

    #[test]
    fn short_or_corrupt_buffers_fail() {
        assert!(matches!(decode(&[]), Err(DecodeError::Truncated { .. })));

        let bytes = encode(&sample());
        assert!(decode(&bytes[..HEAP_BASE - 1]).is_err());
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::OutOfBounds { .. })
        ));

        let mut fewer = bytes.clone();
        fewer[8..12].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            decode(&fewer),
            Err(DecodeError::MissingFields { section: "slot", .. })
        ));
    }

    #[test]
    fn later_schema_extras_are_ignored() {
        let record = sample();
        let current = encode(&record);

        // Re-lay the record as a newer writer would: one extra scalar and one
        // extra slot, every offset shifted by the 12 added table bytes.
        let shift = 12u32;
        let mut future = Vec::new();
        future.extend_from_slice(&7u32.to_le_bytes());
        future.extend_from_slice(&((SCALAR_COUNT + 1) as u32).to_le_bytes());
        future.extend_from_slice(&((SLOT_COUNT + 1) as u32).to_le_bytes());
        future.extend_from_slice(&current[HEADER_LEN..HEADER_LEN + SCALAR_COUNT * 4]);
        future.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        let table = HEADER_LEN + SCALAR_COUNT * 4;
        for i in 0..SLOT_COUNT {
            let at = table + i * 8;
            let offset = read_u32(&current, at).unwrap() + shift;
            let len = read_u32(&current, at + 4).unwrap();
            future.extend_from_slice(&offset.to_le_bytes());
            future.extend_from_slice(&len.to_le_bytes());
        }
        future.extend_from_slice(&[0u8; 8]);
        let mut heap = current[HEAP_BASE..].to_vec();
        // Nested string-list entries are absolute too.
        for field in [Field::ModuleLoadProcesses, Field::NetworkProcesses] {
            for previous in [false, true] {
                let at = table + slot_index(field, previous) * 8;
                let region = read_u32(&current, at).unwrap() as usize - HEAP_BASE;
                let count = read_u32(&heap, region).unwrap() as usize;
                for i in 0..count {
                    let entry = region + 4 + i * 8;
                    let shifted = read_u32(&heap, entry).unwrap() + shift;
                    heap[entry..entry + 4].copy_from_slice(&shifted.to_le_bytes());
                }
            }
        }
        future.extend_from_slice(&heap);

        let decoded = decode(&future).unwrap();
        assert_eq!(decoded.version, 7);
        assert_eq!(PersistedRecord { version: record.version, ..decoded }, record);
    }
}
