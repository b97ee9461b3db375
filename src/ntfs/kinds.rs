//! Typed views over attribute content.
//!
//! Only the dispatch and the payloads the rest of the library consumes
//! are structured here; Data, Bitmap, IndexRoot, IndexAllocation and the
//! remaining types stay raw byte streams. Parsing strategies are data
//! selected by [`AttributeKind`], not one type per attribute.

use std::io::Write;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::bytes::ByteReader;
use crate::error::Result;

use super::{AttributeType, FileRecordReference};

/// The parsing strategy selected for an attribute when it is wrapped
/// into an [`super::NtfsAttribute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    StandardInformation,
    FileName,
    SecurityDescriptor,
    VolumeName,
    VolumeInformation,
    ObjectId,
    ReparsePoint,
    AttributeList,
    /// No structured parser; content is exposed as raw bytes only.
    Raw,
}

impl AttributeKind {
    pub fn for_type(attribute_type: AttributeType) -> Self {
        match attribute_type {
            AttributeType::StandardInformation => AttributeKind::StandardInformation,
            AttributeType::FileName => AttributeKind::FileName,
            AttributeType::SecurityDescriptor => AttributeKind::SecurityDescriptor,
            AttributeType::VolumeName => AttributeKind::VolumeName,
            AttributeType::VolumeInformation => AttributeKind::VolumeInformation,
            AttributeType::ObjectId => AttributeKind::ObjectId,
            AttributeType::ReparsePoint => AttributeKind::ReparsePoint,
            AttributeType::AttributeList => AttributeKind::AttributeList,
            _ => AttributeKind::Raw,
        }
    }

    /// Parses `value` according to this kind.
    pub fn parse(self, value: &[u8]) -> Result<AttributePayload> {
        Ok(match self {
            AttributeKind::StandardInformation => {
                AttributePayload::StandardInformation(StandardInformationPayload::parse(value)?)
            }
            AttributeKind::FileName => AttributePayload::FileName(FileNamePayload::parse(value)?),
            AttributeKind::SecurityDescriptor => {
                AttributePayload::SecurityDescriptor(value.to_vec())
            }
            AttributeKind::VolumeName => {
                let mut reader = ByteReader::new(value);
                AttributePayload::VolumeName(reader.read_utf16le(value.len() / 2)?)
            }
            AttributeKind::VolumeInformation => {
                AttributePayload::VolumeInformation(VolumeInformationPayload::parse(value)?)
            }
            AttributeKind::ObjectId => AttributePayload::ObjectId(ObjectIdPayload::parse(value)?),
            AttributeKind::ReparsePoint => {
                AttributePayload::ReparsePoint(ReparsePointPayload::parse(value)?)
            }
            AttributeKind::AttributeList => {
                AttributePayload::AttributeList(AttributeListEntry::parse_list(value)?)
            }
            AttributeKind::Raw => AttributePayload::Raw(value.to_vec()),
        })
    }
}

/// Structured attribute content, one variant per parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttributePayload {
    StandardInformation(StandardInformationPayload),
    FileName(FileNamePayload),
    SecurityDescriptor(Vec<u8>),
    VolumeName(String),
    VolumeInformation(VolumeInformationPayload),
    ObjectId(ObjectIdPayload),
    ReparsePoint(ReparsePointPayload),
    AttributeList(Vec<AttributeListEntry>),
    Raw(Vec<u8>),
}

impl AttributePayload {
    /// Payload detail lines for diagnostic dumps.
    pub fn dump(&self, writer: &mut dyn Write, indent: &str) -> std::io::Result<()> {
        match self {
            AttributePayload::StandardInformation(p) => {
                writeln!(writer, "{}Created: {}", indent, filetime_to_rfc3339(p.created))?;
                writeln!(writer, "{}Modified: {}", indent, filetime_to_rfc3339(p.modified))?;
                writeln!(
                    writer,
                    "{}MFT Modified: {}",
                    indent,
                    filetime_to_rfc3339(p.mft_modified)
                )?;
                writeln!(writer, "{}Accessed: {}", indent, filetime_to_rfc3339(p.accessed))?;
                writeln!(writer, "{}DOS Flags: {:#010x}", indent, p.dos_flags)?;
            }
            AttributePayload::FileName(p) => {
                writeln!(writer, "{}Name: {}", indent, p.name)?;
                writeln!(writer, "{}Parent: {}", indent, p.parent)?;
                writeln!(writer, "{}Real Size: {}", indent, p.real_size)?;
                writeln!(writer, "{}Allocated Size: {}", indent, p.allocated_size)?;
            }
            AttributePayload::SecurityDescriptor(bytes) => {
                writeln!(writer, "{}Security descriptor, {} bytes", indent, bytes.len())?;
            }
            AttributePayload::VolumeName(name) => {
                writeln!(writer, "{}Volume Name: {}", indent, name)?;
            }
            AttributePayload::VolumeInformation(p) => {
                writeln!(
                    writer,
                    "{}NTFS Version: {}.{}, flags {:#06x}",
                    indent, p.major_version, p.minor_version, p.flags
                )?;
            }
            AttributePayload::ObjectId(p) => {
                writeln!(writer, "{}Object Id: {}", indent, guid_to_string(&p.object_id))?;
            }
            AttributePayload::ReparsePoint(p) => {
                writeln!(
                    writer,
                    "{}Reparse tag {:#010x}, {} data bytes",
                    indent,
                    p.tag,
                    p.data.len()
                )?;
            }
            AttributePayload::AttributeList(entries) => {
                for entry in entries {
                    writeln!(
                        writer,
                        "{}{} extent: start VCN {}, in record {}, id {}",
                        indent,
                        entry.attribute_type.type_name(),
                        entry.start_vcn,
                        entry.file_reference,
                        entry.attribute_id
                    )?;
                }
            }
            AttributePayload::Raw(bytes) => {
                writeln!(writer, "{}Raw content, {} bytes", indent, bytes.len())?;
            }
        }
        Ok(())
    }
}

/// $STANDARD_INFORMATION: the first 48 bytes are identical on every
/// NTFS version; the id fields only exist on 3.x volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardInformationPayload {
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub dos_flags: u32,
    pub owner_id: u32,
    pub security_id: u32,
}

impl StandardInformationPayload {
    fn parse(value: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(value);
        let created = reader.read_u64_le()?;
        let modified = reader.read_u64_le()?;
        let mft_modified = reader.read_u64_le()?;
        let accessed = reader.read_u64_le()?;
        let dos_flags = reader.read_u32_le()?;
        // Version fields between the flags and the 3.x id block.
        let (owner_id, security_id) = if value.len() >= 0x48 {
            reader.skip(12)?;
            (reader.read_u32_le()?, reader.read_u32_le()?)
        } else {
            (0, 0)
        };
        Ok(StandardInformationPayload {
            created,
            modified,
            mft_modified,
            accessed,
            dos_flags,
            owner_id,
            security_id,
        })
    }
}

/// $FILE_NAME: 66-byte fixed part followed by the UTF-16LE name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNamePayload {
    pub parent: FileRecordReference,
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub name_namespace: u8,
    pub name: String,
}

impl FileNamePayload {
    fn parse(value: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(value);
        let parent = FileRecordReference::from_raw(reader.read_u64_le()?);
        let created = reader.read_u64_le()?;
        let modified = reader.read_u64_le()?;
        let mft_modified = reader.read_u64_le()?;
        let accessed = reader.read_u64_le()?;
        let allocated_size = reader.read_u64_le()?;
        let real_size = reader.read_u64_le()?;
        let flags = reader.read_u32_le()?;
        reader.skip(4)?; // reparse value
        let name_length = reader.read_u8()? as usize;
        let name_namespace = reader.read_u8()?;
        let name = reader.read_utf16le(name_length)?;
        Ok(FileNamePayload {
            parent,
            created,
            modified,
            mft_modified,
            accessed,
            allocated_size,
            real_size,
            flags,
            name_namespace,
            name,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInformationPayload {
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: u16,
}

impl VolumeInformationPayload {
    fn parse(value: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(value);
        reader.skip(8)?; // reserved
        let major_version = reader.read_u8()?;
        let minor_version = reader.read_u8()?;
        let flags = reader.read_u16_le()?;
        Ok(VolumeInformationPayload {
            major_version,
            minor_version,
            flags,
        })
    }
}

/// $OBJECT_ID: only the object id itself is mandatory; the birth ids
/// are present when the value is long enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectIdPayload {
    pub object_id: [u8; 16],
    pub birth_volume_id: Option<[u8; 16]>,
    pub birth_object_id: Option<[u8; 16]>,
    pub domain_id: Option<[u8; 16]>,
}

impl ObjectIdPayload {
    fn parse(value: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(value);
        let object_id: [u8; 16] = reader.read_bytes(16)?.try_into().unwrap();
        let mut optional = || -> Option<[u8; 16]> {
            if reader.remaining() >= 16 {
                reader.read_bytes(16).ok().map(|b| b.try_into().unwrap())
            } else {
                None
            }
        };
        let birth_volume_id = optional();
        let birth_object_id = optional();
        let domain_id = optional();
        Ok(ObjectIdPayload {
            object_id,
            birth_volume_id,
            birth_object_id,
            domain_id,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReparsePointPayload {
    pub tag: u32,
    pub data: Vec<u8>,
}

impl ReparsePointPayload {
    fn parse(value: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(value);
        let tag = reader.read_u32_le()?;
        let length = reader.read_u16_le()? as usize;
        reader.skip(2)?; // reserved
        let data = reader.read_bytes(length.min(reader.remaining()))?.to_vec();
        Ok(ReparsePointPayload { tag, data })
    }
}

/// One entry of an $ATTRIBUTE_LIST: points at the record holding an
/// extent of some other attribute of the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeListEntry {
    pub attribute_type: AttributeType,
    pub start_vcn: u64,
    pub file_reference: FileRecordReference,
    pub attribute_id: u16,
    pub name: Option<String>,
}

impl AttributeListEntry {
    fn parse_list(value: &[u8]) -> Result<Vec<Self>> {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset + 0x1A <= value.len() {
            let mut reader = ByteReader::new(&value[offset..]);
            let type_raw = reader.read_u32_le()?;
            let entry_length = reader.read_u16_le()? as usize;
            if entry_length == 0 {
                break;
            }
            let name_length = reader.read_u8()? as usize;
            let name_offset = reader.read_u8()? as usize;
            let start_vcn = reader.read_u64_le()?;
            let file_reference = FileRecordReference::from_raw(reader.read_u64_le()?);
            let attribute_id = reader.read_u16_le()?;

            let attribute_type = match AttributeType::try_from(type_raw) {
                Ok(t) => t,
                // A list naming a type we do not model is not corruption.
                Err(_) => {
                    offset += entry_length;
                    continue;
                }
            };
            let name = if name_length > 0 {
                let mut name_reader = ByteReader::new(&value[offset..]);
                name_reader.skip(name_offset)?;
                Some(name_reader.read_utf16le(name_length)?)
            } else {
                None
            };

            entries.push(AttributeListEntry {
                attribute_type,
                start_vcn,
                file_reference,
                attribute_id,
                name,
            });
            offset += entry_length;
        }
        Ok(entries)
    }
}

/// Windows FILETIME → RFC 3339, empty string for out-of-range values.
pub fn filetime_to_rfc3339(ft: u64) -> String {
    const DELTA_MICROS: i64 = 11_644_473_600_000_000;
    let unix_micros = (ft / 10) as i64 - DELTA_MICROS;
    let secs = unix_micros.div_euclid(1_000_000);
    let nanos = unix_micros.rem_euclid(1_000_000) * 1_000;
    Utc.timestamp_opt(secs, nanos as u32)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn guid_to_string(guid: &[u8; 16]) -> String {
    guid.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_dispatch_closed_set() {
        assert_eq!(
            AttributeKind::for_type(AttributeType::StandardInformation),
            AttributeKind::StandardInformation
        );
        assert_eq!(AttributeKind::for_type(AttributeType::Data), AttributeKind::Raw);
        assert_eq!(AttributeKind::for_type(AttributeType::Bitmap), AttributeKind::Raw);
        assert_eq!(
            AttributeKind::for_type(AttributeType::IndexAllocation),
            AttributeKind::Raw
        );
    }

    #[test]
    fn test_parse_standard_information() {
        let mut value = Vec::new();
        for ts in [1u64, 2, 3, 4] {
            value.extend_from_slice(&(0x01D0_0000_0000_0000u64 + ts).to_le_bytes());
        }
        value.extend_from_slice(&0x20u32.to_le_bytes()); // DOS flags: archive
        value.extend_from_slice(&[0u8; 12]);

        let payload = AttributeKind::StandardInformation.parse(&value).unwrap();
        match payload {
            AttributePayload::StandardInformation(p) => {
                assert_eq!(p.dos_flags, 0x20);
                assert_eq!(p.owner_id, 0); // short 1.x layout
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_parse_file_name() {
        let mut value = Vec::new();
        value.extend_from_slice(&FileRecordReference::new(5, 2).raw().to_le_bytes());
        value.extend_from_slice(&[0u8; 32]); // timestamps
        value.extend_from_slice(&4096u64.to_le_bytes()); // allocated
        value.extend_from_slice(&1234u64.to_le_bytes()); // real
        value.extend_from_slice(&0u32.to_le_bytes()); // flags
        value.extend_from_slice(&0u32.to_le_bytes()); // reparse
        value.push(8); // name length in chars
        value.push(1); // namespace: Win32
        value.extend("test.txt".encode_utf16().flat_map(|u| u.to_le_bytes()));

        let payload = AttributeKind::FileName.parse(&value).unwrap();
        match payload {
            AttributePayload::FileName(p) => {
                assert_eq!(p.name, "test.txt");
                assert_eq!(p.parent.record_index(), 5);
                assert_eq!(p.parent.sequence_number(), 2);
                assert_eq!(p.real_size, 1234);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_parse_attribute_list() {
        let mut value = Vec::new();
        for (attr_type, vcn, file_idx, id) in
            [(0x80u32, 0u64, 30u64, 2u16), (0x80, 100, 31, 5)]
        {
            value.extend_from_slice(&attr_type.to_le_bytes());
            value.extend_from_slice(&0x20u16.to_le_bytes()); // entry length
            value.push(0); // name length
            value.push(0x1A); // name offset
            value.extend_from_slice(&vcn.to_le_bytes());
            value.extend_from_slice(&FileRecordReference::new(file_idx, 1).raw().to_le_bytes());
            value.extend_from_slice(&id.to_le_bytes());
            value.extend_from_slice(&[0u8; 6]); // pad to entry length
        }

        let payload = AttributeKind::AttributeList.parse(&value).unwrap();
        match payload {
            AttributePayload::AttributeList(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].start_vcn, 0);
                assert_eq!(entries[1].start_vcn, 100);
                assert_eq!(entries[1].file_reference.record_index(), 31);
                assert_eq!(entries[1].attribute_id, 5);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_filetime_epoch() {
        // 1601-01-01 is the FILETIME epoch.
        assert_eq!(filetime_to_rfc3339(0), "1601-01-01T00:00:00+00:00");
        // 2004-ish value renders non-empty.
        assert!(!filetime_to_rfc3339(0x01C4_0000_0000_0000).is_empty());
    }

    #[test]
    fn test_volume_name_utf16() {
        let value: Vec<u8> = "System".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        match AttributeKind::VolumeName.parse(&value).unwrap() {
            AttributePayload::VolumeName(name) => assert_eq!(name, "System"),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
