//! This module contains the NTFS attribute model.
//!
//! One logical attribute can be described by several attribute records
//! spread across MFT file records (the AttributeList mechanism). The
//! types here unify those records behind a single view keyed by
//! `(file record, attribute id)` pairs, resolve virtual cluster numbers
//! to the extent holding them, and expose the attribute content as a
//! byte-addressable stream.
//!
//! Sources:
//! - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
//! - https://en.wikipedia.org/wiki/NTFS

pub mod attribute;
pub mod buffer;
pub mod kinds;
pub mod records;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use attribute::{NtfsAttribute, RecordLookup};
pub use buffer::{AttributeBuffer, AttributeStream, ClusterSource};
pub use kinds::{AttributeKind, AttributeListEntry, AttributePayload};
pub use records::{
    decode_runs, AttributeHeader, AttributeRecord, ClusterRun, NonResidentAttributeRecord,
    ResidentAttributeRecord,
};

/// NTFS attribute type tags.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    EaInformation = 0xD0,
    Ea = 0xE0,
    PropertySet = 0xF0,
    LoggedUtilityStream = 0x100,
}

impl TryFrom<u32> for AttributeType {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        use AttributeType::*;
        Ok(match value {
            0x10 => StandardInformation,
            0x20 => AttributeList,
            0x30 => FileName,
            0x40 => ObjectId,
            0x50 => SecurityDescriptor,
            0x60 => VolumeName,
            0x70 => VolumeInformation,
            0x80 => Data,
            0x90 => IndexRoot,
            0xA0 => IndexAllocation,
            0xB0 => Bitmap,
            0xC0 => ReparsePoint,
            0xD0 => EaInformation,
            0xE0 => Ea,
            0xF0 => PropertySet,
            0x100 => LoggedUtilityStream,
            other => return Err(other),
        })
    }
}

impl AttributeType {
    /// The spelled-out form used by dump headers.
    pub fn type_name(self) -> &'static str {
        use AttributeType::*;
        match self {
            StandardInformation => "STANDARD INFORMATION",
            AttributeList => "ATTRIBUTE LIST",
            FileName => "FILE NAME",
            ObjectId => "OBJECT ID",
            SecurityDescriptor => "SECURITY DESCRIPTOR",
            VolumeName => "VOLUME NAME",
            VolumeInformation => "VOLUME INFORMATION",
            Data => "DATA",
            IndexRoot => "INDEX ROOT",
            IndexAllocation => "INDEX ALLOCATION",
            Bitmap => "BITMAP",
            ReparsePoint => "REPARSE POINT",
            EaInformation => "EA INFORMATION",
            Ea => "EA",
            PropertySet => "PROPERTY SET",
            LoggedUtilityStream => "LOGGED UTILITY STREAM",
        }
    }
}

/// Reference to one MFT file record: 48-bit record index plus 16-bit
/// sequence number, packed the way NTFS stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileRecordReference(u64);

impl FileRecordReference {
    pub fn new(index: u64, sequence: u16) -> Self {
        FileRecordReference((index & 0x0000_FFFF_FFFF_FFFF) | (u64::from(sequence) << 48))
    }

    pub fn from_raw(raw: u64) -> Self {
        FileRecordReference(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn record_index(&self) -> u64 {
        self.0 & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn sequence_number(&self) -> u16 {
        (self.0 >> 48) as u16
    }
}

impl fmt::Display for FileRecordReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (seq {})", self.record_index(), self.sequence_number())
    }
}

/// Identifies one attribute record extent across MFT record boundaries:
/// the file record containing it and the attribute id within that
/// record. Totally ordered so it can key the extent map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeReference {
    pub file: FileRecordReference,
    pub attribute_id: u16,
}

impl AttributeReference {
    pub fn new(file: FileRecordReference, attribute_id: u16) -> Self {
        AttributeReference { file, attribute_id }
    }
}

impl fmt::Display for AttributeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.attribute_id)
    }
}
