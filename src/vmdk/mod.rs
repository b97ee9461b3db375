//! This module contains functionality for reading and writing VMDK
//! descriptor files.
//!
//! A descriptor is a line-oriented ASCII manifest with three sections:
//! header key/values, extent descriptors and the disk database. The codec
//! here round-trips all three, preserving unrecognized keys verbatim.
//!
//! See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#2-the-descriptor-file
//!
//! # Known Limitations
//!
//! Descriptor files not written in an ASCII-compatible encoding are not
//! supported.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::bytes::ByteStream;
use crate::error::{Result, VDiskError};
use crate::locator::{FileAccess, FileLocator, FileMode, FileShare};

const DESCRIPTOR_FILE_SIGNATURE: &str = "# Disk DescriptorFile";
const DESCRIPTOR_FILE_EXTENT_SECTION_SIGNATURE: &str = "# Extent description";
const DESCRIPTOR_FILE_DISK_DATABASE_SECTION_SIGNATURE: &str = "# The Disk Data Base";
const DESCRIPTOR_FILE_DDB_MARKER: &str = "#DDB";

const HEADER_KEY_VERSION: &str = "version";
const HEADER_KEY_CONTENT_ID: &str = "CID";
const HEADER_KEY_PARENT_CONTENT_ID: &str = "parentCID";
const HEADER_KEY_CREATE_TYPE: &str = "createType";
const HEADER_KEY_PARENT_FILE_NAME_HINT: &str = "parentFileNameHint";

const DDB_KEY_ADAPTER_TYPE: &str = "ddb.adapterType";
const DDB_KEY_GEOMETRY_SECTORS: &str = "ddb.geometry.sectors";
const DDB_KEY_GEOMETRY_HEADS: &str = "ddb.geometry.heads";
const DDB_KEY_GEOMETRY_CYLINDERS: &str = "ddb.geometry.cylinders";
const DDB_KEY_HARDWARE_VERSION: &str = "ddb.virtualHWVersion";
const DDB_KEY_UUID: &str = "ddb.uuid";

/// Represents a VMDK disk type.
///
/// As defined at: https://github.com/libyal/libvmdk/blame/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#212-disk-type
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
pub enum DiskCreateType {
    /// The disk is a single VMDK sparse extent data file that also
    /// contains the descriptor.
    #[strum(serialize = "monolithicSparse")]
    MonolithicSparse,
    /// The disk is split into COWD sparse extent data files, often used
    /// as a redo-log.
    #[strum(serialize = "vmfsSparse")]
    VmfsSparse,
    /// The disk is a single RAW extent data file next to the descriptor.
    #[strum(serialize = "monolithicFlat")]
    MonolithicFlat,
    /// The disk is a single RAW extent data file, pre-allocated on VMFS.
    #[strum(serialize = "vmfs")]
    Vmfs,
    /// The disk is split into sparse extents of maximum 2 GB.
    #[strum(serialize = "twoGbMaxExtentSparse")]
    TwoGbMaxExtentSparse,
    /// The disk is split into RAW extents of maximum 2 GB.
    #[strum(serialize = "twoGbMaxExtentFlat")]
    TwoGbMaxExtentFlat,
    /// The disk uses a full physical disk device.
    #[strum(serialize = "fullDevice")]
    FullDevice,
    /// Pass-through raw disk for ESXi hosts.
    #[strum(serialize = "vmfsRaw")]
    VmfsRaw,
    /// The disk uses a physical disk device, access per partition.
    #[strum(serialize = "partitionedDevice")]
    PartitionedDevice,
    /// Raw Device Map disk on VMFS.
    #[strum(serialize = "vmfsRawDeviceMap")]
    VmfsRawDeviceMap,
    /// Raw Device Map that passes SCSI commands to the hardware.
    #[strum(serialize = "vmfsPassthroughRawDeviceMap")]
    VmfsPassthroughRawDeviceMap,
    /// The disk is a single compressed sparse extent, suitable for
    /// streaming.
    #[strum(serialize = "streamOptimized")]
    StreamOptimized,
}

/// The disk adapter type advertised in the disk database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
pub enum DiskAdapterType {
    #[strum(serialize = "ide")]
    Ide,
    #[strum(serialize = "buslogic")]
    BusLogicScsi,
    #[strum(serialize = "lsilogic")]
    LsiLogicScsi,
    #[strum(serialize = "legacyESX")]
    LegacyEsx,
}

/// Access mode for an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
pub enum ExtentAccess {
    #[strum(serialize = "NOACCESS")]
    NoAccess,
    #[strum(serialize = "RDONLY")]
    ReadOnly,
    #[strum(serialize = "RW")]
    ReadWrite,
}

/// Whether a key/value entry emits its value wrapped in quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Plain,
    Quoted,
}

/// One `key=value` line of the header or disk-database section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorEntry {
    pub key: String,
    pub value: String,
    pub kind: EntryKind,
}

impl DescriptorEntry {
    pub fn new(key: &str, value: &str, kind: EntryKind) -> Self {
        DescriptorEntry {
            key: key.to_string(),
            value: value.to_string(),
            kind,
        }
    }

    /// Parses a `KEY=VALUE` line, detecting quoted values.
    fn parse(line: &str) -> Result<Self> {
        // Compiled once; the pattern admits the dotted ddb keys.
        static KEY_VALUE_REGEX: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r#"^([\w\.]+)\s*=\s*(.*)$"#).unwrap());

        let captures = KEY_VALUE_REGEX
            .captures(line)
            .ok_or_else(|| VDiskError::MalformedLine(line.to_string()))?;
        let key = captures.get(1).unwrap().as_str();
        let raw = captures.get(2).unwrap().as_str().trim();
        if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            Ok(DescriptorEntry::new(
                key,
                &raw[1..raw.len() - 1],
                EntryKind::Quoted,
            ))
        } else {
            Ok(DescriptorEntry::new(key, raw, EntryKind::Plain))
        }
    }
}

impl fmt::Display for DescriptorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntryKind::Plain => write!(f, "{}={}", self.key, self.value),
            EntryKind::Quoted => write!(f, "{}=\"{}\"", self.key, self.value),
        }
    }
}

/// The extent descriptor locates data within one extent file of the
/// virtual disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtentDescriptor {
    /// Access mode for the extent.
    pub access: ExtentAccess,
    /// Number of sectors in the extent.
    pub size_sectors: u64,
    /// The extent type token (SPARSE, FLAT, ZERO, VMFS, ...).
    pub extent_type: String,
    /// The name of the extent data file.
    pub filename: String,
    /// Start sector of the data within the extent file. Zero unless the
    /// extent embeds its own descriptor.
    pub offset: u64,
}

impl FromStr for ExtentDescriptor {
    type Err = VDiskError;

    fn from_str(s: &str) -> Result<Self> {
        // Compiled once, shared across threads.
        static EXTENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r#"^(RW|RDONLY|NOACCESS)\s+(\d+)\s+(\S+)(?:\s+"([^"]*)")?(?:\s+(\d+))?\s*$"#)
                .unwrap()
        });

        let captures = EXTENT_REGEX
            .captures(s)
            .ok_or_else(|| VDiskError::MalformedLine(s.to_string()))?;
        Ok(ExtentDescriptor {
            access: ExtentAccess::from_str(captures.get(1).unwrap().as_str()).unwrap(),
            size_sectors: captures
                .get(2)
                .unwrap()
                .as_str()
                .parse()
                .map_err(|_| VDiskError::MalformedLine(s.to_string()))?,
            extent_type: captures.get(3).unwrap().as_str().to_string(),
            filename: captures
                .get(4)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            offset: captures
                .get(5)
                .map(|m| m.as_str().parse().unwrap_or(0))
                .unwrap_or(0),
        })
    }
}

impl fmt::Display for ExtentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} \"{}\"",
            self.access, self.size_sectors, self.extent_type, self.filename
        )?;
        // The offset column is only meaningful for extents that carry
        // data at a non-zero start sector, so it is omitted when zero.
        if self.offset != 0 {
            write!(f, " {}", self.offset)?;
        }
        Ok(())
    }
}

/// Parsed form of a VMDK descriptor file: three ordered entry lists.
///
/// `ddb.*` keys live in the disk database, everything else in the
/// header; extents preserve insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorFile {
    pub header: Vec<DescriptorEntry>,
    pub extents: Vec<ExtentDescriptor>,
    pub disk_database: Vec<DescriptorEntry>,
}

impl Default for DescriptorFile {
    /// A fresh descriptor carries the defaults VMware tooling expects to
    /// find before the caller fills in the disk geometry.
    fn default() -> Self {
        let mut d = DescriptorFile {
            header: Vec::new(),
            extents: Vec::new(),
            disk_database: Vec::new(),
        };
        d.set_header(HEADER_KEY_VERSION, "1", EntryKind::Plain);
        d.set_header(HEADER_KEY_CONTENT_ID, "ffffffff", EntryKind::Plain);
        d.set_header(HEADER_KEY_PARENT_CONTENT_ID, "ffffffff", EntryKind::Plain);
        d.set_header(HEADER_KEY_CREATE_TYPE, "", EntryKind::Quoted);
        d.set_ddb(DDB_KEY_ADAPTER_TYPE, "lsilogic", EntryKind::Quoted);
        d.set_ddb(DDB_KEY_GEOMETRY_SECTORS, "", EntryKind::Quoted);
        d.set_ddb(DDB_KEY_GEOMETRY_HEADS, "", EntryKind::Quoted);
        d.set_ddb(DDB_KEY_GEOMETRY_CYLINDERS, "", EntryKind::Quoted);
        d
    }
}

impl DescriptorFile {
    pub fn new() -> Self {
        DescriptorFile::default()
    }

    /// Parses descriptor text. Trailing NULs are trimmed (monolithic
    /// sparse files pad the embedded descriptor to a sector boundary),
    /// `#` starts a comment, empty lines are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut file = DescriptorFile {
            header: Vec::new(),
            extents: Vec::new(),
            disk_database: Vec::new(),
        };

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\0');
            let line = match line.find('#') {
                Some(idx) => &line[..idx],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with("RW ")
                || line.starts_with("RDONLY ")
                || line.starts_with("NOACCESS ")
            {
                file.extents.push(line.parse()?);
            } else {
                let entry = DescriptorEntry::parse(line)?;
                if entry.key.starts_with("ddb.") {
                    file.disk_database.push(entry);
                } else {
                    file.header.push(entry);
                }
            }
        }

        debug!(
            "Parsed descriptor: {} header entries, {} extents, {} ddb entries",
            file.header.len(),
            file.extents.len(),
            file.disk_database.len()
        );
        Ok(file)
    }

    /// Reads and parses a descriptor from an open byte stream.
    pub fn read(stream: &mut dyn ByteStream) -> Result<Self> {
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        DescriptorFile::parse(&String::from_utf8_lossy(&raw))
    }

    /// Opens `name` through `locator` and parses it.
    pub fn load(locator: &dyn FileLocator, name: &str) -> Result<Self> {
        let mut stream = locator.open(name, FileMode::Open, FileAccess::Read, FileShare::Read)?;
        DescriptorFile::read(stream.as_mut())
    }

    /// Emits the three sections. Output is ASCII with `\n` line endings.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(DESCRIPTOR_FILE_SIGNATURE);
        out.push('\n');
        for entry in &self.header {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(DESCRIPTOR_FILE_EXTENT_SECTION_SIGNATURE);
        out.push('\n');
        for extent in &self.extents {
            out.push_str(&extent.to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(DESCRIPTOR_FILE_DISK_DATABASE_SECTION_SIGNATURE);
        out.push('\n');
        out.push_str(DESCRIPTOR_FILE_DDB_MARKER);
        out.push('\n');
        for entry in &self.disk_database {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }

    fn get(entries: &[DescriptorEntry], key: &str) -> Option<String> {
        entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.clone())
    }

    fn set(entries: &mut Vec<DescriptorEntry>, key: &str, value: &str, kind: EntryKind) {
        match entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.value = value.to_string();
                entry.kind = kind;
            }
            None => entries.push(DescriptorEntry::new(key, value, kind)),
        }
    }

    pub fn header_value(&self, key: &str) -> Option<String> {
        Self::get(&self.header, key)
    }

    pub fn ddb_value(&self, key: &str) -> Option<String> {
        Self::get(&self.disk_database, key)
    }

    pub fn set_header(&mut self, key: &str, value: &str, kind: EntryKind) {
        Self::set(&mut self.header, key, value, kind);
    }

    pub fn set_ddb(&mut self, key: &str, value: &str, kind: EntryKind) {
        Self::set(&mut self.disk_database, key, value, kind);
    }

    pub fn version(&self) -> Result<u32> {
        let raw = self
            .header_value(HEADER_KEY_VERSION)
            .ok_or_else(|| VDiskError::NotFound(HEADER_KEY_VERSION.to_string()))?;
        raw.parse().map_err(|_| VDiskError::MalformedLine(raw))
    }

    /// 32-bit content identifier, stored as 8 lowercase hex digits.
    pub fn content_id(&self) -> Result<u32> {
        self.cid_value(HEADER_KEY_CONTENT_ID)
    }

    pub fn parent_content_id(&self) -> Result<u32> {
        self.cid_value(HEADER_KEY_PARENT_CONTENT_ID)
    }

    fn cid_value(&self, key: &str) -> Result<u32> {
        let raw = self
            .header_value(key)
            .ok_or_else(|| VDiskError::NotFound(key.to_string()))?;
        u32::from_str_radix(&raw, 16).map_err(|_| VDiskError::MalformedLine(raw))
    }

    pub fn set_content_id(&mut self, cid: u32) {
        self.set_header(
            HEADER_KEY_CONTENT_ID,
            &format!("{:08x}", cid),
            EntryKind::Plain,
        );
    }

    pub fn set_parent_content_id(&mut self, cid: u32) {
        self.set_header(
            HEADER_KEY_PARENT_CONTENT_ID,
            &format!("{:08x}", cid),
            EntryKind::Plain,
        );
    }

    pub fn create_type(&self) -> Result<DiskCreateType> {
        let raw = self
            .header_value(HEADER_KEY_CREATE_TYPE)
            .ok_or_else(|| VDiskError::NotFound(HEADER_KEY_CREATE_TYPE.to_string()))?;
        DiskCreateType::from_str(&raw).map_err(|_| VDiskError::UnknownEnum {
            field: "createType",
            token: raw,
        })
    }

    pub fn set_create_type(&mut self, create_type: DiskCreateType) {
        self.set_header(
            HEADER_KEY_CREATE_TYPE,
            &create_type.to_string(),
            EntryKind::Quoted,
        );
    }

    pub fn parent_file_name_hint(&self) -> Option<String> {
        self.header_value(HEADER_KEY_PARENT_FILE_NAME_HINT)
    }

    pub fn set_parent_file_name_hint(&mut self, hint: &str) {
        self.set_header(HEADER_KEY_PARENT_FILE_NAME_HINT, hint, EntryKind::Quoted);
    }

    pub fn adapter_type(&self) -> Result<DiskAdapterType> {
        let raw = self
            .ddb_value(DDB_KEY_ADAPTER_TYPE)
            .ok_or_else(|| VDiskError::NotFound(DDB_KEY_ADAPTER_TYPE.to_string()))?;
        DiskAdapterType::from_str(&raw).map_err(|_| VDiskError::UnknownEnum {
            field: "ddb.adapterType",
            token: raw,
        })
    }

    pub fn set_adapter_type(&mut self, adapter: DiskAdapterType) {
        self.set_ddb(DDB_KEY_ADAPTER_TYPE, &adapter.to_string(), EntryKind::Quoted);
    }

    pub fn hardware_version(&self) -> Option<String> {
        self.ddb_value(DDB_KEY_HARDWARE_VERSION)
    }

    pub fn geometry(&self) -> Option<(u32, u32, u32)> {
        let cylinders = self.ddb_value(DDB_KEY_GEOMETRY_CYLINDERS)?.parse().ok()?;
        let heads = self.ddb_value(DDB_KEY_GEOMETRY_HEADS)?.parse().ok()?;
        let sectors = self.ddb_value(DDB_KEY_GEOMETRY_SECTORS)?.parse().ok()?;
        Some((cylinders, heads, sectors))
    }

    pub fn set_geometry(&mut self, cylinders: u32, heads: u32, sectors: u32) {
        self.set_ddb(
            DDB_KEY_GEOMETRY_CYLINDERS,
            &cylinders.to_string(),
            EntryKind::Quoted,
        );
        self.set_ddb(DDB_KEY_GEOMETRY_HEADS, &heads.to_string(), EntryKind::Quoted);
        self.set_ddb(
            DDB_KEY_GEOMETRY_SECTORS,
            &sectors.to_string(),
            EntryKind::Quoted,
        );
    }

    pub fn uuid(&self) -> Result<[u8; 16]> {
        let raw = self
            .ddb_value(DDB_KEY_UUID)
            .ok_or_else(|| VDiskError::NotFound(DDB_KEY_UUID.to_string()))?;
        parse_uuid(&raw)
    }

    pub fn set_uuid(&mut self, uuid: [u8; 16]) {
        self.set_ddb(DDB_KEY_UUID, &format_uuid(uuid), EntryKind::Quoted);
    }
}

/// Formats a disk UUID the way the disk database stores it: 16 hex bytes
/// separated by single spaces, with a dash between byte 7 and byte 8.
pub fn format_uuid(uuid: [u8; 16]) -> String {
    let mut out = String::with_capacity(47);
    for (i, byte) in uuid.iter().enumerate() {
        if i == 8 {
            out.push('-');
        } else if i != 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Parses a disk UUID, accepting space or dash as separator. Exactly 16
/// hex byte tokens are required.
pub fn parse_uuid(s: &str) -> Result<[u8; 16]> {
    let tokens: Vec<&str> = s
        .split(|c| c == ' ' || c == '-')
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() != 16 {
        return Err(VDiskError::InvalidUuid(s.to_string()));
    }
    let mut uuid = [0u8; 16];
    for (i, token) in tokens.iter().enumerate() {
        uuid[i] =
            u8::from_str_radix(token, 16).map_err(|_| VDiskError::InvalidUuid(s.to_string()))?;
    }
    Ok(uuid)
}
