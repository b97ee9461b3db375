//! Typed VBLK records and the block-level dispatcher.
//!
//! Each VBLK block carries one variable-length record. The low nibble of
//! the type byte selects the record kind; blocks without the `VBLK`
//! signature, unused entries and reserved type values are not records at
//! all and parse to `None`.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::bytes::ByteReader;
use crate::error::Result;

pub(crate) const VBLK_SIGNATURE: &[u8; 4] = b"VBLK";

const TYPE_VOLUME: u8 = 0x3;
const TYPE_COMPONENT: u8 = 0x4;
const TYPE_EXTENT: u8 = 0x5;
const TYPE_DISK: u8 = 0x6;
const TYPE_DISK_GROUP: u8 = 0x7;

/// Discriminates the five record kinds a database stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    DiskGroup,
    Disk,
    Volume,
    Component,
    Extent,
}

/// Top of every dynamic-disk group: names the group and carries its GUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskGroupRecord {
    pub id: u64,
    pub name: String,
    /// GUID string as stored, not canonicalized.
    pub group_guid: String,
}

/// One physical disk participating in the group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub id: u64,
    pub name: String,
    pub disk_guid: String,
}

/// A logical volume; its data lives in the components referencing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: u64,
    pub name: String,
    /// ACTIVE, SYNC, ... as stored on disk.
    pub state: String,
    pub size: u64,
    pub volume_guid: [u8; 16],
}

/// Ties a set of extents to a volume (mirror/stripe/simple plex).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub id: u64,
    pub name: String,
    /// Id of the parent [`VolumeRecord`].
    pub volume_id: u64,
}

/// A contiguous run of sectors on one disk, owned by a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtentRecord {
    pub id: u64,
    pub name: String,
    /// Id of the parent [`ComponentRecord`].
    pub component_id: u64,
    /// Id of the [`DiskRecord`] holding the data.
    pub disk_id: u64,
    /// Sector offset of the run on that disk.
    pub disk_offset: u64,
    /// Length of the run in sectors.
    pub size: u64,
}

/// Any record a database block can hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DatabaseRecord {
    DiskGroup(DiskGroupRecord),
    Disk(DiskRecord),
    Volume(VolumeRecord),
    Component(ComponentRecord),
    Extent(ExtentRecord),
}

impl DatabaseRecord {
    pub fn id(&self) -> u64 {
        match self {
            DatabaseRecord::DiskGroup(r) => r.id,
            DatabaseRecord::Disk(r) => r.id,
            DatabaseRecord::Volume(r) => r.id,
            DatabaseRecord::Component(r) => r.id,
            DatabaseRecord::Extent(r) => r.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DatabaseRecord::DiskGroup(r) => &r.name,
            DatabaseRecord::Disk(r) => &r.name,
            DatabaseRecord::Volume(r) => &r.name,
            DatabaseRecord::Component(r) => &r.name,
            DatabaseRecord::Extent(r) => &r.name,
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            DatabaseRecord::DiskGroup(_) => RecordType::DiskGroup,
            DatabaseRecord::Disk(_) => RecordType::Disk,
            DatabaseRecord::Volume(_) => RecordType::Volume,
            DatabaseRecord::Component(_) => RecordType::Component,
            DatabaseRecord::Extent(_) => RecordType::Extent,
        }
    }

    /// Attempts to parse one database block.
    ///
    /// `Ok(None)` means the block holds no record (foreign signature,
    /// unused entry or reserved type) and the loader should move on;
    /// `Err` is reserved for blocks that claim to hold a record but are
    /// truncated.
    pub fn parse_block(block: &[u8]) -> Result<Option<DatabaseRecord>> {
        if block.len() < 0x18 || &block[0..4] != VBLK_SIGNATURE {
            return Ok(None);
        }

        let mut reader = ByteReader::new(block);
        reader.set_position(0x04);
        let _sequence = reader.read_u32_be()?;
        let _group = reader.read_u32_be()?;
        let entry_marker = reader.read_u32_be()?;
        if entry_marker == 0 {
            // Allocated but unused slot.
            return Ok(None);
        }

        reader.set_position(0x13);
        let type_tag = reader.read_u8()? & 0x0F;
        let _data_length = reader.read_u32_be()?;

        // Payload starts at 0x18: id and name first, then the kind's own
        // fields.
        let record = match type_tag {
            TYPE_DISK_GROUP => {
                let id = reader.read_var_u64()?;
                let name = reader.read_counted_ascii()?;
                let group_guid = reader.read_counted_ascii()?;
                DatabaseRecord::DiskGroup(DiskGroupRecord {
                    id,
                    name,
                    group_guid,
                })
            }
            TYPE_DISK => {
                let id = reader.read_var_u64()?;
                let name = reader.read_counted_ascii()?;
                let disk_guid = reader.read_counted_ascii()?;
                DatabaseRecord::Disk(DiskRecord {
                    id,
                    name,
                    disk_guid,
                })
            }
            TYPE_VOLUME => {
                let id = reader.read_var_u64()?;
                let name = reader.read_counted_ascii()?;
                let state = reader.read_counted_ascii()?;
                let size = reader.read_var_u64()?;
                let volume_guid: [u8; 16] = reader.read_bytes(16)?.try_into().unwrap();
                DatabaseRecord::Volume(VolumeRecord {
                    id,
                    name,
                    state,
                    size,
                    volume_guid,
                })
            }
            TYPE_COMPONENT => {
                let id = reader.read_var_u64()?;
                let name = reader.read_counted_ascii()?;
                let volume_id = reader.read_var_u64()?;
                DatabaseRecord::Component(ComponentRecord {
                    id,
                    name,
                    volume_id,
                })
            }
            TYPE_EXTENT => {
                let id = reader.read_var_u64()?;
                let name = reader.read_counted_ascii()?;
                let component_id = reader.read_var_u64()?;
                let disk_id = reader.read_var_u64()?;
                let disk_offset = reader.read_var_u64()?;
                let size = reader.read_var_u64()?;
                DatabaseRecord::Extent(ExtentRecord {
                    id,
                    name,
                    component_id,
                    disk_id,
                    disk_offset,
                    size,
                })
            }
            other => {
                debug!("Skipping VBLK with reserved type tag {:#x}", other);
                return Ok(None);
            }
        };

        Ok(Some(record))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders for VBLK images, shared with the database tests.

    use super::*;
    use crate::bytes::ByteWriter;

    pub fn vblk_prelude(type_tag: u8) -> ByteWriter {
        let mut w = ByteWriter::new();
        w.write_bytes(VBLK_SIGNATURE);
        w.write_u32_be(1); // sequence
        w.write_u32_be(1); // group
        w.write_u32_be(1); // entry in use
        w.write_bytes(&[0u8; 3]); // status + flags
        w.write_u8(type_tag);
        w.write_u32_be(0); // data length, unused by the parser
        w
    }

    pub fn disk_group_block(id: u64, name: &str, guid: &str, block_size: usize) -> Vec<u8> {
        let mut w = vblk_prelude(0x7);
        w.write_var_u64(id);
        w.write_counted_ascii(name);
        w.write_counted_ascii(guid);
        w.pad_to(block_size);
        w.into_bytes()
    }

    pub fn disk_block(id: u64, name: &str, guid: &str, block_size: usize) -> Vec<u8> {
        let mut w = vblk_prelude(0x6);
        w.write_var_u64(id);
        w.write_counted_ascii(name);
        w.write_counted_ascii(guid);
        w.pad_to(block_size);
        w.into_bytes()
    }

    pub fn volume_block(id: u64, name: &str, guid: [u8; 16], block_size: usize) -> Vec<u8> {
        let mut w = vblk_prelude(0x3);
        w.write_var_u64(id);
        w.write_counted_ascii(name);
        w.write_counted_ascii("ACTIVE");
        w.write_var_u64(0x1000);
        w.write_bytes(&guid);
        w.pad_to(block_size);
        w.into_bytes()
    }

    pub fn component_block(id: u64, name: &str, volume_id: u64, block_size: usize) -> Vec<u8> {
        let mut w = vblk_prelude(0x4);
        w.write_var_u64(id);
        w.write_counted_ascii(name);
        w.write_var_u64(volume_id);
        w.pad_to(block_size);
        w.into_bytes()
    }

    pub fn extent_block(
        id: u64,
        name: &str,
        component_id: u64,
        disk_id: u64,
        block_size: usize,
    ) -> Vec<u8> {
        let mut w = vblk_prelude(0x5);
        w.write_var_u64(id);
        w.write_counted_ascii(name);
        w.write_var_u64(component_id);
        w.write_var_u64(disk_id);
        w.write_var_u64(0x3F); // disk offset
        w.write_var_u64(0x800); // size
        w.pad_to(block_size);
        w.into_bytes()
    }
}
