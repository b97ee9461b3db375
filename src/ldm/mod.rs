//! This module contains functionality for reading the LDM (dynamic disk)
//! metadata database.
//!
//! The database lives inside the LDM metadata partition: one VMDB header
//! sector followed by a dense region of fixed-size VBLK blocks, each
//! holding at most one typed record. Loading produces an id-indexed map
//! of records; the queries resolve the Volume → Component → Extent →
//! Disk containment chain on top of it.

pub mod records;

use std::collections::BTreeMap;
use std::io::SeekFrom;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::bytes::{ByteReader, ByteStream};
use crate::error::{Result, VDiskError};

pub use records::{
    ComponentRecord, DatabaseRecord, DiskGroupRecord, DiskRecord, ExtentRecord, RecordType,
    VolumeRecord,
};

const SECTOR_SIZE: usize = 512;
const VMDB_SIGNATURE: &[u8; 4] = b"VMDB";

/// The VMDB header occupying the first sector of the database area.
/// All scalar fields are big-endian.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHeader {
    /// Number of VBLK blocks following the header region.
    pub num_vblks: u32,
    /// Size in bytes of each VBLK block.
    pub block_size: u32,
    /// Offset from the start of the database to the block region.
    pub header_size: u32,
    pub update_status: u16,
    pub version_major: u16,
    pub version_minor: u16,
    /// Name of the disk group the database describes.
    pub group_name: String,
    /// GUID string of the disk group.
    pub disk_group_guid: String,
}

impl DatabaseHeader {
    /// Parses the header sector. Signature or size-field mismatches are
    /// structural corruption, not recoverable skips.
    pub fn read_from(sector: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(sector);
        let signature = reader.read_bytes(4)?;
        if signature != VMDB_SIGNATURE {
            return Err(VDiskError::CorruptDatabase(format!(
                "bad VMDB signature {:02x?}",
                signature
            )));
        }
        let num_vblks = reader.read_u32_be()?;
        let block_size = reader.read_u32_be()?;
        let header_size = reader.read_u32_be()?;
        let update_status = reader.read_u16_be()?;
        let version_major = reader.read_u16_be()?;
        let version_minor = reader.read_u16_be()?;
        let group_name = reader.read_ascii(31)?;
        let disk_group_guid = reader.read_ascii(64)?;

        if block_size == 0 || num_vblks == 0 {
            return Err(VDiskError::CorruptDatabase(
                "zero block size or block count".to_string(),
            ));
        }
        if (header_size as usize) < SECTOR_SIZE {
            return Err(VDiskError::CorruptDatabase(format!(
                "header size {} smaller than one sector",
                header_size
            )));
        }

        Ok(DatabaseHeader {
            num_vblks,
            block_size,
            header_size,
            update_status,
            version_major,
            version_minor,
            group_name,
            disk_group_guid,
        })
    }
}

/// A fully loaded LDM database: the header plus every record indexed by
/// its 64-bit id.
///
/// The database is read-mostly after construction; iteration order over
/// any of the query methods is stable for the lifetime of the instance.
#[derive(Debug)]
pub struct Database {
    header: DatabaseHeader,
    records: BTreeMap<u64, DatabaseRecord>,
}

impl Database {
    /// Reads a database starting at the stream's current position.
    ///
    /// Blocks that do not hold a record (foreign signature, unused
    /// entry, reserved type) are skipped; two records claiming the same
    /// id make the database corrupt.
    pub fn read(stream: &mut dyn ByteStream) -> Result<Database> {
        let db_start = stream.seek(SeekFrom::Current(0))?;

        let mut sector = [0u8; SECTOR_SIZE];
        read_full(stream, &mut sector)?;
        let header = DatabaseHeader::read_from(&sector)?;
        debug!(
            "VMDB header: group '{}', {} blocks of {} bytes",
            header.group_name, header.num_vblks, header.block_size
        );

        stream.seek(SeekFrom::Start(db_start + u64::from(header.header_size)))?;

        let mut records = BTreeMap::new();
        let mut block = vec![0u8; header.block_size as usize];
        for index in 0..header.num_vblks {
            read_full(stream, &mut block)?;
            let parsed = DatabaseRecord::parse_block(&block)?;
            let record = match parsed {
                Some(record) => record,
                None => {
                    debug!("Block {} holds no record, skipping", index);
                    continue;
                }
            };
            let id = record.id();
            if records.insert(id, record).is_some() {
                return Err(VDiskError::CorruptDatabase(format!(
                    "duplicate record id {:#x}",
                    id
                )));
            }
        }

        info!(
            "Loaded LDM database '{}': {} records",
            header.group_name,
            records.len()
        );
        Ok(Database { header, records })
    }

    pub fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record, in stable id order.
    pub fn records(&self) -> impl Iterator<Item = &DatabaseRecord> {
        self.records.values()
    }

    /// The disk group record matching `guid`, compared canonically
    /// (case-insensitive, surrounding braces ignored).
    pub fn disk_group(&self, guid: &str) -> Option<&DiskGroupRecord> {
        let wanted = canonical_guid(guid);
        self.records.values().find_map(|r| match r {
            DatabaseRecord::DiskGroup(g) if canonical_guid(&g.group_guid) == wanted => Some(g),
            _ => None,
        })
    }

    pub fn disks(&self) -> impl Iterator<Item = &DiskRecord> {
        self.records.values().filter_map(|r| match r {
            DatabaseRecord::Disk(d) => Some(d),
            _ => None,
        })
    }

    pub fn volumes(&self) -> impl Iterator<Item = &VolumeRecord> {
        self.records.values().filter_map(|r| match r {
            DatabaseRecord::Volume(v) => Some(v),
            _ => None,
        })
    }

    /// Components belonging to the volume with id `volume_id`.
    pub fn volume_components(&self, volume_id: u64) -> impl Iterator<Item = &ComponentRecord> {
        self.records.values().filter_map(move |r| match r {
            DatabaseRecord::Component(c) if c.volume_id == volume_id => Some(c),
            _ => None,
        })
    }

    /// Extents belonging to the component with id `component_id`.
    pub fn component_extents(&self, component_id: u64) -> impl Iterator<Item = &ExtentRecord> {
        self.records.values().filter_map(move |r| match r {
            DatabaseRecord::Extent(e) if e.component_id == component_id => Some(e),
            _ => None,
        })
    }

    /// Exact-id disk lookup; absence and type mismatch both fail.
    pub fn disk(&self, id: u64) -> Result<&DiskRecord> {
        match self.records.get(&id) {
            Some(DatabaseRecord::Disk(d)) => Ok(d),
            _ => Err(VDiskError::NotFound(format!("disk record {:#x}", id))),
        }
    }

    /// Exact-id volume lookup; absence and type mismatch both fail.
    pub fn volume(&self, id: u64) -> Result<&VolumeRecord> {
        match self.records.get(&id) {
            Some(DatabaseRecord::Volume(v)) => Ok(v),
            _ => Err(VDiskError::NotFound(format!("volume record {:#x}", id))),
        }
    }

    /// First record of `record_type` satisfying `pred`, if any.
    pub fn find_record<P>(&self, record_type: RecordType, pred: P) -> Option<&DatabaseRecord>
    where
        P: Fn(&DatabaseRecord) -> bool,
    {
        self.records
            .values()
            .find(|r| r.record_type() == record_type && pred(r))
    }

    /// Checks the referential invariants of a loaded database: every
    /// component names an existing volume, every extent an existing
    /// component and disk. Violations are logged and reported, not
    /// fatal, so a dump tool can still show the surviving records.
    pub fn check_references(&self) -> bool {
        let mut ok = true;
        for record in self.records.values() {
            match record {
                DatabaseRecord::Component(c) => {
                    if self.volume(c.volume_id).is_err() {
                        warn!(
                            "Component {:#x} references missing volume {:#x}",
                            c.id, c.volume_id
                        );
                        ok = false;
                    }
                }
                DatabaseRecord::Extent(e) => {
                    if !self
                        .records
                        .get(&e.component_id)
                        .map(|r| r.record_type() == RecordType::Component)
                        .unwrap_or(false)
                    {
                        warn!(
                            "Extent {:#x} references missing component {:#x}",
                            e.id, e.component_id
                        );
                        ok = false;
                    }
                    if self.disk(e.disk_id).is_err() {
                        warn!("Extent {:#x} references missing disk {:#x}", e.id, e.disk_id);
                        ok = false;
                    }
                }
                _ => {}
            }
        }
        ok
    }

    pub fn to_json(&self) -> Value {
        json!({
            "header": serde_json::to_value(&self.header).unwrap_or_else(|_| json!({})),
            "records": self
                .records
                .values()
                .map(|r| serde_json::to_value(r).unwrap_or_else(|_| json!({})))
                .collect::<Vec<_>>(),
        })
    }
}

/// `read_exact` with short reads mapped into the crate's EOF error.
fn read_full(stream: &mut dyn ByteStream, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            VDiskError::UnexpectedEof {
                needed: buf.len(),
                offset: 0,
            }
        } else {
            VDiskError::Io(e)
        }
    })
}

/// GUID strings compare case-insensitively with surrounding braces
/// stripped.
fn canonical_guid(guid: &str) -> String {
    guid.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::records::test_support::*;
    use super::*;
    use std::io::Seek;
    use crate::bytes::{ByteWriter, MemoryStream};

    const BLOCK_SIZE: usize = 128;
    const HEADER_SIZE: usize = 512;

    fn header_sector(num_vblks: u32) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_bytes(VMDB_SIGNATURE);
        w.write_u32_be(num_vblks);
        w.write_u32_be(BLOCK_SIZE as u32);
        w.write_u32_be(HEADER_SIZE as u32);
        w.write_u16_be(1); // update status
        w.write_u16_be(4); // version major
        w.write_u16_be(10); // version minor
        w.write_ascii_padded("Dg0", 31);
        w.write_ascii_padded("5f2a9f30-6c1e-4f62-9d38-0f0a2b7c9e11", 64);
        w.pad_to(HEADER_SIZE);
        w.into_bytes()
    }

    fn database_image(blocks: &[Vec<u8>]) -> MemoryStream {
        let mut image = header_sector(blocks.len() as u32);
        for block in blocks {
            image.extend_from_slice(block);
        }
        MemoryStream::from_bytes(image)
    }

    fn populated_database() -> Database {
        let blocks = vec![
            disk_group_block(1, "Dg0", "5f2a9f30-6c1e-4f62-9d38-0f0a2b7c9e11", BLOCK_SIZE),
            disk_block(2, "Disk1", "8a36cafe-0000-4d3a-9000-000000000001", BLOCK_SIZE),
            disk_block(3, "Disk2", "8a36cafe-0000-4d3a-9000-000000000002", BLOCK_SIZE),
            volume_block(4, "Volume1", [0xAB; 16], BLOCK_SIZE),
            component_block(5, "Volume1-01", 4, BLOCK_SIZE),
            extent_block(6, "Disk1-01", 5, 2, BLOCK_SIZE),
            extent_block(7, "Disk2-01", 5, 3, BLOCK_SIZE),
        ];
        Database::read(&mut database_image(&blocks)).unwrap()
    }

    #[test]
    fn test_load_indexes_all_records() {
        let db = populated_database();
        assert_eq!(db.len(), 7);
        assert!(db.check_references());
        // Ids are unique by construction of the map; confirm the count
        // matches distinct ids.
        let ids: Vec<u64> = db.records().map(|r| r.id()).collect();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids, deduped);
    }

    #[test]
    fn test_unknown_block_is_skipped() {
        let mut junk = vec![0u8; BLOCK_SIZE];
        junk[0..4].copy_from_slice(b"KLBV");
        let blocks = vec![
            disk_group_block(1, "Dg0", "5f2a9f30-6c1e-4f62-9d38-0f0a2b7c9e11", BLOCK_SIZE),
            junk,
            volume_block(4, "Volume1", [0x10; 16], BLOCK_SIZE),
        ];
        let db = Database::read(&mut database_image(&blocks)).unwrap();
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn test_duplicate_id_is_corrupt() {
        let blocks = vec![
            disk_block(2, "Disk1", "aaaa", BLOCK_SIZE),
            disk_block(2, "Disk1-again", "bbbb", BLOCK_SIZE),
        ];
        let err = Database::read(&mut database_image(&blocks)).unwrap_err();
        assert!(matches!(err, VDiskError::CorruptDatabase(_)));
    }

    #[test]
    fn test_bad_signature_is_corrupt() {
        let mut image = header_sector(1);
        image[0..4].copy_from_slice(b"BDMV");
        let err = Database::read(&mut MemoryStream::from_bytes(image)).unwrap_err();
        assert!(matches!(err, VDiskError::CorruptDatabase(_)));
    }

    #[test]
    fn test_truncated_header_is_eof() {
        let image = header_sector(1)[..100].to_vec();
        let err = Database::read(&mut MemoryStream::from_bytes(image)).unwrap_err();
        assert!(matches!(err, VDiskError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_disk_group_lookup_is_canonical() {
        let db = populated_database();
        let group = db
            .disk_group("{5F2A9F30-6C1E-4F62-9D38-0F0A2B7C9E11}")
            .expect("group should match braced uppercase form");
        assert_eq!(group.name, "Dg0");
        assert!(db.disk_group("00000000-0000-0000-0000-000000000000").is_none());
    }

    #[test]
    fn test_containment_queries() {
        let db = populated_database();

        assert_eq!(db.disks().count(), 2);
        assert_eq!(db.volumes().count(), 1);

        let volume = db.volumes().next().unwrap();
        let components: Vec<_> = db.volume_components(volume.id).collect();
        assert_eq!(components.len(), 1);

        let extents: Vec<_> = db.component_extents(components[0].id).collect();
        assert_eq!(extents.len(), 2);
        for extent in &extents {
            assert!(db.disk(extent.disk_id).is_ok());
        }
    }

    #[test]
    fn test_typed_lookup_rejects_mismatch() {
        let db = populated_database();
        // Id 4 is a volume: fetching it as a disk must not succeed.
        assert!(matches!(db.disk(4), Err(VDiskError::NotFound(_))));
        assert!(db.volume(4).is_ok());
        assert!(matches!(db.volume(999), Err(VDiskError::NotFound(_))));
    }

    #[test]
    fn test_find_record_predicate() {
        let db = populated_database();
        let found = db
            .find_record(RecordType::Disk, |r| r.name() == "Disk2")
            .expect("Disk2 exists");
        assert_eq!(found.id(), 3);
        assert!(db
            .find_record(RecordType::Extent, |r| r.name() == "Disk9-09")
            .is_none());
    }

    #[test]
    fn test_database_starts_at_stream_position() {
        // The database need not start at offset zero; prepend garbage
        // and seek past it.
        let blocks = vec![disk_block(2, "Disk1", "aaaa", BLOCK_SIZE)];
        let mut inner = vec![0xEE; 1024];
        inner.extend_from_slice(database_image(&blocks).as_bytes());
        let mut stream = MemoryStream::from_bytes(inner);
        stream.seek(SeekFrom::Start(1024)).unwrap();
        let db = Database::read(&mut stream).unwrap();
        assert_eq!(db.len(), 1);
    }
}
