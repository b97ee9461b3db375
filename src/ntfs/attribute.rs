//! The unified logical-attribute view over one or more attribute
//! records.

use std::collections::BTreeMap;
use std::io::Write;

use log::debug;

use crate::error::{Result, VDiskError};
use crate::locator::FileAccess;

use super::buffer::{AttributeBuffer, AttributeStream, ClusterSource};
use super::kinds::{AttributeKind, AttributePayload};
use super::records::{AttributeRecord, NonResidentAttributeRecord};
use super::{AttributeReference, AttributeType, FileRecordReference};

/// Back-reference to the file owning an attribute.
///
/// The parent file owns its attributes; an attribute only ever holds
/// this lookup capability, passed in per call, never ownership of the
/// file. Position translation for resident attributes goes through it.
pub trait RecordLookup {
    /// Byte offset of the referenced attribute's value within the MFT
    /// data stream.
    fn attribute_offset(&self, reference: &AttributeReference) -> Result<u64>;

    /// Maps an offset within the MFT data stream onto an absolute disk
    /// position. `None` when the offset falls in a sparse region.
    fn mft_offset_to_absolute_pos(&self, offset: u64) -> Result<Option<u64>>;
}

/// A single logical NTFS attribute.
///
/// Holds every record describing the attribute, keyed by
/// `(file record, attribute id)`. For resident attributes the map has
/// exactly one entry; a fragmented non-resident attribute has one entry
/// per extent, discovered through the file's AttributeList.
pub struct NtfsAttribute {
    /// File record the primary record lives in.
    file: FileRecordReference,
    /// Attribute id of the primary record within that file record.
    primary_id: u16,
    kind: AttributeKind,
    extents: BTreeMap<AttributeReference, AttributeRecord>,
}

impl NtfsAttribute {
    /// Wraps `record` into an attribute view, selecting the parsing
    /// strategy from its type tag.
    pub fn from_record(file: FileRecordReference, record: AttributeRecord) -> Self {
        let kind = AttributeKind::for_type(record.attribute_type());
        let primary_id = record.attribute_id();
        let mut extents = BTreeMap::new();
        extents.insert(AttributeReference::new(file, primary_id), record);
        NtfsAttribute {
            file,
            primary_id,
            kind,
            extents,
        }
    }

    /// The `(containing file, primary attribute id)` identity of this
    /// attribute.
    pub fn reference(&self) -> AttributeReference {
        AttributeReference::new(self.file, self.primary_id)
    }

    pub fn containing_file(&self) -> FileRecordReference {
        self.file
    }

    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    /// The record the attribute was constructed from (or re-pointed to
    /// by `set_extent`/`replace_extent`).
    pub fn primary_record(&self) -> &AttributeRecord {
        self.extents
            .get(&self.reference())
            .expect("extent map always holds the primary record")
    }

    pub(super) fn primary_record_mut(&mut self) -> &mut AttributeRecord {
        let reference = self.reference();
        self.extents
            .get_mut(&reference)
            .expect("extent map always holds the primary record")
    }

    pub fn attribute_type(&self) -> AttributeType {
        self.primary_record().attribute_type()
    }

    pub fn name(&self) -> Option<String> {
        self.primary_record().name().map(|n| n.to_string())
    }

    pub fn flags(&self) -> u16 {
        self.primary_record().flags()
    }

    pub fn is_non_resident(&self) -> bool {
        self.primary_record().is_non_resident()
    }

    pub fn data_length(&self) -> u64 {
        self.primary_record().data_length()
    }

    /// Compression unit size (log2 clusters) taken from the first
    /// extent, zero for resident attributes.
    pub fn compression_unit(&self) -> u16 {
        match self.first_extent() {
            Ok(AttributeRecord::NonResident(r)) => r.compression_unit,
            _ => 0,
        }
    }

    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> impl Iterator<Item = (&AttributeReference, &AttributeRecord)> {
        self.extents.iter()
    }

    /// Adds a record as a further extent of this attribute.
    pub fn add_extent(&mut self, reference: AttributeReference, record: AttributeRecord) -> Result<()> {
        if self.extents.contains_key(&reference) {
            return Err(VDiskError::DuplicateExtent(reference.to_string()));
        }
        self.extents.insert(reference, record);
        Ok(())
    }

    /// Removes an extent. The reference must be present; removing the
    /// primary extent of a still-fragmented attribute leaves the view
    /// unusable until `set_extent`/`replace_extent` repoints it, so
    /// callers tearing an attribute down should prefer those.
    pub fn remove_extent(&mut self, reference: &AttributeReference) -> Result<AttributeRecord> {
        self.extents
            .remove(reference)
            .ok_or_else(|| VDiskError::NotFound(reference.to_string()))
    }

    /// Lenient removal for callers replaying MFT updates that may have
    /// already detached the extent: absent keys are a no-op.
    pub fn remove_extent_if_present(&mut self, reference: &AttributeReference) -> bool {
        self.extents.remove(reference).is_some()
    }

    /// Drops every extent and replaces them with the single
    /// `(reference, record)` pair, which becomes primary.
    pub fn set_extent(&mut self, reference: AttributeReference, record: AttributeRecord) {
        debug!("Resetting attribute {} to single extent {}", self.reference(), reference);
        self.extents.clear();
        self.file = reference.file;
        self.primary_id = reference.attribute_id;
        self.extents.insert(reference, record);
    }

    /// Moves the extent at `old_ref` to `new_ref`, storing `record`
    /// there. Returns false (and changes nothing) when `old_ref` is not
    /// present. The primary follows the move when `old_ref` was primary
    /// or the map ended up empty before reinsertion.
    pub fn replace_extent(
        &mut self,
        old_ref: &AttributeReference,
        new_ref: AttributeReference,
        record: AttributeRecord,
    ) -> bool {
        if self.extents.remove(old_ref).is_none() {
            return false;
        }
        if *old_ref == self.reference() || self.extents.is_empty() {
            self.file = new_ref.file;
            self.primary_id = new_ref.attribute_id;
        }
        self.extents.insert(new_ref, record);
        true
    }

    /// The non-resident extent whose VCN range contains `target_vcn`.
    pub fn non_resident_extent(&self, target_vcn: u64) -> Result<&NonResidentAttributeRecord> {
        for record in self.extents.values() {
            match record {
                AttributeRecord::Resident(_) => return Err(VDiskError::ResidentHasNoVcn),
                AttributeRecord::NonResident(r) => {
                    if r.start_vcn <= target_vcn && target_vcn <= r.last_vcn {
                        return Ok(r);
                    }
                }
            }
        }
        Err(VDiskError::OutOfRange(target_vcn))
    }

    /// The extent holding VCN 0. A resident attribute is its own (only)
    /// first extent.
    pub fn first_extent(&self) -> Result<&AttributeRecord> {
        let mut saw_any = false;
        for record in self.extents.values() {
            saw_any = true;
            match record {
                AttributeRecord::Resident(_) => return Ok(record),
                AttributeRecord::NonResident(r) if r.start_vcn == 0 => return Ok(record),
                AttributeRecord::NonResident(_) => {}
            }
        }
        Err(VDiskError::InconsistentExtents(if saw_any {
            "no extent starts at VCN 0".to_string()
        } else {
            "attribute has no extents".to_string()
        }))
    }

    /// The extent with the highest last VCN. A resident attribute is its
    /// own last extent.
    pub fn last_extent(&self) -> Result<&AttributeRecord> {
        let mut best: Option<&AttributeRecord> = None;
        let mut best_vcn = 0u64;
        for record in self.extents.values() {
            match record {
                AttributeRecord::Resident(_) => return Ok(record),
                AttributeRecord::NonResident(r) => {
                    if best.is_none() || r.last_vcn > best_vcn {
                        best_vcn = r.last_vcn;
                        best = Some(record);
                    }
                }
            }
        }
        best.ok_or_else(|| VDiskError::InconsistentExtents("attribute has no extents".to_string()))
    }

    /// Parses the primary record's resident value according to the
    /// attribute's kind. Non-resident content must be read through
    /// [`NtfsAttribute::open`] instead.
    pub fn payload(&self) -> Result<AttributePayload> {
        match self.primary_record() {
            AttributeRecord::Resident(r) => self.kind.parse(&r.value),
            AttributeRecord::NonResident(_) => Err(VDiskError::InconsistentExtents(
                "structured payloads require a resident value".to_string(),
            )),
        }
    }

    /// Positional data buffer over the attribute content, virtualizing
    /// resident vs non-resident storage.
    pub fn data_buffer<'a, 's>(
        &'a mut self,
        access: FileAccess,
        source: Option<&'s mut dyn ClusterSource>,
    ) -> AttributeBuffer<'a, 's> {
        AttributeBuffer::new(self, access, source)
    }

    /// Opens the attribute content as a seekable byte stream.
    ///
    /// Non-resident attributes need `source` to reach their clusters;
    /// writes require `FileAccess::ReadWrite`.
    pub fn open<'a, 's>(
        &'a mut self,
        access: FileAccess,
        source: Option<&'s mut dyn ClusterSource>,
    ) -> AttributeStream<'a, 's> {
        AttributeStream::new(self.data_buffer(access, source))
    }

    /// Absolute disk position of byte `offset` of the attribute
    /// content. Non-resident attributes resolve through their own run
    /// list; resident values live inside the MFT record and resolve
    /// through the parent-file lookup handle.
    pub fn offset_to_absolute_pos(
        &self,
        offset: u64,
        lookup: &dyn RecordLookup,
        bytes_per_cluster: u64,
    ) -> Result<Option<u64>> {
        match self.primary_record() {
            AttributeRecord::NonResident(r) => {
                r.offset_to_absolute_pos(offset, 0, bytes_per_cluster)
            }
            AttributeRecord::Resident(_) => {
                let attr_start = lookup.attribute_offset(&self.reference())?;
                lookup.mft_offset_to_absolute_pos(attr_start + offset)
            }
        }
    }

    /// Human-readable dump: type header, length, a 32-byte hex preview
    /// and per-record detail. A preview that cannot be read renders as
    /// `<can't read>` instead of failing the dump.
    pub fn dump(
        &mut self,
        writer: &mut dyn Write,
        indent: &str,
        source: Option<&mut dyn ClusterSource>,
    ) -> std::io::Result<()> {
        let type_name = self.attribute_type().type_name();
        let name = self.name();
        writeln!(
            writer,
            "{}{} ATTRIBUTE ({})",
            indent,
            type_name,
            name.as_deref().unwrap_or("No Name")
        )?;
        writeln!(writer, "{}  Length: {} bytes", indent, self.data_length())?;

        let preview_len = self.data_length().min(32) as usize;
        let mut preview = vec![0u8; preview_len];
        let read_result = self
            .data_buffer(FileAccess::Read, source)
            .read_at(0, &mut preview);
        let preview = match read_result {
            Ok(_) => preview
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" "),
            Err(_) => "<can't read>".to_string(),
        };
        writeln!(writer, "{}  Data: {}", indent, preview)?;

        for record in self.extents.values() {
            record.dump(writer, &format!("{}  ", indent))?;
        }
        Ok(())
    }
}
