//! Byte-addressable access to attribute content.
//!
//! [`AttributeBuffer`] virtualizes where the bytes live: resident values
//! are served from the record itself, non-resident content is fetched
//! run by run from a [`ClusterSource`]. Sparse runs and the region past
//! the initialized size read as zeros; reads at or past the data length
//! see end-of-stream.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::bytes::ByteStream;
use crate::error::{Result, VDiskError};
use crate::locator::FileAccess;

use super::attribute::NtfsAttribute;
use super::records::AttributeRecord;

/// Positional cluster-granular I/O on the volume holding a non-resident
/// attribute. `bytes_per_cluster` fixes the unit the run list is
/// expressed in.
pub trait ClusterSource {
    fn bytes_per_cluster(&self) -> u64;

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()>;
}

fn no_source() -> VDiskError {
    VDiskError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "non-resident attribute content requires a cluster source",
    ))
}

/// Sparse positional buffer over one attribute's content.
pub struct AttributeBuffer<'a, 's> {
    attr: &'a mut NtfsAttribute,
    access: FileAccess,
    source: Option<&'s mut dyn ClusterSource>,
}

impl<'a, 's> AttributeBuffer<'a, 's> {
    pub(super) fn new(
        attr: &'a mut NtfsAttribute,
        access: FileAccess,
        source: Option<&'s mut dyn ClusterSource>,
    ) -> Self {
        AttributeBuffer {
            attr,
            access,
            source,
        }
    }

    pub fn len(&self) -> u64 {
        self.attr.data_length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compression unit of the content, from the first extent. Zero for
    /// resident and uncompressed attributes.
    pub fn compression_unit(&self) -> u16 {
        self.attr.compression_unit()
    }

    /// Reads up to `buf.len()` bytes at `pos`, returning the number
    /// filled. Zero means end-of-stream.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.len();
        if pos >= len || buf.is_empty() {
            return Ok(0);
        }
        let count = buf.len().min((len - pos) as usize);

        let initialized = match self.attr.primary_record() {
            AttributeRecord::Resident(r) => {
                buf[..count].copy_from_slice(&r.value[pos as usize..pos as usize + count]);
                return Ok(count);
            }
            AttributeRecord::NonResident(r) => r.initialized_size,
        };
        self.read_non_resident(pos, &mut buf[..count], initialized)?;
        Ok(count)
    }

    fn read_non_resident(&mut self, pos: u64, buf: &mut [u8], initialized: u64) -> Result<()> {
        let bpc = self
            .source
            .as_ref()
            .map(|s| s.bytes_per_cluster())
            .unwrap_or(0);
        let mut done = 0usize;

        while done < buf.len() {
            let byte_pos = pos + done as u64;

            // Everything past the initialized size reads as zeros.
            if byte_pos >= initialized {
                for b in &mut buf[done..] {
                    *b = 0;
                }
                return Ok(());
            }

            if bpc == 0 {
                return Err(no_source());
            }

            let vcn = byte_pos / bpc;
            let extent = self.attr.non_resident_extent(vcn)?;
            let pos_in_extent = byte_pos - extent.start_vcn * bpc;

            // Locate the run covering this position within the extent.
            let mut run_start = 0u64;
            let mut advanced = None;
            for run in extent.clusters() {
                let run_bytes = run.length * bpc;
                if pos_in_extent < run_start + run_bytes {
                    let off_in_run = pos_in_extent - run_start;
                    let avail = (run_bytes - off_in_run) as usize;
                    let chunk = avail
                        .min(buf.len() - done)
                        .min((initialized - byte_pos) as usize);
                    match run.lcn {
                        None => {
                            // Sparse run: zero fill.
                            for b in &mut buf[done..done + chunk] {
                                *b = 0;
                            }
                        }
                        Some(lcn) => {
                            let source = self.source.as_mut().ok_or_else(no_source)?;
                            source.read_at(lcn * bpc + off_in_run, &mut buf[done..done + chunk])?;
                        }
                    }
                    advanced = Some(chunk);
                    break;
                }
                run_start += run_bytes;
            }

            match advanced {
                Some(chunk) => done += chunk,
                None => {
                    return Err(VDiskError::InconsistentExtents(format!(
                        "run list of extent at VCN {} shorter than its range",
                        extent.start_vcn
                    )))
                }
            }
        }
        Ok(())
    }

    /// Writes `buf` at `pos`. Resident values grow as needed;
    /// non-resident writes land in already-allocated runs.
    pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        if self.access != FileAccess::ReadWrite {
            return Err(VDiskError::AccessDenied(
                "attribute opened read-only".to_string(),
            ));
        }
        if buf.is_empty() {
            return Ok(());
        }

        if let AttributeRecord::Resident(record) = self.attr.primary_record_mut() {
            let end = pos as usize + buf.len();
            if record.value.len() < end {
                record.value.resize(end, 0);
            }
            record.value[pos as usize..end].copy_from_slice(buf);
            return Ok(());
        }

        if pos + buf.len() as u64 > self.attr.data_length() {
            return Err(VDiskError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "extending a non-resident attribute requires extent allocation",
            )));
        }
        self.write_non_resident(pos, buf)
    }

    fn write_non_resident(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        let bpc = self
            .source
            .as_ref()
            .map(|s| s.bytes_per_cluster())
            .ok_or_else(no_source)?;
        let mut done = 0usize;

        while done < buf.len() {
            let byte_pos = pos + done as u64;
            let vcn = byte_pos / bpc;
            let extent = self.attr.non_resident_extent(vcn)?;
            let pos_in_extent = byte_pos - extent.start_vcn * bpc;

            let mut run_start = 0u64;
            let mut advanced = None;
            for run in extent.clusters() {
                let run_bytes = run.length * bpc;
                if pos_in_extent < run_start + run_bytes {
                    let off_in_run = pos_in_extent - run_start;
                    let chunk = ((run_bytes - off_in_run) as usize).min(buf.len() - done);
                    let lcn = run.lcn.ok_or_else(|| {
                        VDiskError::Io(io::Error::new(
                            io::ErrorKind::Unsupported,
                            "writing into a sparse run requires extent allocation",
                        ))
                    })?;
                    let source = self.source.as_mut().ok_or_else(no_source)?;
                    source.write_at(lcn * bpc + off_in_run, &buf[done..done + chunk])?;
                    advanced = Some(chunk);
                    break;
                }
                run_start += run_bytes;
            }

            match advanced {
                Some(chunk) => done += chunk,
                None => {
                    return Err(VDiskError::InconsistentExtents(format!(
                        "run list of extent at VCN {} shorter than its range",
                        extent.start_vcn
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Seekable stream over an [`AttributeBuffer`].
pub struct AttributeStream<'a, 's> {
    buffer: AttributeBuffer<'a, 's>,
    position: u64,
}

impl<'a, 's> AttributeStream<'a, 's> {
    pub(super) fn new(buffer: AttributeBuffer<'a, 's>) -> Self {
        AttributeStream {
            buffer,
            position: 0,
        }
    }
}

fn to_io(err: VDiskError) -> io::Error {
    match err {
        VDiskError::Io(inner) => inner,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

impl Read for AttributeStream<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.buffer.read_at(self.position, buf).map_err(to_io)?;
        self.position += count as u64;
        Ok(count)
    }
}

impl Write for AttributeStream<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write_at(self.position, buf).map_err(to_io)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for AttributeStream<'_, '_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos: i64 = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.buffer.len() as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid seek to a negative position",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl ByteStream for AttributeStream<'_, '_> {
    fn stream_len(&mut self) -> io::Result<u64> {
        Ok(self.buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::super::records::{AttributeRecord, ClusterRun};
    use super::super::{AttributeType, FileRecordReference, NtfsAttribute};
    use super::*;

    /// Cluster source over a flat in-memory volume image.
    struct MemoryVolume {
        bytes_per_cluster: u64,
        data: Vec<u8>,
    }

    impl MemoryVolume {
        fn new(clusters: usize, bytes_per_cluster: u64) -> Self {
            MemoryVolume {
                bytes_per_cluster,
                data: vec![0u8; clusters * bytes_per_cluster as usize],
            }
        }

        fn fill_cluster(&mut self, lcn: u64, value: u8) {
            let bpc = self.bytes_per_cluster as usize;
            let start = lcn as usize * bpc;
            self.data[start..start + bpc].fill(value);
        }
    }

    impl ClusterSource for MemoryVolume {
        fn bytes_per_cluster(&self) -> u64 {
            self.bytes_per_cluster
        }

        fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
            let start = pos as usize;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(())
        }

        fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
            let start = pos as usize;
            self.data[start..start + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    const BPC: u64 = 512;

    fn file_ref() -> FileRecordReference {
        FileRecordReference::new(30, 1)
    }

    #[test]
    fn test_resident_read_and_eof() {
        let mut attr = NtfsAttribute::from_record(
            file_ref(),
            AttributeRecord::new_resident(AttributeType::Data, 1, None, 0, b"resident!".to_vec()),
        );
        let mut stream = attr.open(FileAccess::Read, None);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"resident!");

        // Past the data length reads end-of-stream.
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_resident_write_requires_write_access() {
        let mut attr = NtfsAttribute::from_record(
            file_ref(),
            AttributeRecord::new_resident(AttributeType::Data, 1, None, 0, vec![0; 4]),
        );
        let mut stream = attr.open(FileAccess::Read, None);
        assert!(stream.write_all(b"x").is_err());

        let mut stream = attr.open(FileAccess::ReadWrite, None);
        stream.write_all(b"grown beyond").unwrap();
        drop(stream);
        assert_eq!(attr.data_length(), 12);
    }

    #[test]
    fn test_non_resident_read_spans_runs() {
        let mut volume = MemoryVolume::new(32, BPC);
        volume.fill_cluster(10, 0x11);
        volume.fill_cluster(11, 0x22);
        volume.fill_cluster(20, 0x33);

        let record = AttributeRecord::new_non_resident(
            AttributeType::Data,
            1,
            None,
            0,
            2,
            3 * BPC,
            vec![
                ClusterRun {
                    lcn: Some(10),
                    length: 2,
                },
                ClusterRun {
                    lcn: Some(20),
                    length: 1,
                },
            ],
        );
        let mut attr = NtfsAttribute::from_record(file_ref(), record);
        let mut stream = attr.open(FileAccess::Read, Some(&mut volume));

        let mut out = vec![0u8; 3 * BPC as usize];
        stream.read_exact(&mut out).unwrap();
        assert!(out[..BPC as usize].iter().all(|&b| b == 0x11));
        assert!(out[BPC as usize..2 * BPC as usize].iter().all(|&b| b == 0x22));
        assert!(out[2 * BPC as usize..].iter().all(|&b| b == 0x33));
    }

    #[test]
    fn test_non_resident_sparse_reads_zero() {
        let mut volume = MemoryVolume::new(32, BPC);
        volume.fill_cluster(5, 0xEE);

        let record = AttributeRecord::new_non_resident(
            AttributeType::Data,
            1,
            None,
            0,
            3,
            4 * BPC,
            vec![
                ClusterRun {
                    lcn: Some(5),
                    length: 1,
                },
                ClusterRun {
                    lcn: None,
                    length: 3,
                },
            ],
        );
        let mut attr = NtfsAttribute::from_record(file_ref(), record);
        let mut buffer = attr.data_buffer(FileAccess::Read, Some(&mut volume));

        let mut out = vec![0xFFu8; 2 * BPC as usize];
        let n = buffer.read_at(0, &mut out).unwrap();
        assert_eq!(n, 2 * BPC as usize);
        assert!(out[..BPC as usize].iter().all(|&b| b == 0xEE));
        assert!(out[BPC as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_across_extents() {
        let mut volume = MemoryVolume::new(64, BPC);
        volume.fill_cluster(10, 0xAA);
        volume.fill_cluster(40, 0xBB);

        let first = AttributeRecord::new_non_resident(
            AttributeType::Data,
            2,
            None,
            0,
            0,
            2 * BPC,
            vec![ClusterRun {
                lcn: Some(10),
                length: 1,
            }],
        );
        let mut attr = NtfsAttribute::from_record(file_ref(), first);
        attr.add_extent(
            super::super::AttributeReference::new(FileRecordReference::new(31, 1), 7),
            AttributeRecord::new_non_resident(
                AttributeType::Data,
                7,
                None,
                1,
                1,
                2 * BPC,
                vec![ClusterRun {
                    lcn: Some(40),
                    length: 1,
                }],
            ),
        )
        .unwrap();

        let mut buffer = attr.data_buffer(FileAccess::Read, Some(&mut volume));
        let mut out = vec![0u8; 2 * BPC as usize];
        assert_eq!(buffer.read_at(0, &mut out).unwrap(), out.len());
        assert!(out[..BPC as usize].iter().all(|&b| b == 0xAA));
        assert!(out[BPC as usize..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn test_non_resident_write_round_trip() {
        let mut volume = MemoryVolume::new(32, BPC);
        let record = AttributeRecord::new_non_resident(
            AttributeType::Data,
            1,
            None,
            0,
            1,
            2 * BPC,
            vec![ClusterRun {
                lcn: Some(3),
                length: 2,
            }],
        );
        let mut attr = NtfsAttribute::from_record(file_ref(), record);

        {
            let mut stream = attr.open(FileAccess::ReadWrite, Some(&mut volume));
            stream.seek(SeekFrom::Start(100)).unwrap();
            stream.write_all(b"payload").unwrap();
        }
        {
            let mut stream = attr.open(FileAccess::Read, Some(&mut volume));
            stream.seek(SeekFrom::Start(100)).unwrap();
            let mut out = [0u8; 7];
            stream.read_exact(&mut out).unwrap();
            assert_eq!(&out, b"payload");
        }
    }

    #[test]
    fn test_non_resident_write_cannot_extend() {
        let mut volume = MemoryVolume::new(8, BPC);
        let record = AttributeRecord::new_non_resident(
            AttributeType::Data,
            1,
            None,
            0,
            0,
            BPC,
            vec![ClusterRun {
                lcn: Some(2),
                length: 1,
            }],
        );
        let mut attr = NtfsAttribute::from_record(file_ref(), record);
        let mut buffer = attr.data_buffer(FileAccess::ReadWrite, Some(&mut volume));
        assert!(buffer.write_at(BPC - 2, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_initialized_size_tail_reads_zero() {
        let mut volume = MemoryVolume::new(8, BPC);
        volume.fill_cluster(4, 0x77);

        let mut record = AttributeRecord::new_non_resident(
            AttributeType::Data,
            1,
            None,
            0,
            0,
            BPC,
            vec![ClusterRun {
                lcn: Some(4),
                length: 1,
            }],
        );
        if let AttributeRecord::NonResident(r) = &mut record {
            r.initialized_size = 64;
        }
        let mut attr = NtfsAttribute::from_record(file_ref(), record);
        let mut buffer = attr.data_buffer(FileAccess::Read, Some(&mut volume));

        let mut out = vec![0xFFu8; BPC as usize];
        assert_eq!(buffer.read_at(0, &mut out).unwrap(), BPC as usize);
        assert!(out[..64].iter().all(|&b| b == 0x77));
        assert!(out[64..].iter().all(|&b| b == 0));
    }
}
