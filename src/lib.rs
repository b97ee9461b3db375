//! Exhume typed metadata from virtual disk images: VMDK descriptor
//! files, LDM (dynamic disk) databases and NTFS attribute structures.
//!
//! The codecs are locator-agnostic: they read their backing bytes
//! through [`locator::FileLocator`], so the same code works against a
//! host directory or a filesystem mounted from inside another image.

pub mod bytes;
pub mod error;
pub mod ldm;
pub mod locator;
pub mod ntfs;
pub mod vmdk;

pub use error::{Result, VDiskError};
