//! Uniform capability for resolving and opening named streams.
//!
//! The descriptor and database codecs in this crate never touch the
//! filesystem directly. They go through a [`FileLocator`], so the same
//! code reads its backing bytes from a host directory or from a
//! filesystem mounted inside a virtual disk.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::bytes::ByteStream;
use crate::error::{Result, VDiskError};

/// How an open resolves against an existing (or missing) file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// The file must already exist.
    Open,
    /// The file is created, truncating any existing content.
    Create,
    /// Open if present, create otherwise.
    OpenOrCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    ReadWrite,
}

/// Sharing requested by the opener. Advisory on the host variant: the
/// host OS may or may not enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileShare {
    None,
    Read,
}

/// Capability for resolving relative names into byte streams.
///
/// Locators are immutable and compose by path join; they never own the
/// filesystem object backing them.
pub trait FileLocator {
    fn exists(&self, name: &str) -> bool;

    fn open(
        &self,
        name: &str,
        mode: FileMode,
        access: FileAccess,
        share: FileShare,
    ) -> Result<Box<dyn ByteStream>>;

    /// A locator rooted at `path` joined onto this locator's root.
    fn relative(&self, path: &str) -> Box<dyn FileLocator>;
}

/// Platform-neutral `/`-separated join. Consecutive separators collapse
/// and empty segments are dropped.
pub fn join_paths(base: &str, rel: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(rel.split('/')) {
        if !segment.is_empty() {
            parts.push(segment);
        }
    }
    parts.join("/")
}

/// Locator rooted at a directory on the host filesystem.
pub struct HostFileLocator {
    dir: String,
}

impl HostFileLocator {
    pub fn new(dir: &str) -> Self {
        HostFileLocator {
            dir: dir.to_string(),
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        PathBuf::from(join_paths(&self.dir, name))
    }
}

impl FileLocator for HostFileLocator {
    fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }

    fn open(
        &self,
        name: &str,
        mode: FileMode,
        access: FileAccess,
        _share: FileShare,
    ) -> Result<Box<dyn ByteStream>> {
        let path = self.resolve(name);
        debug!("Opening host file {:?} ({:?}, {:?})", path, mode, access);

        if mode == FileMode::Open && !path.is_file() {
            return Err(VDiskError::NotFound(path.display().to_string()));
        }

        let mut options = OpenOptions::new();
        options.read(true);
        if access == FileAccess::ReadWrite {
            options.write(true);
        }
        match mode {
            FileMode::Open => {}
            FileMode::Create => {
                options.create(true).truncate(true);
            }
            FileMode::OpenOrCreate => {
                options.create(true);
            }
        }

        let file = options.open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VDiskError::NotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                VDiskError::AccessDenied(path.display().to_string())
            }
            _ => VDiskError::Io(e),
        })?;
        Ok(Box::new(file))
    }

    fn relative(&self, path: &str) -> Box<dyn FileLocator> {
        Box::new(HostFileLocator {
            dir: join_paths(&self.dir, path),
        })
    }
}

/// The minimal surface an in-image filesystem exposes to locators.
///
/// The filesystem object is shared between every locator referencing it
/// and outlives them all.
pub trait DiscFileSystem {
    fn file_exists(&self, path: &str) -> bool;

    fn open_file(
        &self,
        path: &str,
        mode: FileMode,
        access: FileAccess,
    ) -> Result<Box<dyn ByteStream>>;
}

/// Locator rooted at a path inside a mounted virtual-disk filesystem.
pub struct DiscFileLocator {
    fs: Arc<dyn DiscFileSystem>,
    base: String,
}

impl DiscFileLocator {
    pub fn new(fs: Arc<dyn DiscFileSystem>, base: &str) -> Self {
        DiscFileLocator {
            fs,
            base: base.to_string(),
        }
    }
}

impl FileLocator for DiscFileLocator {
    fn exists(&self, name: &str) -> bool {
        self.fs.file_exists(&join_paths(&self.base, name))
    }

    fn open(
        &self,
        name: &str,
        mode: FileMode,
        access: FileAccess,
        _share: FileShare,
    ) -> Result<Box<dyn ByteStream>> {
        let path = join_paths(&self.base, name);
        debug!("Opening in-disc file '{}' ({:?}, {:?})", path, mode, access);
        if mode == FileMode::Open && !self.fs.file_exists(&path) {
            return Err(VDiskError::NotFound(path));
        }
        self.fs.open_file(&path, mode, access)
    }

    fn relative(&self, path: &str) -> Box<dyn FileLocator> {
        Box::new(DiscFileLocator {
            fs: Arc::clone(&self.fs),
            base: join_paths(&self.base, path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::MemoryStream;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn test_join_collapses_separators() {
        assert_eq!(join_paths("a//b", "c"), "a/b/c");
        assert_eq!(join_paths("", "x/y"), "x/y");
        assert_eq!(join_paths("base/", "/sub//f.vmdk"), "base/sub/f.vmdk");
    }

    /// Flat in-memory filesystem standing in for a mounted volume.
    struct FakeFs {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FakeFs {
        fn with(entries: &[(&str, &[u8])]) -> Arc<Self> {
            let mut files = HashMap::new();
            for (name, data) in entries {
                files.insert(name.to_string(), data.to_vec());
            }
            Arc::new(FakeFs {
                files: Mutex::new(files),
            })
        }
    }

    impl DiscFileSystem for FakeFs {
        fn file_exists(&self, path: &str) -> bool {
            self.files.lock().unwrap().contains_key(path)
        }

        fn open_file(
            &self,
            path: &str,
            mode: FileMode,
            _access: FileAccess,
        ) -> Result<Box<dyn ByteStream>> {
            let files = self.files.lock().unwrap();
            match files.get(path) {
                Some(data) => Ok(Box::new(MemoryStream::from_bytes(data.clone()))),
                None if mode == FileMode::Open => Err(VDiskError::NotFound(path.to_string())),
                None => Ok(Box::new(MemoryStream::new())),
            }
        }
    }

    #[test]
    fn test_disc_locator_resolves_relative_chain() {
        use std::io::Read;

        let fs = FakeFs::with(&[("vms/disks/disk-s001.vmdk", b"grain data")]);
        let root = DiscFileLocator::new(fs, "");

        // relative(a).relative(b).open(n) opens the same bytes as
        // relative(join(a, b)).open(n).
        let chained = root.relative("vms").relative("disks");
        let joined = root.relative("vms/disks");

        let mut via_chain = Vec::new();
        chained
            .open(
                "disk-s001.vmdk",
                FileMode::Open,
                FileAccess::Read,
                FileShare::Read,
            )
            .unwrap()
            .read_to_end(&mut via_chain)
            .unwrap();

        let mut via_join = Vec::new();
        joined
            .open(
                "disk-s001.vmdk",
                FileMode::Open,
                FileAccess::Read,
                FileShare::Read,
            )
            .unwrap()
            .read_to_end(&mut via_join)
            .unwrap();

        assert_eq!(via_chain, via_join);
        assert_eq!(via_chain, b"grain data");
    }

    #[test]
    fn test_disc_locator_missing_file_is_not_found() {
        let fs = FakeFs::with(&[]);
        let locator = DiscFileLocator::new(fs, "vms");
        assert!(!locator.exists("gone.vmdk"));
        let result = locator.open(
            "gone.vmdk",
            FileMode::Open,
            FileAccess::Read,
            FileShare::Read,
        );
        assert!(matches!(result, Err(VDiskError::NotFound(_))));
    }
}
