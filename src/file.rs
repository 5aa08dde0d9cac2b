//! File-like resources a blob can borrow.
//!
//! The blob core never walks the filesystem itself; it consumes
//! file-backed content through this narrow interface so the host can
//! plug in whatever storage abstraction it has (plain files,
//! content-addressed references, asset bundles).

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use blob_error::Result;

/// A readable, sized, locatable resource backing a file blob.
pub trait BlobFile: Send + Sync {
    /// Opens a fresh read stream over the resource.
    fn open_read(&self) -> Result<Box<dyn Read + Send>>;

    /// Size in bytes, without reading the content.
    fn size(&self) -> Result<u64>;

    /// Stable location identifier. This is what keys derived images in
    /// the cache, so it must be durable across calls; it may be an
    /// indirect reference (e.g. a `content://` URI) rather than a
    /// filesystem path.
    fn location(&self) -> String;

    /// Materializes an indirect reference to a concrete filesystem
    /// path, when the platform requires one. Returns `None` when no
    /// such path exists.
    fn resolve_concrete_path(&self) -> Option<PathBuf>;
}

/// Plain local-storage file.
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl BlobFile for LocalFile {
    fn open_read(&self) -> Result<Box<dyn Read + Send>> {
        let file = fs::File::open(&self.path)?;
        Ok(Box::new(file))
    }

    fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn resolve_concrete_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}
