//! The tagged union of content forms a blob can hold.
//!
//! A blob holds exactly one variant for its whole lifetime. The only
//! legal in-place mutations are byte append (text, data, image) and
//! MIME refinement on the owning blob; the variant identity itself
//! never changes after construction.

use std::io::Read;
use std::sync::{Arc, Mutex};

use image_cache::Bitmap;

use crate::file::BlobFile;

/// A base64-source stream is consumed at most once; `None` after the
/// first read.
pub type StreamSlot = Mutex<Option<Box<dyn Read + Send>>>;

pub enum Content {
    /// Text payload, owned.
    Text(String),
    /// Owned byte buffer.
    Data(Vec<u8>),
    /// Borrowed external file-like resource.
    File(Box<dyn BlobFile>),
    /// Decoded pixel buffer together with its re-encoded compressed
    /// bytes. Both are kept: byte-level operations need the encoded
    /// form, further transforms need the pixels.
    Image {
        data: Vec<u8>,
        pixels: Arc<Bitmap>,
    },
    /// Input stream whose bytes are destined for base64 encoding.
    Base64Stream(StreamSlot),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Data,
    File,
    Image,
    Base64Stream,
}

impl ContentKind {
    /// Short name used in logs and unsupported-operation errors.
    pub fn label(&self) -> &'static str {
        match self {
            ContentKind::Text => "string",
            ContentKind::Data => "data",
            ContentKind::File => "file",
            ContentKind::Image => "image",
            ContentKind::Base64Stream => "base64-stream",
        }
    }
}

impl Content {
    pub fn kind(&self) -> ContentKind {
        match self {
            Content::Text(_) => ContentKind::Text,
            Content::Data(_) => ContentKind::Data,
            Content::File(_) => ContentKind::File,
            Content::Image { .. } => ContentKind::Image,
            Content::Base64Stream(_) => ContentKind::Base64Stream,
        }
    }
}
