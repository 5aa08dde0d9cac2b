//! Opaque, polymorphic binary-content containers ("blobs") for a
//! mobile runtime, with a derived-image transform pipeline behind
//! them.
//!
//! A [`Blob`] abstracts over text, raw bytes, file references, decoded
//! images and base64-bound streams so subsystems can hand data around
//! without caring about the storage form. The expensive part is the
//! image subsystem: transforms decode lazily, key their results in a
//! shared LRU cache ([`image_cache::SharedBitmapCache`]) and recover
//! from allocation failure by shedding the whole cache.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bloblib::image::ImagePipeline;
//! use bloblib::{Blob, LocalFile, SharedBitmapCache};
//!
//! let cache = Arc::new(SharedBitmapCache::new("derived-images"));
//! let pipeline = ImagePipeline::new(cache);
//!
//! let photo = Blob::from_file(Box::new(LocalFile::new("photo.jpg")));
//! if let Some(thumb) = pipeline.thumbnail(&photo, 96, None, None) {
//!     println!("{} bytes", thumb.len().unwrap());
//! }
//! ```

pub mod blob;
pub mod content;
pub mod file;
pub mod image;
pub mod mime;

pub use blob::Blob;
pub use blob_error::{BlobError, Result};
pub use content::{Content, ContentKind};
pub use file::{BlobFile, LocalFile};
pub use crate::image::{CropOptions, ImagePipeline};
pub use image_cache::{Bitmap, SharedBitmapCache};
