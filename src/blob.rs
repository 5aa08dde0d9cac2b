//! The blob façade: an opaque container over text, raw bytes, file
//! references, decoded images and base64-bound streams.
//!
//! Callers construct a blob through one of the factories and use the
//! accessors without knowing which form the content takes. Image
//! transforms live in [`crate::image::ImagePipeline`]; a blob only
//! carries the probed metadata (MIME type, bounds) and, for
//! pixel-sourced content, a shared handle to the decoded bitmap.

use std::fmt;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use blob_error::{BlobError, Result};
use image::DynamicImage;
use image_cache::Bitmap;

use crate::content::{Content, ContentKind};
use crate::file::BlobFile;
use crate::image::decoder::{BitmapDecoder, DecodeSource, ImageRsDecoder};
use crate::mime;

pub struct Blob {
    content: Content,
    mime_type: String,
    /// Pixel bounds; `None` until probing succeeds, which also covers
    /// content that turned out not to be an image.
    dimensions: Option<(u32, u32)>,
}

impl Blob {
    fn new(content: Content, mime_type: impl Into<String>) -> Self {
        Self {
            content,
            mime_type: mime_type.into(),
            dimensions: None,
        }
    }

    /// Creates a text blob typed `text/plain`.
    pub fn from_string(text: impl Into<String>) -> Self {
        Self::new(Content::Text(text.into()), mime::TEXT_PLAIN)
    }

    /// Creates a file-backed blob, deriving the MIME type from the
    /// file's extension.
    pub fn from_file(file: Box<dyn BlobFile>) -> Self {
        Self::from_file_with_mime(file, None)
    }

    /// Creates a file-backed blob with an explicit MIME type, falling
    /// back to extension lookup when absent. Bounds probing runs
    /// immediately; failure to probe is not an error.
    pub fn from_file_with_mime(
        file: Box<dyn BlobFile>,
        mime_type: Option<&str>,
    ) -> Self {
        let mime_type = match mime_type {
            Some(mt) if !mt.is_empty() => mt.to_string(),
            _ => mime::from_extension(&file.location()).to_string(),
        };
        let mut blob = Self::new(Content::File(file), mime_type);
        blob.probe_bitmap_info();
        blob
    }

    /// Creates a blob from raw bytes typed `application/octet-stream`.
    /// No probing runs for the generic type.
    pub fn from_data(data: Vec<u8>) -> Self {
        Self::from_data_with_mime(data, None)
    }

    /// Creates a blob from raw bytes with the given MIME type. With an
    /// absent or empty type, the content is treated as opaque and
    /// bounds probing is skipped.
    pub fn from_data_with_mime(
        data: Vec<u8>,
        mime_type: Option<&str>,
    ) -> Self {
        match mime_type {
            None | Some("") => {
                Self::new(Content::Data(data), mime::OCTET_STREAM)
            }
            Some(mt) => {
                let mut blob = Self::new(Content::Data(data), mt);
                blob.probe_bitmap_info();
                blob
            }
        }
    }

    /// Creates a blob from a decoded pixel buffer, re-encoding it to
    /// PNG when it carries alpha and JPEG at maximum quality otherwise
    /// so byte-level operations keep working. An encode failure leaves
    /// the byte buffer empty but the pixels stay usable for transforms.
    pub fn from_pixels(image: DynamicImage) -> Self {
        Self::from_bitmap(Arc::new(Bitmap::new(image)))
    }

    /// [`from_pixels`](Self::from_pixels) over an already shared
    /// bitmap, used by the transform pipeline so the cache and the
    /// blob hold the same buffer.
    pub fn from_bitmap(pixels: Arc<Bitmap>) -> Self {
        let image = pixels.image();
        let mut data = Vec::new();
        let (mime_type, encoded) = if image.color().has_alpha() {
            (
                mime::IMAGE_PNG,
                image.write_to(
                    &mut Cursor::new(&mut data),
                    image::ImageOutputFormat::Png,
                ),
            )
        } else {
            (
                mime::IMAGE_JPEG,
                DynamicImage::ImageRgb8(image.to_rgb8()).write_to(
                    &mut Cursor::new(&mut data),
                    image::ImageOutputFormat::Jpeg(100),
                ),
            )
        };
        let mime_type = match encoded {
            Ok(()) => mime_type,
            Err(err) => {
                log::warn!("failed to re-encode pixel buffer: {}", err);
                data.clear();
                mime::IMAGE_BITMAP
            }
        };

        let dimensions = Some((pixels.width(), pixels.height()));
        Self {
            content: Content::Image { data, pixels },
            mime_type: mime_type.to_string(),
            dimensions,
        }
    }

    /// Creates a blob over a stream destined for base64 encoding. The
    /// stream is read lazily and consumed at most once.
    pub fn from_base64_stream(
        stream: Box<dyn Read + Send>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self::new(
            Content::Base64Stream(Mutex::new(Some(stream))),
            mime_type,
        )
    }

    /// Refines the MIME type by sniffing the content head and, for
    /// image-like or untyped content, queries bitmap bounds without
    /// allocating pixels. Failures leave the dimensions unset; plenty
    /// of non-image binaries pass through here.
    fn probe_bitmap_info(&mut self) {
        if let Some(head) = self.peek_head(mime::SNIFF_LEN) {
            if let Some(sniffed) = mime::sniff(&head) {
                if sniffed != self.mime_type {
                    log::debug!(
                        "refining mime type {} -> {}",
                        self.mime_type,
                        sniffed
                    );
                    self.mime_type = sniffed.to_string();
                }
            }
        }

        if !self.mime_type.is_empty()
            && !self.mime_type.starts_with("image/")
        {
            return;
        }

        let bounds = match &self.content {
            Content::File(file) => match file.resolve_concrete_path() {
                Some(path) => ImageRsDecoder
                    .decode_bounds(DecodeSource::Path(&path)),
                None => self.bytes().and_then(|bytes| {
                    ImageRsDecoder.decode_bounds(DecodeSource::Bytes(&bytes))
                }),
            },
            Content::Data(data) => {
                ImageRsDecoder.decode_bounds(DecodeSource::Bytes(data))
            }
            _ => return,
        };
        match bounds {
            Ok(dimensions) => self.dimensions = Some(dimensions),
            Err(err) => {
                log::debug!("bounds probing found no image: {}", err)
            }
        }
    }

    /// Non-destructive peek at up to `len` leading bytes.
    fn peek_head(&self, len: usize) -> Option<Vec<u8>> {
        match &self.content {
            Content::Data(data) => {
                Some(data[..data.len().min(len)].to_vec())
            }
            Content::File(file) => {
                let mut stream = file
                    .open_read()
                    .map_err(|err| {
                        log::warn!("failed to open file for sniffing: {}", err)
                    })
                    .ok()?;
                let mut head = vec![0u8; len];
                let mut filled = 0;
                // A fresh stream is dropped afterwards, so the read is
                // non-destructive from the blob's point of view.
                while filled < len {
                    match stream.read(&mut head[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(err) => {
                            log::warn!("sniffing read failed: {}", err);
                            return None;
                        }
                    }
                }
                head.truncate(filled);
                Some(head)
            }
            _ => None,
        }
    }

    /// Materializes the content as bytes. Stream-backed variants read
    /// the entire underlying stream and close it on every path.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match &self.content {
            Content::Text(text) => Ok(text.as_bytes().to_vec()),
            Content::Data(data) => Ok(data.clone()),
            Content::Image { data, .. } => Ok(data.clone()),
            Content::File(file) => {
                let mut stream = file.open_read()?;
                let mut bytes = Vec::new();
                stream.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
            Content::Base64Stream(slot) => {
                let stream = slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                match stream {
                    Some(mut stream) => {
                        let mut bytes = Vec::new();
                        stream.read_to_end(&mut bytes)?;
                        Ok(bytes)
                    }
                    None => {
                        log::warn!("base64 stream was already consumed");
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    /// Content length in bytes. O(1) for sized variants; text falls
    /// back to materializing the bytes, which is documented as
    /// expensive. Unsupported for stream content.
    pub fn len(&self) -> Result<u64> {
        match &self.content {
            Content::File(file) => file.size(),
            Content::Data(data) => Ok(data.len() as u64),
            Content::Image { data, .. } => Ok(data.len() as u64),
            Content::Base64Stream(_) => Err(BlobError::Unsupported {
                op: "length",
                kind: self.kind().label(),
            }),
            Content::Text(_) => Ok(self.bytes()?.len() as u64),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.len(), Ok(0))
    }

    /// Decodes the content as UTF-8 text. Declared binary types other
    /// than the generic octet-stream fallback yield `None`, as does
    /// any decode failure.
    pub fn text(&self) -> Option<String> {
        match &self.content {
            Content::Text(text) => Some(text.clone()),
            Content::Data(_) | Content::File(_) => {
                if mime::is_binary(&self.mime_type)
                    && self.mime_type != mime::OCTET_STREAM
                {
                    return None;
                }
                let bytes = self
                    .bytes()
                    .map_err(|err| {
                        log::warn!("unable to read bytes for text: {}", err)
                    })
                    .ok()?;
                match String::from_utf8(bytes) {
                    Ok(text) => Some(text),
                    Err(_) => {
                        log::warn!("unable to convert content to string");
                        None
                    }
                }
            }
            Content::Image { .. } | Content::Base64Stream(_) => None,
        }
    }

    /// Appends another blob's bytes in place. Only growable variants
    /// support this.
    pub fn append(&mut self, other: &Blob) -> Result<()> {
        let kind = self.kind();
        match &mut self.content {
            Content::Text(text) => {
                match String::from_utf8(other.bytes()?) {
                    Ok(addition) => text.push_str(&addition),
                    Err(err) => {
                        log::warn!("append: not valid UTF-8: {}", err)
                    }
                }
                Ok(())
            }
            Content::Data(data) => {
                data.extend(other.bytes()?);
                Ok(())
            }
            Content::Image { data, .. } => {
                data.extend(other.bytes()?);
                Ok(())
            }
            Content::File(_) | Content::Base64Stream(_) => {
                Err(BlobError::Unsupported {
                    op: "append",
                    kind: kind.label(),
                })
            }
        }
    }

    /// Base64 of the content bytes, without line wrapping.
    pub fn to_base64(&self) -> Result<String> {
        Ok(BASE64.encode(self.bytes()?))
    }

    /// A fresh read stream over the content. For stream-backed blobs
    /// this hands out the underlying stream itself (at most once).
    pub fn input_stream(&self) -> Result<Box<dyn Read + Send>> {
        match &self.content {
            Content::File(file) => match file.open_read() {
                Ok(stream) => Ok(stream),
                Err(err) => {
                    log::error!("unable to open file stream: {}", err);
                    Err(err)
                }
            },
            Content::Base64Stream(slot) => {
                let stream = slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                Ok(stream.unwrap_or_else(|| Box::new(Cursor::new(Vec::new()))))
            }
            _ => Ok(Box::new(Cursor::new(self.bytes()?))),
        }
    }

    /// Concrete location of file-backed content, with indirect
    /// references resolved to a `file://` path. `None` for every other
    /// variant.
    pub fn native_path(&self) -> Option<String> {
        match &self.content {
            Content::File(file) => {
                let location = file.location();
                if location.starts_with("content://") {
                    let path = file.resolve_concrete_path()?;
                    let path = path.display().to_string();
                    if path.starts_with('/') {
                        Some(format!("file://{}", path))
                    } else {
                        Some(path)
                    }
                } else {
                    Some(location)
                }
            }
            _ => {
                log::warn!(
                    "native_path not supported for {} content",
                    self.kind().label()
                );
                None
            }
        }
    }

    /// The backing file handle, when the blob is file-backed.
    pub fn file(&self) -> Option<&dyn BlobFile> {
        match &self.content {
            Content::File(file) => Some(file.as_ref()),
            _ => {
                log::warn!(
                    "file not supported for {} content",
                    self.kind().label()
                );
                None
            }
        }
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn kind(&self) -> ContentKind {
        self.content.kind()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Probed pixel bounds, when the content decoded as an image.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn width(&self) -> u32 {
        self.dimensions.map_or(0, |(w, _)| w)
    }

    pub fn height(&self) -> u32 {
        self.dimensions.map_or(0, |(_, h)| h)
    }

    /// The owned decoded bitmap, present only for pixel-sourced
    /// content. The handle may be shared with the cache; check
    /// [`Bitmap::is_invalidated`] before trusting the pixels.
    pub fn pixels(&self) -> Option<Arc<Bitmap>> {
        match &self.content {
            Content::Image { pixels, .. } => Some(pixels.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Blob {
    /// The text form when the content decodes as text, a fixed
    /// placeholder otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("[object Blob]"),
        }
    }
}
