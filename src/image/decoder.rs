//! Decoder and orientation-metadata seams.
//!
//! The pipeline talks to the platform decoder through [`BitmapDecoder`]
//! so hosts (and tests) can substitute their own; the default is the
//! `image` crate.

use std::io::Cursor;
use std::path::Path;

use blob_error::Result;
use image::io::Reader as ImageReader;
use image::{imageops::FilterType, DynamicImage, GenericImageView};

pub enum DecodeSource<'a> {
    Path(&'a Path),
    Bytes(&'a [u8]),
}

pub trait BitmapDecoder: Send + Sync {
    /// Reads image dimensions without allocating pixel memory.
    fn decode_bounds(&self, source: DecodeSource) -> Result<(u32, u32)>;

    /// Decodes to a pixel buffer, downsampled by the integer
    /// `sample_size` factor (1 = full size). Subsampling bounds the
    /// peak allocation when a large source is headed for a small
    /// target.
    fn decode(
        &self,
        source: DecodeSource,
        sample_size: u32,
    ) -> Result<DynamicImage>;
}

/// `image`-crate backed decoder.
pub struct ImageRsDecoder;

impl BitmapDecoder for ImageRsDecoder {
    fn decode_bounds(&self, source: DecodeSource) -> Result<(u32, u32)> {
        let dimensions = match source {
            DecodeSource::Path(path) => ImageReader::open(path)?
                .with_guessed_format()?
                .into_dimensions()?,
            DecodeSource::Bytes(bytes) => {
                ImageReader::new(Cursor::new(bytes))
                    .with_guessed_format()?
                    .into_dimensions()?
            }
        };
        Ok(dimensions)
    }

    fn decode(
        &self,
        source: DecodeSource,
        sample_size: u32,
    ) -> Result<DynamicImage> {
        let image = match source {
            DecodeSource::Path(path) => {
                ImageReader::open(path)?.with_guessed_format()?.decode()?
            }
            DecodeSource::Bytes(bytes) => {
                ImageReader::new(Cursor::new(bytes))
                    .with_guessed_format()?
                    .decode()?
            }
        };
        if sample_size <= 1 {
            return Ok(image);
        }
        // The codec has no subsampled read path of its own, so shrink
        // right after decode with the cheapest filter; the caller
        // rescales to exact target dimensions afterwards.
        let (width, height) = image.dimensions();
        Ok(image.resize_exact(
            (width / sample_size).max(1),
            (height / sample_size).max(1),
            FilterType::Nearest,
        ))
    }
}

/// Reads embedded orientation metadata for file-backed images.
pub trait OrientationReader: Send + Sync {
    /// Rotation in degrees (0, 90, 180 or 270) recorded for the image
    /// at `location`.
    fn orientation(&self, location: &str) -> u32;
}

/// Default reader for content without orientation metadata.
pub struct NoOrientation;

impl OrientationReader for NoOrientation {
    fn orientation(&self, _location: &str) -> u32 {
        0
    }
}
