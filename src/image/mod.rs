//! The derived-image transform pipeline.
//!
//! Orchestrates the expensive path shared by every image operation:
//! obtain or decode the source bitmap, consult the shared cache under
//! a deterministic transform-identity key, compute the transform if
//! absent, store the result, and wrap it as a new blob.
//!
//! One pipeline instance is constructed by the hosting application
//! with the process-wide cache and is shared by every blob operation;
//! there is no hidden global.

pub mod decoder;
pub mod ops;

use std::sync::Arc;

use blob_error::{BlobError, Result};
use image::{DynamicImage, GenericImageView};
use image_cache::{Bitmap, SharedBitmapCache};

use crate::blob::Blob;
use crate::content::Content;
use decoder::{
    BitmapDecoder, DecodeSource, ImageRsDecoder, NoOrientation,
    OrientationReader,
};

/// Crop rectangle; every field falls back the way the host API does:
/// width/height to the source dimensions, x/y to centering the crop
/// box.
#[derive(Default, Clone, Copy, Debug)]
pub struct CropOptions {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

pub struct ImagePipeline {
    cache: Arc<SharedBitmapCache>,
    decoder: Box<dyn BitmapDecoder>,
    orientation: Box<dyn OrientationReader>,
}

impl ImagePipeline {
    /// Creates a pipeline over the shared cache with the default
    /// decoder and no orientation metadata source.
    pub fn new(cache: Arc<SharedBitmapCache>) -> Self {
        Self::with_collaborators(
            cache,
            Box::new(ImageRsDecoder),
            Box::new(NoOrientation),
        )
    }

    /// Creates a pipeline with explicit collaborators. Hosts use this
    /// to plug in a platform decoder or an EXIF reader.
    pub fn with_collaborators(
        cache: Arc<SharedBitmapCache>,
        decoder: Box<dyn BitmapDecoder>,
        orientation: Box<dyn OrientationReader>,
    ) -> Self {
        Self {
            cache,
            decoder,
            orientation,
        }
    }

    pub fn cache(&self) -> &SharedBitmapCache {
        &self.cache
    }

    /// Stable identity used to key derived images. Only file-backed
    /// content has one; everything else bypasses the cache.
    fn stable_location(&self, blob: &Blob) -> Option<String> {
        match blob.content() {
            Content::File(file) => Some(file.location()),
            _ => None,
        }
    }

    /// Orientation rotation to compose into transforms. Only
    /// file-backed content carries metadata; bitmap-sourced content is
    /// always upright.
    fn rotation_for(&self, blob: &Blob) -> u32 {
        match self.stable_location(blob) {
            Some(location) => self.orientation.orientation(&location),
            None => 0,
        }
    }

    /// Returns the blob's decoded source bitmap, decoding at most once.
    ///
    /// A blob that already owns pixels is never re-decoded. A blob
    /// whose bounds probing found no image yields `None`; that is an
    /// expected caller mistake, not an error.
    pub fn resolve_bitmap(&self, blob: &Blob) -> Option<Arc<Bitmap>> {
        self.resolve_bitmap_sampled(blob, 1)
    }

    fn resolve_bitmap_sampled(
        &self,
        blob: &Blob,
        sample_size: u32,
    ) -> Option<Arc<Bitmap>> {
        if let Some(pixels) = blob.pixels() {
            return Some(pixels);
        }
        if blob.dimensions().is_none() {
            log::debug!(
                "resolve: {} content has no decodable image",
                blob.kind().label()
            );
            return None;
        }

        // The subsampling factor is the only decode option that
        // changes the produced pixels, so it is the only thing keyed
        // next to the location.
        let key = self
            .stable_location(blob)
            .map(|location| format!("{}_{}", location, sample_size));
        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key) {
                return Some(hit);
            }
        }

        let decoded = match blob.content() {
            Content::File(file) => match file.resolve_concrete_path() {
                Some(path) => self
                    .decoder
                    .decode(DecodeSource::Path(&path), sample_size),
                None => blob.bytes().and_then(|bytes| {
                    self.decoder
                        .decode(DecodeSource::Bytes(&bytes), sample_size)
                }),
            },
            Content::Data(data) => self
                .decoder
                .decode(DecodeSource::Bytes(data), sample_size),
            _ => {
                log::warn!(
                    "resolve: cannot decode {} content",
                    blob.kind().label()
                );
                return None;
            }
        };

        match decoded {
            Ok(image) => {
                let bitmap = Arc::new(Bitmap::new(image));
                if let Some(key) = key {
                    self.cache.put(key, bitmap.clone());
                }
                Some(bitmap)
            }
            Err(err) => {
                self.recover(&err, "decode");
                None
            }
        }
    }

    /// Crops to the given rectangle, composing orientation rotation.
    /// Returns `None` when the blob holds no decodable image or the
    /// rectangle falls outside the source.
    pub fn crop(&self, blob: &Blob, options: CropOptions) -> Option<Blob> {
        let source = self.resolve_bitmap(blob)?;
        let rotation = self.rotation_for(blob);

        let width = options.width.unwrap_or(blob.width());
        let height = options.height.unwrap_or(blob.height());
        let x = options
            .x
            .unwrap_or((blob.width() as i32 - width as i32) / 2);
        let y = options
            .y
            .unwrap_or((blob.height() as i32 - height as i32) / 2);

        let key = self.stable_location(blob).map(|location| {
            format!(
                "{}_crop_{}_{}_{}_{}_{}",
                location, rotation, width, height, x, y
            )
        });
        if let Some(hit) = key.as_ref().and_then(|k| self.cache.get(k)) {
            return Some(Blob::from_bitmap(hit));
        }

        let image = source.image();
        let (src_width, src_height) = image.dimensions();
        if x < 0
            || y < 0
            || width == 0
            || height == 0
            || x as u32 + width > src_width
            || y as u32 + height > src_height
        {
            log::error!(
                "crop: rectangle {}x{}+{}+{} outside {}x{} source",
                width,
                height,
                x,
                y,
                src_width,
                src_height
            );
            return None;
        }

        let result = ops::rotate(
            &image.crop_imm(x as u32, y as u32, width, height),
            rotation,
        );
        self.finish(key, result, "crop")
    }

    /// Scales to exact target dimensions. File- and byte-backed
    /// sources shrinking on both axes are decoded with a power-of-two
    /// subsampling factor first to bound peak decode memory.
    pub fn resize(
        &self,
        blob: &Blob,
        target_width: u32,
        target_height: u32,
    ) -> Option<Blob> {
        if target_width == 0 || target_height == 0 {
            log::error!("resize: zero target dimension");
            return None;
        }

        let scale_down = blob.pixels().is_none()
            && target_width < blob.width()
            && target_height < blob.height();
        let sample_size = if scale_down {
            sample_size_for(
                blob.width(),
                blob.height(),
                target_width,
                target_height,
            )
        } else {
            1
        };

        let source = self.resolve_bitmap_sampled(blob, sample_size)?;
        let rotation = self.rotation_for(blob);

        let key = self.stable_location(blob).map(|location| {
            format!(
                "{}_resize_{}_{}_{}",
                location, rotation, target_width, target_height
            )
        });
        if let Some(hit) = key.as_ref().and_then(|k| self.cache.get(k)) {
            return Some(Blob::from_bitmap(hit));
        }

        let scaled = source.image().resize_exact(
            target_width,
            target_height,
            image::imageops::FilterType::Triangle,
        );
        let result = ops::rotate(&scaled, rotation);
        self.finish(key, result, "resize")
    }

    /// Re-encodes as JPEG at the given quality in `[0, 1]` (default
    /// 1.0). Never cached: the output is a byte buffer, not a derived
    /// bitmap.
    pub fn compress(&self, blob: &Blob, quality: Option<f32>) -> Option<Blob> {
        let source = self.resolve_bitmap(blob)?;
        let quality = quality.unwrap_or(1.0).clamp(0.0, 1.0);

        let encoded =
            encode_jpeg(source.image(), (quality * 100.0).round() as u8);
        // The source handle is released after encoding either way.
        drop(source);

        match encoded {
            Ok(data) => {
                Some(Blob::from_data_with_mime(data, Some(crate::mime::IMAGE_JPEG)))
            }
            Err(err) => {
                self.recover(&err, "compress");
                None
            }
        }
    }

    /// Extracts a square thumbnail, optionally with border and rounded
    /// corners (border defaults to 1, radius to 0).
    pub fn thumbnail(
        &self,
        blob: &Blob,
        size: u32,
        border: Option<f32>,
        radius: Option<f32>,
    ) -> Option<Blob> {
        let source = self.resolve_bitmap(blob)?;
        let rotation = self.rotation_for(blob);
        let border = border.unwrap_or(1.0);
        let radius = radius.unwrap_or(0.0);

        let key = self.stable_location(blob).map(|location| {
            format!(
                "{}_thumbnail_{}_{}_{}_{}",
                location, rotation, size, border, radius
            )
        });
        if let Some(hit) = key.as_ref().and_then(|k| self.cache.get(k)) {
            return Some(Blob::from_bitmap(hit));
        }

        let thumb = ops::thumbnail(source.image(), size);
        let decorated = if border == 0.0 && radius == 0.0 {
            thumb
        } else {
            // The intermediate square is dropped here; only the
            // decorated result survives.
            ops::rounded_corner(&thumb, radius, border)
        };
        let result = ops::rotate(&decorated, rotation);
        self.finish(key, result, "thumbnail")
    }

    /// Normalizes to a pixel format carrying an alpha channel.
    pub fn with_alpha(&self, blob: &Blob) -> Option<Blob> {
        let source = self.resolve_bitmap(blob)?;
        let rotation = self.rotation_for(blob);

        let key = self
            .stable_location(blob)
            .map(|location| format!("{}_with_alpha_{}", location, rotation));
        if let Some(hit) = key.as_ref().and_then(|k| self.cache.get(k)) {
            return Some(Blob::from_bitmap(hit));
        }

        let result =
            ops::rotate(&ops::with_alpha(source.image()), rotation);
        self.finish(key, result, "with_alpha")
    }

    /// Draws a border and rounds the corners to `radius` (border
    /// defaults to 1).
    pub fn with_rounded_corner(
        &self,
        blob: &Blob,
        radius: f32,
        border: Option<f32>,
    ) -> Option<Blob> {
        let source = self.resolve_bitmap(blob)?;
        let rotation = self.rotation_for(blob);
        let border = border.unwrap_or(1.0);

        let key = self.stable_location(blob).map(|location| {
            format!(
                "{}_rounded_corner_{}_{}_{}",
                location, rotation, border, radius
            )
        });
        if let Some(hit) = key.as_ref().and_then(|k| self.cache.get(k)) {
            return Some(Blob::from_bitmap(hit));
        }

        let result = ops::rotate(
            &ops::rounded_corner(source.image(), radius, border),
            rotation,
        );
        self.finish(key, result, "with_rounded_corner")
    }

    /// Pads the image with a transparent border of `size` pixels.
    pub fn with_transparent_border(
        &self,
        blob: &Blob,
        size: u32,
    ) -> Option<Blob> {
        let source = self.resolve_bitmap(blob)?;
        let rotation = self.rotation_for(blob);

        let key = self.stable_location(blob).map(|location| {
            format!(
                "{}_transparent_border_{}_{}",
                location, rotation, size
            )
        });
        if let Some(hit) = key.as_ref().and_then(|k| self.cache.get(k)) {
            return Some(Blob::from_bitmap(hit));
        }

        let result = ops::rotate(
            &ops::transparent_border(source.image(), size),
            rotation,
        );
        self.finish(key, result, "with_transparent_border")
    }

    /// Shared tail of every cached transform: store under the key when
    /// one was computed, wrap as a blob.
    fn finish(
        &self,
        key: Option<String>,
        result: DynamicImage,
        operation: &str,
    ) -> Option<Blob> {
        let bitmap = Arc::new(Bitmap::new(result));
        if let Some(key) = key {
            self.cache.put(key, bitmap.clone());
        } else {
            log::debug!(
                "{}: content has no stable location, result not cached",
                operation
            );
        }
        Some(Blob::from_bitmap(bitmap))
    }

    /// Allocation failures clear the whole cache so the retrying
    /// caller starts from maximum headroom; everything else is just
    /// logged.
    fn recover(&self, err: &BlobError, operation: &str) {
        if err.is_out_of_memory() {
            self.cache.evict_all();
            log::error!("{}: not enough memory: {}", operation, err);
        } else {
            log::error!("{}: {}", operation, err);
        }
    }
}

/// Largest power of two not exceeding the source/target ratio on the
/// more constrained axis.
fn sample_size_for(
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
) -> u32 {
    let mut target_scale =
        (src_width / dst_width).min(src_height / dst_height);
    let mut sample_size = 1;
    while target_scale >= 2 {
        sample_size *= 2;
        target_scale /= 2;
    }
    sample_size
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    // JPEG carries no alpha; flatten before encoding.
    DynamicImage::ImageRgb8(image.to_rgb8()).write_to(
        &mut std::io::Cursor::new(&mut bytes),
        image::ImageOutputFormat::Jpeg(quality),
    )?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempdir::TempDir;

    use crate::file::LocalFile;
    use image::{Rgba, RgbaImage};

    fn pipeline() -> ImagePipeline {
        ImagePipeline::new(Arc::new(SharedBitmapCache::new("test")))
    }

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let mut image = RgbaImage::new(width, height);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgba([(x % 256) as u8, (y % 256) as u8, 7, 255]);
        }
        DynamicImage::ImageRgba8(image)
    }

    fn png_file(dir: &TempDir, name: &str, width: u32, height: u32) -> Blob {
        let mut bytes = Vec::new();
        gradient(width, height)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageOutputFormat::Png,
            )
            .expect("Failed to encode fixture");
        let path = dir.path().join(name);
        fs::File::create(&path)
            .expect("Failed to create fixture file")
            .write_all(&bytes)
            .expect("Failed to write fixture file");
        Blob::from_file(Box::new(LocalFile::new(path)))
    }

    /// Forwards to the real decoder while counting decode calls.
    struct CountingDecoder {
        decodes: Arc<AtomicUsize>,
    }

    impl BitmapDecoder for CountingDecoder {
        fn decode_bounds(&self, source: DecodeSource) -> Result<(u32, u32)> {
            ImageRsDecoder.decode_bounds(source)
        }

        fn decode(
            &self,
            source: DecodeSource,
            sample_size: u32,
        ) -> Result<DynamicImage> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            ImageRsDecoder.decode(source, sample_size)
        }
    }

    /// Fails every decode with an allocation error.
    struct OomDecoder;

    impl BitmapDecoder for OomDecoder {
        fn decode_bounds(&self, source: DecodeSource) -> Result<(u32, u32)> {
            ImageRsDecoder.decode_bounds(source)
        }

        fn decode(
            &self,
            _source: DecodeSource,
            _sample_size: u32,
        ) -> Result<DynamicImage> {
            Err(BlobError::OutOfMemory("simulated".to_string()))
        }
    }

    struct FixedOrientation(u32);

    impl OrientationReader for FixedOrientation {
        fn orientation(&self, _location: &str) -> u32 {
            self.0
        }
    }

    #[test]
    fn crop_without_parameters_is_full_size() {
        let dir = TempDir::new("bloblib_test").unwrap();
        let blob = png_file(&dir, "src.png", 200, 100);
        let pipeline = pipeline();

        let cropped = pipeline
            .crop(&blob, CropOptions::default())
            .expect("Failed to crop");
        assert_eq!((cropped.width(), cropped.height()), (200, 100));
    }

    #[test]
    fn crop_rejects_rectangle_outside_source() {
        let dir = TempDir::new("bloblib_test").unwrap();
        let blob = png_file(&dir, "src.png", 50, 50);
        let options = CropOptions {
            x: Some(40),
            y: Some(0),
            width: Some(20),
            height: Some(20),
        };
        assert!(pipeline().crop(&blob, options).is_none());
    }

    #[test]
    fn second_identical_transform_is_served_from_cache() {
        let dir = TempDir::new("bloblib_test").unwrap();
        let blob = png_file(&dir, "src.png", 64, 64);
        let decodes = Arc::new(AtomicUsize::new(0));
        let pipeline = ImagePipeline::with_collaborators(
            Arc::new(SharedBitmapCache::new("test")),
            Box::new(CountingDecoder {
                decodes: decodes.clone(),
            }),
            Box::new(NoOrientation),
        );

        let options = CropOptions {
            x: Some(8),
            y: Some(8),
            width: Some(16),
            height: Some(16),
        };
        let first = pipeline
            .crop(&blob, options)
            .expect("Failed to crop");
        let decodes_after_first = decodes.load(Ordering::SeqCst);
        assert!(decodes_after_first >= 1);

        let second = pipeline
            .crop(&blob, options)
            .expect("Failed to crop again");
        // Same key, so neither the decoder nor the transform ran.
        assert_eq!(decodes.load(Ordering::SeqCst), decodes_after_first);
        assert_eq!(
            (first.width(), first.height()),
            (second.width(), second.height())
        );
        assert_eq!(
            first.bytes().expect("bytes"),
            second.bytes().expect("bytes")
        );
    }

    #[test]
    fn transforms_on_memory_content_bypass_the_cache() {
        let pipeline = pipeline();
        let blob = Blob::from_pixels(gradient(64, 64));

        let thumb = pipeline
            .thumbnail(&blob, 16, Some(0.0), Some(0.0))
            .expect("Failed to thumbnail");
        assert_eq!((thumb.width(), thumb.height()), (16, 16));
        // No stable location, nothing cached.
        assert!(pipeline.cache().is_empty());
    }

    #[test]
    fn resize_downsamples_file_backed_sources() {
        assert_eq!(sample_size_for(200, 100, 100, 50), 2);
        assert_eq!(sample_size_for(1000, 1000, 90, 90), 8);
        assert_eq!(sample_size_for(100, 100, 90, 90), 1);
        // More constrained axis wins.
        assert_eq!(sample_size_for(800, 100, 100, 50), 2);

        let dir = TempDir::new("bloblib_test").unwrap();
        let blob = png_file(&dir, "large.png", 256, 256);
        let resized = pipeline()
            .resize(&blob, 64, 64)
            .expect("Failed to resize");
        assert_eq!((resized.width(), resized.height()), (64, 64));
    }

    #[test]
    fn resize_composes_rotation() {
        let dir = TempDir::new("bloblib_test").unwrap();
        let blob = png_file(&dir, "rotated.png", 200, 100);
        let pipeline = ImagePipeline::with_collaborators(
            Arc::new(SharedBitmapCache::new("test")),
            Box::new(ImageRsDecoder),
            Box::new(FixedOrientation(90)),
        );

        let resized = pipeline
            .resize(&blob, 100, 50)
            .expect("Failed to resize");
        // Scaled to 100x50, then rotated a quarter turn.
        assert_eq!((resized.width(), resized.height()), (50, 100));
    }

    #[test]
    fn allocation_failure_clears_cache_and_returns_none() {
        let dir = TempDir::new("bloblib_test").unwrap();
        let blob = png_file(&dir, "src.png", 64, 64);
        let cache = Arc::new(SharedBitmapCache::new("test"));
        cache.put(
            "warm".to_string(),
            Arc::new(Bitmap::new(gradient(4, 4))),
        );
        let pipeline = ImagePipeline::with_collaborators(
            cache.clone(),
            Box::new(OomDecoder),
            Box::new(NoOrientation),
        );

        assert!(pipeline.resize(&blob, 32, 32).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn non_image_content_yields_none() {
        let pipeline = pipeline();
        let blob = Blob::from_string("not an image");
        assert!(pipeline.resolve_bitmap(&blob).is_none());
        assert!(pipeline.with_alpha(&blob).is_none());
    }

    #[test]
    fn compress_is_never_cached_and_reencodes_jpeg() {
        let dir = TempDir::new("bloblib_test").unwrap();
        let blob = png_file(&dir, "src.png", 64, 64);
        let pipeline = pipeline();

        let compressed = pipeline
            .compress(&blob, Some(0.4))
            .expect("Failed to compress");
        assert_eq!(compressed.mime_type(), "image/jpeg");
        let bytes = compressed.bytes().expect("bytes");
        // JPEG SOI marker.
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        // The decode of the source is cached, the compressed result
        // is not.
        assert!(!pipeline.cache().is_empty());
        let decode_key_only = pipeline.cache().len();
        pipeline.compress(&blob, Some(0.4));
        assert_eq!(pipeline.cache().len(), decode_key_only);
    }

    #[test]
    fn thumbnail_applies_border_and_radius() {
        let dir = TempDir::new("bloblib_test").unwrap();
        let blob = png_file(&dir, "src.png", 128, 64);
        let thumb = pipeline()
            .thumbnail(&blob, 32, Some(2.0), Some(8.0))
            .expect("Failed to thumbnail");
        // 32px square plus a 2px border ring on each side.
        assert_eq!((thumb.width(), thumb.height()), (36, 36));
    }

    #[test]
    fn with_transparent_border_pads() {
        let pipeline = pipeline();
        let blob = Blob::from_pixels(gradient(10, 10));
        let padded = pipeline
            .with_transparent_border(&blob, 5)
            .expect("Failed to pad");
        assert_eq!((padded.width(), padded.height()), (20, 20));
        assert_eq!(padded.mime_type(), "image/png");
    }

    #[test]
    fn with_alpha_produces_png_backed_blob() {
        let pipeline = pipeline();
        let blob = Blob::from_pixels(DynamicImage::ImageRgb8(
            image::RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3])),
        ));
        let alpha = pipeline
            .with_alpha(&blob)
            .expect("Failed to add alpha");
        assert_eq!(alpha.mime_type(), "image/png");
    }

    #[test]
    fn invalidated_cache_entry_forces_recompute() {
        let dir = TempDir::new("bloblib_test").unwrap();
        let blob = png_file(&dir, "src.png", 64, 64);
        let cache = Arc::new(SharedBitmapCache::new("test"));
        let pipeline = ImagePipeline::new(cache.clone());

        let first = pipeline
            .with_alpha(&blob)
            .expect("Failed to transform");
        // Simulate the platform releasing every cached buffer.
        first.pixels().expect("result owns pixels").invalidate();
        let location = match blob.content() {
            Content::File(file) => file.location(),
            _ => unreachable!(),
        };
        if let Some(cached) = cache.get(&format!("{}_1", location)) {
            cached.invalidate();
        }

        let second = pipeline
            .with_alpha(&blob)
            .expect("Failed to recompute");
        assert!(!second.pixels().expect("pixels").is_invalidated());
    }
}
