//! Pure pixel manipulations shared by the transform operations.
//!
//! Everything here takes a source image and returns a fresh buffer;
//! lifetime of intermediates is the caller's concern.

use image::{imageops, DynamicImage, GenericImageView, Rgba, RgbaImage};

/// Applies a normalized orientation rotation. Only the right-angle
/// rotations carried by orientation metadata are meaningful; anything
/// else passes the image through unchanged.
pub fn rotate(image: &DynamicImage, degrees: u32) -> DynamicImage {
    match degrees % 360 {
        0 => image.clone(),
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        other => {
            log::warn!("ignoring non-orientation rotation of {}°", other);
            image.clone()
        }
    }
}

/// Extracts a centered square thumbnail of `size`×`size` pixels.
pub fn thumbnail(image: &DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let side = width.min(height);
    let x = (width - side) / 2;
    let y = (height - side) / 2;
    image
        .crop_imm(x, y, side, side)
        .resize_exact(size.max(1), size.max(1), imageops::FilterType::Triangle)
}

/// Normalizes to a pixel format carrying an alpha channel.
pub fn with_alpha(image: &DynamicImage) -> DynamicImage {
    DynamicImage::ImageRgba8(image.to_rgba8())
}

/// Pads the image with `size` pixels of fully transparent border on
/// every side.
pub fn transparent_border(image: &DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let mut out = RgbaImage::from_pixel(
        width + 2 * size,
        height + 2 * size,
        Rgba([0, 0, 0, 0]),
    );
    imageops::overlay(&mut out, &image.to_rgba8(), size as i64, size as i64);
    DynamicImage::ImageRgba8(out)
}

/// Rounds the image corners to `radius` and pads it with a transparent
/// border of `border` pixels. Pixels outside the rounded rectangle
/// become fully transparent.
pub fn rounded_corner(
    image: &DynamicImage,
    radius: f32,
    border: f32,
) -> DynamicImage {
    let border_px = border.max(0.0).round() as u32;
    let padded = transparent_border(image, border_px);
    let mut out = padded.to_rgba8();

    let (width, height) = image.dimensions();
    let radius = radius
        .max(0.0)
        .min(width.min(height) as f32 / 2.0);
    for y in 0..height {
        for x in 0..width {
            // Pixel-center coordinates relative to the image rect.
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;
            if !inside_rounded_rect(
                px,
                py,
                width as f32,
                height as f32,
                radius,
            ) {
                out.get_pixel_mut(x + border_px, y + border_px).0[3] = 0;
            }
        }
    }
    DynamicImage::ImageRgba8(out)
}

fn inside_rounded_rect(x: f32, y: f32, w: f32, h: f32, r: f32) -> bool {
    if r <= 0.0 {
        return true;
    }
    let cx = x.max(r).min(w - r);
    let cy = y.max(r).min(h - r);
    let dx = x - cx;
    let dy = y - cy;
    dx * dx + dy * dy <= r * r
}
