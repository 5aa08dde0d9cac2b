//! MIME glue: magic-byte sniffing over the head of a content stream,
//! extension lookup for file-backed blobs, and the binary/text
//! classification used by the text accessor.

use std::collections::HashMap;

use once_cell::sync::Lazy;

pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";
pub const IMAGE_PNG: &str = "image/png";
pub const IMAGE_JPEG: &str = "image/jpeg";
/// Fallback for a pixel buffer that could not be re-encoded.
pub const IMAGE_BITMAP: &str = "image/bitmap";

/// Longest signature we need to recognize fits in the first 64 bytes.
pub const SNIFF_LEN: usize = 64;

static EXTENSION_TYPES: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| {
        HashMap::from([
            ("txt", TEXT_PLAIN),
            ("csv", "text/csv"),
            ("htm", "text/html"),
            ("html", "text/html"),
            ("css", "text/css"),
            ("js", "application/javascript"),
            ("json", "application/json"),
            ("xml", "application/xml"),
            ("pdf", "application/pdf"),
            ("zip", "application/zip"),
            ("gif", "image/gif"),
            ("png", IMAGE_PNG),
            ("jpg", IMAGE_JPEG),
            ("jpeg", IMAGE_JPEG),
            ("webp", "image/webp"),
            ("bmp", "image/bmp"),
            ("svg", "image/svg+xml"),
            ("mp3", "audio/mpeg"),
            ("wav", "audio/wav"),
            ("mp4", "video/mp4"),
            ("mov", "video/quicktime"),
        ])
    });

/// Looks up a MIME type by the extension of `path`, falling back to
/// the generic octet-stream type.
pub fn from_extension(path: &str) -> &'static str {
    path.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .and_then(|ext| EXTENSION_TYPES.get(ext.as_str()).copied())
        .unwrap_or(OCTET_STREAM)
}

/// Guesses a MIME type from the leading bytes of the content.
///
/// Recognizes the image signatures relevant to bitmap probing: GIF,
/// PNG, and the JPEG marker family (JFIF, Exif, and the Adobe `EE`
/// marker which historically reports as `image/jpg`).
pub fn sniff(head: &[u8]) -> Option<&'static str> {
    if head.len() >= 4 && &head[..4] == b"GIF8" {
        return Some("image/gif");
    }
    if head.len() >= 8
        && head[..8] == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]
    {
        return Some(IMAGE_PNG);
    }
    if head.len() >= 4 && head[..3] == [0xFF, 0xD8, 0xFF] {
        if head[3] == 0xE0
            || (head[3] == 0xE1
                && head.len() >= 11
                && &head[6..11] == b"Exif\0")
        {
            return Some(IMAGE_JPEG);
        }
        if head[3] == 0xEE {
            return Some("image/jpg");
        }
    }
    None
}

/// Whether the declared type holds binary content. Text types and the
/// structured application types that are really text are excluded.
pub fn is_binary(mime_type: &str) -> bool {
    if mime_type.starts_with("text/") {
        return false;
    }
    !matches!(
        mime_type,
        "application/json"
            | "application/xml"
            | "application/javascript"
            | "application/x-javascript"
    )
}
