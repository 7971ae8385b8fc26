use std::fmt::Write as _;
use std::path::Path;

use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Square images count as portrait.
    pub fn is_portrait(&self) -> bool {
        self.width <= self.height
    }

    pub fn aspect(&self) -> f64 {
        f64::from(self.width.max(1)) / f64::from(self.height.max(1))
    }
}

/// One photo as a provider describes it, plus the outcome of fetching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Where the photo can be viewed by a person.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Download URL or local path.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    #[serde(default = "cache_allowed_default")]
    pub cache_allowed: bool,
    #[serde(skip)]
    pub cache_used: bool,
    #[serde(skip)]
    pub error: Option<String>,
    #[serde(skip)]
    pub keyword: Option<String>,
    #[serde(skip)]
    pub provider: Option<String>,
}

fn cache_allowed_default() -> bool {
    true
}

impl ImageDescriptor {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mime_type: None,
            source: None,
            url: url.into(),
            filename: None,
            dimensions: None,
            cache_allowed: true,
            cache_used: false,
            error: None,
            keyword: None,
            provider: None,
        }
    }

    /// A descriptor that only carries a failure for the caller to show.
    pub fn failed(message: impl Into<String>) -> Self {
        let mut item = Self::new("", "");
        item.error = Some(message.into());
        item
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        if width > 0 && height > 0 {
            self.dimensions = Some(Dimensions::new(width, height));
        }
        self
    }

    pub fn uncacheable(mut self) -> Self {
        self.cache_allowed = false;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Content-address of this image inside the cache and history.
    pub fn cache_id(&self) -> String {
        hash_text(&self.id)
    }
}

/// Sizing hints handed to providers when they build a download URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeHints {
    pub size: Dimensions,
    pub display: Dimensions,
}

/// Hex SHA-256 of the UTF-8 bytes of `text`.
pub fn hash_text(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Size to request so the image covers the display while keeping its aspect.
///
/// Images that already fit inside the display are requested as-is; unknown
/// dimensions fall back to the display size.
pub fn recommended_size(image: Option<Dimensions>, display: Dimensions) -> Dimensions {
    let Some(image) = image else {
        return display;
    };
    if image.width <= display.width || image.height <= display.height {
        return image;
    }
    let dar = display.aspect();
    let oar = image.aspect();
    if oar <= dar {
        let height = (f64::from(display.width) / oar).round() as u32;
        Dimensions::new(display.width, height.max(1))
    } else {
        let width = (oar * f64::from(display.height)).round() as u32;
        Dimensions::new(width.max(1), display.height)
    }
}

/// MIME type derived from the file's magic bytes.
pub fn sniff_mime(path: &Path) -> Option<String> {
    let reader = ImageReader::open(path).ok()?.with_guessed_format().ok()?;
    reader.format().map(|f| f.to_mime_type().to_string())
}

/// MIME type guessed from the file extension.
pub fn mime_from_extension(path: &Path) -> Option<String> {
    ImageFormat::from_path(path)
        .ok()
        .map(|f| f.to_mime_type().to_string())
}

/// Intrinsic size read from the header; works for files without an extension.
pub fn measure(path: &Path) -> Option<Dimensions> {
    let reader = ImageReader::open(path).ok()?.with_guessed_format().ok()?;
    reader
        .into_dimensions()
        .ok()
        .map(|(w, h)| Dimensions::new(w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommended_size_keeps_aspect_and_meets_one_side() {
        let display = Dimensions::new(1920, 1080);
        for (w, h) in [(4000, 3000), (6000, 2000), (2500, 5000), (3840, 2160)] {
            let image = Dimensions::new(w, h);
            let rec = recommended_size(Some(image), display);
            assert!(
                rec.width == display.width || rec.height == display.height,
                "{rec:?} should match one display side"
            );
            assert!((rec.aspect() - image.aspect()).abs() < 0.01, "{rec:?} vs {image:?}");
            assert!(rec.width >= display.width && rec.height >= display.height);
        }
    }

    #[test]
    fn small_or_unknown_images_are_not_rescaled() {
        let display = Dimensions::new(1920, 1080);
        let small = Dimensions::new(800, 600);
        assert_eq!(recommended_size(Some(small), display), small);
        let tall = Dimensions::new(1000, 3000);
        assert_eq!(recommended_size(Some(tall), display), tall);
        assert_eq!(recommended_size(None, display), display);
    }

    #[test]
    fn cache_id_is_stable_hex() {
        let item = ImageDescriptor::new("photo-1", "https://example.com/1.jpg");
        assert_eq!(item.cache_id(), hash_text("photo-1"));
        assert_eq!(item.cache_id().len(), 64);
        assert_ne!(item.cache_id(), hash_text("photo-2"));
    }

    #[test]
    fn square_counts_as_portrait() {
        assert!(Dimensions::new(500, 500).is_portrait());
        assert!(!Dimensions::new(501, 500).is_portrait());
    }
}
