//! Render request parameters and outcomes.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{documents::DocumentId, error::DomainError};

pub const MIN_QUALITY: i64 = 1;
pub const MAX_QUALITY: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 3] = [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Webp];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.extension() == extension)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            other => Err(DomainError::validation(format!(
                "unsupported format `{other}`; expected one of png, jpeg, webp"
            ))),
        }
    }
}

/// Inclusive width bounds accepted by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WidthBounds {
    pub min: u32,
    pub max: u32,
}

impl Default for WidthBounds {
    fn default() -> Self {
        Self { min: 100, max: 4000 }
    }
}

/// Caller-supplied parameters of one render call, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub document_id: DocumentId,
    pub page: u32,
    pub width: u32,
    pub format: ImageFormat,
    pub quality: u8,
}

impl RenderRequest {
    /// Validate raw parameters. Signed inputs keep negative values reportable.
    pub fn parse(
        document_id: &str,
        page: i64,
        width: i64,
        format: &str,
        quality: i64,
        bounds: WidthBounds,
    ) -> Result<Self, DomainError> {
        let document_id = DocumentId::parse(document_id)?;

        if page < 1 {
            return Err(DomainError::validation(format!(
                "page must be at least 1, got {page}"
            )));
        }
        let page = u32::try_from(page)
            .map_err(|_| DomainError::validation(format!("page {page} is out of range")))?;

        if width < i64::from(bounds.min) || width > i64::from(bounds.max) {
            return Err(DomainError::validation(format!(
                "width must be between {} and {}, got {width}",
                bounds.min, bounds.max
            )));
        }
        let width = width as u32;

        let format = format.parse::<ImageFormat>()?;

        if !(MIN_QUALITY..=MAX_QUALITY).contains(&quality) {
            return Err(DomainError::validation(format!(
                "quality must be between {MIN_QUALITY} and {MAX_QUALITY}, got {quality}"
            )));
        }
        let quality = quality as u8;

        Ok(Self {
            document_id,
            page,
            width,
            format,
            quality,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Placeholder,
}

impl CacheStatus {
    pub fn as_header(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Placeholder => "PLACEHOLDER",
        }
    }
}

/// Image bytes returned to the caller, tagged with where they came from.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub bytes: Bytes,
    pub content_type: String,
    pub cache_status: CacheStatus,
    /// Set when the bytes came from a timeout-plus-probe outcome.
    pub degraded: bool,
}

/// Read-only snapshot of what the cache holds for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderStatus {
    pub document_id: DocumentId,
    pub cached_pages: Vec<u32>,
    pub has_thumbnail: bool,
    pub engine_available: bool,
}
