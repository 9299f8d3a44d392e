//! Cache key definitions.
//!
//! Keys are human-readable object paths, namespaced by purpose:
//!
//! - `renders/{document}/page-{n}.{ext}` for canonical page renditions
//! - `variants/{document}/page-{n}-w{width}-q{quality}.{ext}` for other sizes
//! - `thumbnails/{document}.{ext}`

use std::fmt;

use crate::domain::{
    documents::DocumentId,
    render::{ImageFormat, RenderRequest},
};

pub const RENDERS_NAMESPACE: &str = "renders";
pub const VARIANTS_NAMESPACE: &str = "variants";
pub const THUMBNAILS_NAMESPACE: &str = "thumbnails";

/// Width and quality of the rendition stored under the canonical page key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendition {
    pub width: u32,
    pub quality: u8,
    pub format: ImageFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Page {
        document: DocumentId,
        page: u32,
        format: ImageFormat,
    },
    Variant {
        document: DocumentId,
        page: u32,
        width: u32,
        quality: u8,
        format: ImageFormat,
    },
    Thumbnail {
        document: DocumentId,
        format: ImageFormat,
    },
}

impl CacheKey {
    /// Key for a page request. Only the canonical width and quality share the
    /// canonical page key; anything else lands in the variant namespace.
    pub fn for_request(request: &RenderRequest, canonical: Rendition) -> Self {
        if request.width == canonical.width && request.quality == canonical.quality {
            CacheKey::Page {
                document: request.document_id.clone(),
                page: request.page,
                format: request.format,
            }
        } else {
            CacheKey::Variant {
                document: request.document_id.clone(),
                page: request.page,
                width: request.width,
                quality: request.quality,
                format: request.format,
            }
        }
    }

    pub fn thumbnail(document: &DocumentId, format: ImageFormat) -> Self {
        CacheKey::Thumbnail {
            document: document.clone(),
            format,
        }
    }

    pub fn format(&self) -> ImageFormat {
        match self {
            CacheKey::Page { format, .. }
            | CacheKey::Variant { format, .. }
            | CacheKey::Thumbnail { format, .. } => *format,
        }
    }

    pub fn path(&self) -> String {
        match self {
            CacheKey::Page {
                document,
                page,
                format,
            } => format!(
                "{RENDERS_NAMESPACE}/{document}/page-{page}.{}",
                format.extension()
            ),
            CacheKey::Variant {
                document,
                page,
                width,
                quality,
                format,
            } => format!(
                "{VARIANTS_NAMESPACE}/{document}/page-{page}-w{width}-q{quality}.{}",
                format.extension()
            ),
            CacheKey::Thumbnail { document, format } => {
                format!("{THUMBNAILS_NAMESPACE}/{document}.{}", format.extension())
            }
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

pub fn page_prefix(document: &DocumentId) -> String {
    format!("{RENDERS_NAMESPACE}/{document}/")
}

pub fn variant_prefix(document: &DocumentId) -> String {
    format!("{VARIANTS_NAMESPACE}/{document}/")
}

pub fn thumbnail_prefix(document: &DocumentId) -> String {
    format!("{THUMBNAILS_NAMESPACE}/{document}.")
}

/// Page number of a canonical page path such as `renders/doc/page-3.webp`.
pub fn parse_page_number(path: &str) -> Option<u32> {
    let file = path.rsplit('/').next()?;
    let (stem, extension) = file.rsplit_once('.')?;
    ImageFormat::from_extension(extension)?;
    stem.strip_prefix("page-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::render::WidthBounds;

    const CANONICAL: Rendition = Rendition {
        width: 1200,
        quality: 85,
        format: ImageFormat::Webp,
    };

    fn request(width: i64, quality: i64) -> RenderRequest {
        RenderRequest::parse("doc_42", 3, width, "webp", quality, WidthBounds::default())
            .expect("valid request")
    }

    #[test]
    fn canonical_request_uses_page_namespace() {
        let key = CacheKey::for_request(&request(1200, 85), CANONICAL);
        assert_eq!(key.path(), "renders/doc_42/page-3.webp");
    }

    #[test]
    fn other_sizes_use_variant_namespace() {
        let key = CacheKey::for_request(&request(800, 85), CANONICAL);
        assert_eq!(key.path(), "variants/doc_42/page-3-w800-q85.webp");

        let key = CacheKey::for_request(&request(1200, 60), CANONICAL);
        assert_eq!(key.path(), "variants/doc_42/page-3-w1200-q60.webp");
    }

    #[test]
    fn thumbnail_key_ignores_page() {
        let document = DocumentId::parse("doc_42").expect("id");
        let key = CacheKey::thumbnail(&document, ImageFormat::Jpeg);
        assert_eq!(key.path(), "thumbnails/doc_42.jpg");
        assert!(key.path().starts_with(&thumbnail_prefix(&document)));
    }

    #[test]
    fn parses_page_numbers_from_canonical_paths() {
        assert_eq!(parse_page_number("renders/doc_42/page-12.png"), Some(12));
        assert_eq!(parse_page_number("renders/doc_42/page-x.png"), None);
        assert_eq!(parse_page_number("renders/doc_42/page-1.gif"), None);
        assert_eq!(parse_page_number("renders/doc_42/cover.png"), None);
    }
}
