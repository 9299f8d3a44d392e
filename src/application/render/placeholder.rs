//! Stand-in image served when no rendering capability is configured.

use bytes::Bytes;

use crate::domain::documents::DocumentId;

pub const PLACEHOLDER_CONTENT_TYPE: &str = "image/svg+xml";

// US letter, 8.5in x 11in.
const ASPECT_NUMERATOR: u32 = 22;
const ASPECT_DENOMINATOR: u32 = 17;

pub fn placeholder_svg(document: &DocumentId, page: u32, width: u32) -> Bytes {
    let height = width.saturating_mul(ASPECT_NUMERATOR) / ASPECT_DENOMINATOR;
    let font_size = (width / 24).max(10);
    let label = escape_text(&format!("{document} · page {page}"));
    let svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}"><rect width="100%" height="100%" fill="#f4f1ea" stroke="#c9c3b6" stroke-width="2"/><text x="50%" y="50%" text-anchor="middle" dominant-baseline="middle" font-family="sans-serif" font-size="{font_size}" fill="#6b655a">{label}</text></svg>"##
    );
    Bytes::from(svg)
}

fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
