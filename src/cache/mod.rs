//! Rendered artifact cache.
//!
//! Artifacts are immutable and addressed by deterministic keys, so the cache
//! has no invalidation traffic beyond explicit document purges.

mod keys;
mod store;

pub use keys::{
    CacheKey, RENDERS_NAMESPACE, Rendition, THUMBNAILS_NAMESPACE, VARIANTS_NAMESPACE,
    page_prefix, parse_page_number, thumbnail_prefix, variant_prefix,
};
pub use store::{CacheStore, CacheWriteError, CachedArtifact};
