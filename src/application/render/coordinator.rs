use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::application::{
    rate_limit::{self, RateLimitDecision, RateLimitError, RateLimiter},
    repos::{DocumentResolver, RepoError},
    signer::UrlSigner,
};
use crate::cache::{CacheKey, CacheStore, Rendition};
use crate::domain::{
    documents::{Document, DocumentId},
    render::{CacheStatus, RenderRequest, RenderStatus, RenderedImage, WidthBounds},
};

use super::{
    EngineMode, RenderError,
    engine::{EngineError, RenderTarget},
    placeholder::{PLACEHOLDER_CONTENT_TYPE, placeholder_svg},
    retry::{RetryError, RetryPolicy},
};

const METRIC_CACHE_HIT: &str = "stave_render_cache_hit_total";
const METRIC_CACHE_MISS: &str = "stave_render_cache_miss_total";
const METRIC_ENGINE_ATTEMPT: &str = "stave_render_engine_attempt_total";
const METRIC_RENDER_FAILED: &str = "stave_render_failed_total";
const METRIC_RATE_LIMITED: &str = "stave_render_rate_limited_total";
const METRIC_RENDER_MS: &str = "stave_render_ms";

/// Wait hint when the limiter could not commit a hot key's counter.
const CONTENDED_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Request defaults and limits applied by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderDefaults {
    pub bounds: WidthBounds,
    /// Rendition stored under the canonical page key.
    pub canonical: Rendition,
    pub thumbnail: Rendition,
}

pub struct RenderCoordinator {
    cache: CacheStore,
    limiter: RateLimiter,
    documents: Arc<dyn DocumentResolver>,
    signer: UrlSigner,
    engine: EngineMode,
    retry: RetryPolicy,
    defaults: RenderDefaults,
}

#[derive(Debug, Clone, Copy)]
enum RenderKind {
    Page,
    Thumbnail,
}

impl RenderKind {
    fn as_str(self) -> &'static str {
        match self {
            RenderKind::Page => "page",
            RenderKind::Thumbnail => "thumbnail",
        }
    }

    fn op(self) -> &'static str {
        match self {
            RenderKind::Page => "render::render_page",
            RenderKind::Thumbnail => "render::render_thumbnail",
        }
    }
}

impl RenderCoordinator {
    pub fn new(
        cache: CacheStore,
        limiter: RateLimiter,
        documents: Arc<dyn DocumentResolver>,
        signer: UrlSigner,
        engine: EngineMode,
        retry: RetryPolicy,
        defaults: RenderDefaults,
    ) -> Self {
        Self {
            cache,
            limiter,
            documents,
            signer,
            engine,
            retry,
            defaults,
        }
    }

    pub fn defaults(&self) -> RenderDefaults {
        self.defaults
    }

    pub fn engine_available(&self) -> bool {
        self.engine.is_available()
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Render one page, serving it from the cache when possible.
    pub async fn render_page(
        &self,
        document: &str,
        page: i64,
        width: i64,
        format: &str,
        quality: i64,
    ) -> Result<RenderedImage, RenderError> {
        let request =
            RenderRequest::parse(document, page, width, format, quality, self.defaults.bounds)?;
        let key = CacheKey::for_request(&request, self.defaults.canonical);
        self.render(request, key, RenderKind::Page).await
    }

    /// Render the first page at the configured thumbnail rendition.
    pub async fn render_thumbnail(&self, document: &str) -> Result<RenderedImage, RenderError> {
        let document_id = DocumentId::parse(document)?;
        let thumbnail = self.defaults.thumbnail;
        let key = CacheKey::thumbnail(&document_id, thumbnail.format);
        let request = RenderRequest {
            document_id,
            page: 1,
            width: thumbnail.width,
            format: thumbnail.format,
            quality: thumbnail.quality,
        };
        self.render(request, key, RenderKind::Thumbnail).await
    }

    /// What the cache currently holds for a document. Advisory only.
    pub async fn render_status(&self, document: &str) -> Result<RenderStatus, RenderError> {
        let document_id = DocumentId::parse(document)?;
        let cached_pages = self.cache.cached_pages(&document_id).await?;
        let has_thumbnail = self.cache.has_thumbnail(&document_id).await?;
        Ok(RenderStatus {
            document_id,
            cached_pages,
            has_thumbnail,
            engine_available: self.engine.is_available(),
        })
    }

    /// Drop every cached artifact of a document.
    pub async fn invalidate_document(&self, document: &str) -> Result<usize, RenderError> {
        let document_id = DocumentId::parse(document)?;
        let removed = self.cache.remove_document(&document_id).await?;
        info!(
            target = "application::render::coordinator",
            op = "render::invalidate_document",
            document = %document_id,
            removed,
            "Removed cached renditions"
        );
        Ok(removed)
    }

    async fn render(
        &self,
        request: RenderRequest,
        key: CacheKey,
        kind: RenderKind,
    ) -> Result<RenderedImage, RenderError> {
        let started = Instant::now();

        if let Some(artifact) = self.cache.get(&key).await {
            counter!(METRIC_CACHE_HIT, "kind" => kind.as_str()).increment(1);
            debug!(
                target = "application::render::coordinator",
                op = kind.op(),
                result = "hit",
                key = %key,
                "Served rendition from cache"
            );
            return Ok(RenderedImage {
                bytes: artifact.bytes,
                content_type: artifact.content_type,
                cache_status: CacheStatus::Hit,
                degraded: false,
            });
        }
        counter!(METRIC_CACHE_MISS, "kind" => kind.as_str()).increment(1);

        let limit_key = rate_limit::render_key(request.document_id.as_str());
        self.enforce_rate_limit(&limit_key, kind).await?;

        let document = self.resolve_document(&request).await?;

        let engine = match &self.engine {
            EngineMode::Configured(engine) => Arc::clone(engine),
            EngineMode::Disabled { placeholders: true } => {
                debug!(
                    target = "application::render::coordinator",
                    op = kind.op(),
                    result = "placeholder",
                    document = %request.document_id,
                    page = request.page,
                    "No rendering capability configured; serving placeholder"
                );
                return Ok(RenderedImage {
                    bytes: placeholder_svg(&request.document_id, request.page, request.width),
                    content_type: PLACEHOLDER_CONTENT_TYPE.to_string(),
                    cache_status: CacheStatus::Placeholder,
                    degraded: false,
                });
            }
            EngineMode::Disabled {
                placeholders: false,
            } => return Err(RenderError::EngineUnavailable),
        };

        let target = RenderTarget {
            source_key: document.source_key.clone(),
            page: request.page,
            width: request.width,
            format: request.format,
            quality: request.quality,
        };
        let result = self
            .retry
            .run(
                kind.op(),
                |_attempt| {
                    let engine = Arc::clone(&engine);
                    let target = &target;
                    async move {
                        counter!(METRIC_ENGINE_ATTEMPT).increment(1);
                        engine
                            .render_attempt(target, &self.signer)
                            .await
                            .map_err(|err| match err {
                                EngineError::Signing(message) => {
                                    RenderError::Repository(RepoError::invalid_input(message))
                                }
                                other => RenderError::Transient(other),
                            })
                    }
                },
                RenderError::is_transient,
            )
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(outcome) => {
                histogram!(METRIC_RENDER_MS, "kind" => kind.as_str(), "result" => "rendered")
                    .record(started.elapsed().as_secs_f64() * 1000.0);
                let content_type = request.format.content_type().to_string();
                let degraded = outcome.degraded();
                self.cache
                    .put_detached(key.clone(), outcome.bytes.clone(), content_type.clone());
                info!(
                    target = "application::render::coordinator",
                    op = kind.op(),
                    result = "miss",
                    key = %key,
                    degraded,
                    bytes = outcome.bytes.len(),
                    elapsed_ms,
                    "Rendered and scheduled cache write"
                );
                Ok(RenderedImage {
                    bytes: outcome.bytes,
                    content_type,
                    cache_status: CacheStatus::Miss,
                    degraded,
                })
            }
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { attempts, last }) => {
                histogram!(METRIC_RENDER_MS, "kind" => kind.as_str(), "result" => "failed")
                    .record(started.elapsed().as_secs_f64() * 1000.0);
                counter!(METRIC_RENDER_FAILED, "kind" => kind.as_str()).increment(1);
                if let Err(err) = self.limiter.penalize(&limit_key).await {
                    warn!(
                        target = "application::render::coordinator",
                        op = kind.op(),
                        result = "penalize_failed",
                        key = %limit_key,
                        error = %err,
                        "Failed to record render failure with the rate limiter"
                    );
                }
                let last_error = match last {
                    RenderError::Transient(err) => err,
                    other => return Err(other),
                };
                error!(
                    target = "application::render::coordinator",
                    op = kind.op(),
                    result = "failed",
                    key = %key,
                    attempts,
                    elapsed_ms,
                    error = %last_error,
                    "Render failed after exhausting retries"
                );
                Err(RenderError::Failed {
                    attempts,
                    last_error,
                })
            }
        }
    }

    async fn enforce_rate_limit(&self, key: &str, kind: RenderKind) -> Result<(), RenderError> {
        match self.limiter.check(key).await {
            Ok(RateLimitDecision::Allowed { .. }) => Ok(()),
            Ok(RateLimitDecision::Throttled {
                retry_after,
                banned,
            }) => {
                let banned_label = if banned { "true" } else { "false" };
                counter!(METRIC_RATE_LIMITED, "banned" => banned_label).increment(1);
                info!(
                    target = "application::render::coordinator",
                    op = kind.op(),
                    result = "rate_limited",
                    key,
                    banned,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Render throttled"
                );
                Err(RenderError::RateLimited { retry_after })
            }
            Err(RateLimitError::Contended { attempts, .. }) => {
                counter!(METRIC_RATE_LIMITED, "banned" => "false").increment(1);
                info!(
                    target = "application::render::coordinator",
                    op = kind.op(),
                    result = "rate_limited",
                    key,
                    attempts,
                    "Render throttled; rate-limit counter is contended"
                );
                Err(RenderError::RateLimited {
                    retry_after: CONTENDED_RETRY_AFTER,
                })
            }
            Err(RateLimitError::Store(err)) => {
                // Fail open.
                warn!(
                    target = "application::render::coordinator",
                    op = kind.op(),
                    result = "rate_limit_unavailable",
                    key,
                    error = %err,
                    "Rate limiter unavailable; allowing request"
                );
                Ok(())
            }
        }
    }

    async fn resolve_document(&self, request: &RenderRequest) -> Result<Document, RenderError> {
        let document = self
            .documents
            .resolve(&request.document_id)
            .await?
            .filter(Document::is_renderable)
            .ok_or_else(|| RenderError::NotFound(format!("document `{}`", request.document_id)))?;

        if !document.has_page(request.page) {
            return Err(RenderError::Validation(format!(
                "page {} is beyond the document's {} page(s)",
                request.page,
                document.page_count.unwrap_or_default()
            )));
        }
        Ok(document)
    }
}
