//! One render attempt against a stateful rendering capability.
//!
//! An attempt moves through `Launching -> Loading -> Rendering` and ends in
//! exactly one of `Succeeded`, `Errored`, `TimedOutWithContent` or
//! `TimedOutEmpty`. The session is returned to the pool only after a clean
//! success; every other exit closes it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::application::signer::UrlSigner;
use crate::domain::render::ImageFormat;

use super::harness::{self, HarnessAssets, HarnessJob};
use super::pool::{PooledSession, SessionPool};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to launch render session: {0}")]
    Launch(String),
    #[error("render session protocol error: {0}")]
    Protocol(String),
    #[error("render harness reported an error: {0}")]
    Harness(String),
    #[error("render timed out after {elapsed_ms}ms with an empty target")]
    TimedOutEmpty { elapsed_ms: u64 },
    #[error("render session closed unexpectedly")]
    SessionClosed,
    #[error("render session I/O failed: {0}")]
    Io(String),
    #[error("render session pool is shut down")]
    PoolClosed,
    #[error("source could not be signed: {0}")]
    Signing(String),
}

impl EngineError {
    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::Io(err.to_string())
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Launch(_) => "launch",
            EngineError::Protocol(_) => "protocol",
            EngineError::Harness(_) => "harness",
            EngineError::TimedOutEmpty { .. } => "timed_out_empty",
            EngineError::SessionClosed => "session_closed",
            EngineError::Io(_) => "io",
            EngineError::PoolClosed => "pool_closed",
            EngineError::Signing(_) => "signing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Launching,
    Loading,
    Rendering,
    Succeeded,
    Errored,
    TimedOutWithContent,
    TimedOutEmpty,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Launching => "launching",
            AttemptState::Loading => "loading",
            AttemptState::Rendering => "rendering",
            AttemptState::Succeeded => "succeeded",
            AttemptState::Errored => "errored",
            AttemptState::TimedOutWithContent => "timed_out_with_content",
            AttemptState::TimedOutEmpty => "timed_out_empty",
        }
    }
}

/// Completion signals armed by [`RenderSession::load`]. Exactly one of them
/// fires for a healthy session.
pub struct RenderSignals {
    pub success: oneshot::Receiver<()>,
    pub error: oneshot::Receiver<String>,
}

/// A live rendering context, such as one browser page.
#[async_trait]
pub trait RenderSession: Send {
    async fn load(&mut self, job: &HarnessJob) -> Result<RenderSignals, EngineError>;

    /// Whether the render target holds drawn content.
    async fn probe(&mut self) -> Result<bool, EngineError>;

    async fn capture(&mut self, format: ImageFormat, quality: u8) -> Result<Bytes, EngineError>;

    /// Clear per-render state before the session is reused.
    async fn reset(&mut self) -> Result<(), EngineError>;

    async fn close(self: Box<Self>);
}

/// Factory for render sessions.
#[async_trait]
pub trait RenderCapability: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn RenderSession>, EngineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub render_timeout: Duration,
    /// Page width in PDF points that maps to scale 1.0.
    pub base_unit: u32,
    pub assets: HarnessAssets,
}

/// What one attempt should produce.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTarget {
    /// Storage key of the source, signed only once a session is held.
    pub source_key: String,
    pub page: u32,
    pub width: u32,
    pub format: ImageFormat,
    pub quality: u8,
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub bytes: Bytes,
    /// `Succeeded` or `TimedOutWithContent`.
    pub state: AttemptState,
}

impl AttemptOutcome {
    pub fn degraded(&self) -> bool {
        self.state == AttemptState::TimedOutWithContent
    }
}

pub struct RenderEngine {
    pool: SessionPool,
    options: EngineOptions,
}

impl RenderEngine {
    pub fn new(pool: SessionPool, options: EngineOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub async fn render_attempt(
        &self,
        target: &RenderTarget,
        signer: &UrlSigner,
    ) -> Result<AttemptOutcome, EngineError> {
        trace_state(AttemptState::Launching, target);
        let mut session = self.pool.acquire().await?;
        let started = Instant::now();

        // The URL lifetime starts after the permit wait.
        let result = match signer.sign(&target.source_key) {
            Ok(source_url) => self.drive(&mut session, target, source_url, started).await,
            Err(err) => Err(EngineError::Signing(err.to_string())),
        };
        match &result {
            Ok(outcome) if outcome.state == AttemptState::Succeeded => session.release().await,
            _ => session.discard().await,
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) if outcome.degraded() => warn!(
                target = "application::render::engine",
                op = "engine::render_attempt",
                result = outcome.state.as_str(),
                page = target.page,
                width = target.width,
                elapsed_ms,
                "Render timed out but the target had content; using degraded output"
            ),
            Ok(outcome) => info!(
                target = "application::render::engine",
                op = "engine::render_attempt",
                result = outcome.state.as_str(),
                page = target.page,
                width = target.width,
                bytes = outcome.bytes.len(),
                elapsed_ms,
                "Render attempt succeeded"
            ),
            Err(err) => warn!(
                target = "application::render::engine",
                op = "engine::render_attempt",
                result = failure_state(err).as_str(),
                error_code = err.code(),
                page = target.page,
                width = target.width,
                elapsed_ms,
                error = %err,
                "Render attempt failed"
            ),
        }

        result
    }

    async fn drive(
        &self,
        session: &mut PooledSession,
        target: &RenderTarget,
        source_url: Url,
        started: Instant,
    ) -> Result<AttemptOutcome, EngineError> {
        trace_state(AttemptState::Loading, target);
        let job = harness::build_job(
            source_url,
            target.page,
            target.width,
            self.options.base_unit,
            &self.options.assets,
        );
        let RenderSignals {
            mut success,
            mut error,
        } = session.session_mut()?.load(&job).await?;

        trace_state(AttemptState::Rendering, target);
        let state = tokio::select! {
            Ok(()) = &mut success => AttemptState::Succeeded,
            Ok(message) = &mut error => return Err(EngineError::Harness(message)),
            _ = tokio::time::sleep(self.options.render_timeout) => {
                if session.session_mut()?.probe().await? {
                    AttemptState::TimedOutWithContent
                } else {
                    return Err(EngineError::TimedOutEmpty {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        };

        let bytes = session
            .session_mut()?
            .capture(target.format, target.quality)
            .await?;
        if bytes.is_empty() {
            return Err(EngineError::Protocol("capture returned no bytes".to_string()));
        }

        Ok(AttemptOutcome { bytes, state })
    }
}

fn failure_state(err: &EngineError) -> AttemptState {
    match err {
        EngineError::TimedOutEmpty { .. } => AttemptState::TimedOutEmpty,
        _ => AttemptState::Errored,
    }
}

fn trace_state(state: AttemptState, target: &RenderTarget) {
    debug!(
        target = "application::render::engine",
        op = "engine::render_attempt",
        state = state.as_str(),
        page = target.page,
        "Render attempt state"
    );
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::Ordering};

    use super::testing::{Script, ScriptedCapability};
    use super::*;

    fn engine(capability: Arc<ScriptedCapability>, timeout_ms: u64) -> RenderEngine {
        let pool = SessionPool::new(Arc::new(capability), 2, 1, Duration::from_secs(1));
        RenderEngine::new(
            pool,
            EngineOptions {
                render_timeout: Duration::from_millis(timeout_ms),
                base_unit: 612,
                assets: HarnessAssets {
                    pdfjs_url: "pdf.mjs".to_string(),
                    worker_url: "pdf.worker.mjs".to_string(),
                },
            },
        )
    }

    fn signer() -> UrlSigner {
        UrlSigner::new(
            b"engine-secret".to_vec(),
            Url::parse("http://localhost").expect("url"),
            Duration::from_secs(60),
        )
    }

    fn target() -> RenderTarget {
        RenderTarget {
            source_key: "sources/doc.pdf".to_string(),
            page: 1,
            width: 1200,
            format: ImageFormat::Webp,
            quality: 85,
        }
    }

    #[tokio::test]
    async fn success_signal_captures_and_reuses_session() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Succeed(b"img")]));
        let engine = engine(Arc::clone(&capability), 1_000);

        let outcome = engine.render_attempt(&target(), &signer()).await.expect("render");
        assert_eq!(outcome.state, AttemptState::Succeeded);
        assert_eq!(outcome.bytes, Bytes::from_static(b"img"));

        engine.render_attempt(&target(), &signer()).await.expect("render");
        assert_eq!(capability.launches.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pool().idle_count(), 1);
    }

    #[tokio::test]
    async fn error_signal_discards_session() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Fail("bad pdf")]));
        let engine = engine(Arc::clone(&capability), 1_000);

        let err = engine.render_attempt(&target(), &signer()).await.expect_err("must fail");
        assert_eq!(err, EngineError::Harness("bad pdf".to_string()));
        assert_eq!(capability.closes.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pool().idle_count(), 0);
    }

    #[tokio::test]
    async fn timeout_with_content_is_degraded_success() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Hang {
            has_content: true,
        }]));
        let engine = engine(Arc::clone(&capability), 20);

        let outcome = engine.render_attempt(&target(), &signer()).await.expect("render");
        assert_eq!(outcome.state, AttemptState::TimedOutWithContent);
        assert!(outcome.degraded());
        // Timed-out sessions are never reused.
        assert_eq!(capability.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn harness_loads_a_signed_source_url() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Succeed(b"img")]));
        let engine = engine(Arc::clone(&capability), 1_000);

        engine.render_attempt(&target(), &signer()).await.expect("render");
        let sources = capability.sources.lock().expect("sources lock");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].path(), "/source/sources/doc.pdf");
        assert!(sources[0].query().is_some_and(|query| query.contains("signature=")));
    }

    #[tokio::test]
    async fn unsignable_source_fails_without_loading() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Succeed(b"img")]));
        let engine = engine(Arc::clone(&capability), 1_000);
        let target = RenderTarget {
            source_key: "../escape.pdf".to_string(),
            ..target()
        };

        let err = engine.render_attempt(&target, &signer()).await.expect_err("must fail");
        assert_eq!(err.code(), "signing");
        assert_eq!(capability.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_without_content_fails() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Hang {
            has_content: false,
        }]));
        let engine = engine(Arc::clone(&capability), 20);

        let err = engine.render_attempt(&target(), &signer()).await.expect_err("must fail");
        assert!(matches!(err, EngineError::TimedOutEmpty { .. }));
    }
}
