//! Shared fixtures for the integration tests: an in-process render
//! capability and a coordinator wired to temporary storage.
#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use stave::{
    application::{
        rate_limit::{RateLimitPolicy, RateLimiter},
        render::{
            EngineError, EngineMode, EngineOptions, HarnessAssets, HarnessJob, RenderCapability,
            RenderCoordinator, RenderDefaults, RenderEngine, RenderSession, RenderSignals,
            RetryPolicy, SessionPool,
        },
        repos::{CounterStore, ObjectStore},
        signer::UrlSigner,
    },
    cache::{CacheStore, Rendition},
    domain::render::{ImageFormat, WidthBounds},
    infra::{
        counters::MemoryCounterStore, documents::StorageDocumentResolver, storage::FsObjectStore,
    },
};
use tempfile::TempDir;
use tokio::sync::oneshot;
use url::Url;

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nstave";

#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed(&'static [u8]),
    Fail(&'static str),
    /// Never signal; the target holds content when the flag is set.
    Hang { has_content: bool },
}

/// Plays a queue of outcomes, one per `load`; the last outcome repeats.
pub struct StubCapability {
    outcomes: Mutex<Vec<Outcome>>,
    pub loads: AtomicUsize,
    pub launches: AtomicUsize,
    sources: Mutex<Vec<Url>>,
}

impl StubCapability {
    pub fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
        let mut outcomes = outcomes;
        outcomes.reverse();
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            loads: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            sources: Mutex::new(Vec::new()),
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Source URLs handed to `load`, in order.
    pub fn sources(&self) -> Vec<Url> {
        self.sources.lock().expect("sources lock").clone()
    }

    fn next(&self) -> Outcome {
        let mut outcomes = self.outcomes.lock().expect("outcomes lock");
        if outcomes.len() > 1 {
            outcomes.pop().expect("outcome")
        } else {
            outcomes.last().cloned().expect("at least one outcome")
        }
    }
}

struct Handle(Arc<StubCapability>);

struct StubSession {
    owner: Arc<StubCapability>,
    current: Option<Outcome>,
    held: Vec<(oneshot::Sender<()>, oneshot::Sender<String>)>,
}

#[async_trait]
impl RenderCapability for Handle {
    async fn launch(&self) -> Result<Box<dyn RenderSession>, EngineError> {
        self.0.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubSession {
            owner: Arc::clone(&self.0),
            current: None,
            held: Vec::new(),
        }))
    }
}

#[async_trait]
impl RenderSession for StubSession {
    async fn load(&mut self, job: &HarnessJob) -> Result<RenderSignals, EngineError> {
        self.owner.loads.fetch_add(1, Ordering::SeqCst);
        self.owner
            .sources
            .lock()
            .expect("sources lock")
            .push(job.source_url.clone());
        let outcome = self.owner.next();
        let (success_tx, success) = oneshot::channel();
        let (error_tx, error) = oneshot::channel();
        match &outcome {
            Outcome::Succeed(_) => {
                let _ = success_tx.send(());
            }
            Outcome::Fail(message) => {
                let _ = error_tx.send((*message).to_string());
            }
            Outcome::Hang { .. } => self.held.push((success_tx, error_tx)),
        }
        self.current = Some(outcome);
        Ok(RenderSignals { success, error })
    }

    async fn probe(&mut self) -> Result<bool, EngineError> {
        Ok(matches!(self.current, Some(Outcome::Hang { has_content: true })))
    }

    async fn capture(&mut self, _format: ImageFormat, _quality: u8) -> Result<Bytes, EngineError> {
        match &self.current {
            Some(Outcome::Succeed(bytes)) => Ok(Bytes::from_static(bytes)),
            Some(Outcome::Hang { has_content: true }) => Ok(Bytes::from_static(b"partial")),
            _ => Err(EngineError::Protocol("nothing to capture".to_string())),
        }
    }

    async fn reset(&mut self) -> Result<(), EngineError> {
        self.current = None;
        self.held.clear();
        Ok(())
    }

    async fn close(self: Box<Self>) {}
}

pub fn configured(capability: &Arc<StubCapability>) -> EngineMode {
    configured_with_sessions(capability, 2)
}

pub fn configured_with_sessions(capability: &Arc<StubCapability>, max_sessions: usize) -> EngineMode {
    let pool = SessionPool::new(
        Arc::new(Handle(Arc::clone(capability))),
        max_sessions,
        1,
        Duration::from_secs(1),
    );
    EngineMode::Configured(Arc::new(RenderEngine::new(
        pool,
        EngineOptions {
            render_timeout: Duration::from_millis(100),
            base_unit: 612,
            assets: HarnessAssets {
                pdfjs_url: "pdf.mjs".to_string(),
                worker_url: "pdf.worker.mjs".to_string(),
            },
        },
    )))
}

pub fn defaults() -> RenderDefaults {
    RenderDefaults {
        bounds: WidthBounds::default(),
        canonical: Rendition {
            width: 1200,
            quality: 85,
            format: ImageFormat::Webp,
        },
        thumbnail: Rendition {
            width: 300,
            quality: 70,
            format: ImageFormat::Webp,
        },
    }
}

pub fn signer() -> UrlSigner {
    signer_with_ttl(Duration::from_secs(60))
}

pub fn signer_with_ttl(ttl: Duration) -> UrlSigner {
    UrlSigner::new(
        b"integration-test-secret".to_vec(),
        Url::parse("http://127.0.0.1:3000").expect("base url"),
        ttl,
    )
}

pub struct Fixture {
    pub dir: TempDir,
    pub objects: Arc<FsObjectStore>,
    pub coordinator: Arc<RenderCoordinator>,
}

/// Coordinator over a fresh storage root holding `sources/doc_42.pdf`.
pub async fn fixture(engine: EngineMode, max_requests: u32) -> Fixture {
    fixture_with(engine, max_requests, signer(), Arc::new(MemoryCounterStore::new())).await
}

/// Like [`fixture`], with an explicit signer and counter store.
pub async fn fixture_with(
    engine: EngineMode,
    max_requests: u32,
    signer: UrlSigner,
    counters: Arc<dyn CounterStore>,
) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let objects = Arc::new(FsObjectStore::new(dir.path()));
    objects
        .put(
            "sources/doc_42.pdf",
            Bytes::from_static(b"%PDF-1.7 doc_42"),
            "application/pdf",
        )
        .await
        .expect("seed source");

    let coordinator = RenderCoordinator::new(
        CacheStore::new(objects.clone()),
        RateLimiter::new(
            counters,
            RateLimitPolicy {
                window: Duration::from_secs(60),
                max_requests,
                max_penalty: 8,
                ban: Duration::from_secs(300),
            },
        ),
        Arc::new(StorageDocumentResolver::new(objects.clone())),
        signer,
        engine,
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
        },
        defaults(),
    );

    Fixture {
        dir,
        objects,
        coordinator: Arc::new(coordinator),
    }
}

/// Wait for a detached cache write to land.
pub async fn wait_for_object(objects: &FsObjectStore, key: &str) {
    for _ in 0..200 {
        if objects.head(key).await.expect("head").is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("object `{key}` was never written");
}
