mod support;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use stave::{
    application::{
        rate_limit::RateLimitRecord,
        render::{EngineError, EngineMode, RenderError},
        repos::{CounterStore, ObjectStore, RepoError, Versioned},
    },
    domain::render::CacheStatus,
    infra::counters::MemoryCounterStore,
};

use support::{
    Outcome, PNG_BYTES, StubCapability, configured, configured_with_sessions, fixture,
    fixture_with, signer_with_ttl, wait_for_object,
};

#[tokio::test]
async fn transient_failure_is_retried_then_served_from_cache() {
    let capability = StubCapability::new(vec![
        Outcome::Fail("pdf.js worker crashed"),
        Outcome::Succeed(PNG_BYTES),
    ]);
    let fx = fixture(configured(&capability), 30).await;

    let first = fx
        .coordinator
        .render_page("doc_42", 1, 1200, "webp", 85)
        .await
        .expect("render after one retry");
    assert_eq!(first.cache_status, CacheStatus::Miss);
    assert_eq!(first.bytes.as_ref(), PNG_BYTES);
    assert_eq!(first.content_type, "image/webp");
    assert!(!first.degraded);
    assert_eq!(capability.loads(), 2);

    wait_for_object(&fx.objects, "renders/doc_42/page-1.webp").await;
    let written = fx.objects.list("renders/doc_42/").await.expect("list");
    assert_eq!(written.len(), 1);

    let second = fx
        .coordinator
        .render_page("doc_42", 1, 1200, "webp", 85)
        .await
        .expect("cached render");
    assert_eq!(second.cache_status, CacheStatus::Hit);
    assert_eq!(second.bytes, first.bytes);
    assert_eq!(capability.loads(), 2, "a hit never reaches the engine");
}

#[tokio::test]
async fn non_canonical_widths_use_the_variant_namespace() {
    let capability = StubCapability::new(vec![Outcome::Succeed(PNG_BYTES)]);
    let fx = fixture(configured(&capability), 30).await;

    fx.coordinator
        .render_page("doc_42", 2, 800, "png", 90)
        .await
        .expect("variant render");
    wait_for_object(&fx.objects, "variants/doc_42/page-2-w800-q90.png").await;

    let status = fx
        .coordinator
        .render_status("doc_42")
        .await
        .expect("status");
    assert!(status.cached_pages.is_empty(), "variants are not canonical pages");
}

#[tokio::test]
async fn exhausted_retries_report_the_last_error() {
    let capability = StubCapability::new(vec![Outcome::Fail("font missing")]);
    let fx = fixture(configured(&capability), 30).await;

    let err = fx
        .coordinator
        .render_page("doc_42", 1, 1200, "webp", 85)
        .await
        .expect_err("every attempt fails");
    match err {
        RenderError::Failed {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_error, EngineError::Harness("font missing".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(capability.loads(), 3);
    assert!(
        fx.objects
            .list("renders/doc_42/")
            .await
            .expect("list")
            .is_empty()
    );
}

#[tokio::test]
async fn unknown_documents_never_reach_the_engine() {
    let capability = StubCapability::new(vec![Outcome::Succeed(PNG_BYTES)]);
    let fx = fixture(configured(&capability), 30).await;

    let err = fx
        .coordinator
        .render_page("doc_missing", 1, 1200, "webp", 85)
        .await
        .expect_err("unknown document");
    assert!(matches!(err, RenderError::NotFound(_)));

    let err = fx
        .coordinator
        .render_page("doc_42", 1, 50, "webp", 85)
        .await
        .expect_err("width below bounds");
    assert!(matches!(err, RenderError::Validation(_)));
    assert_eq!(capability.loads(), 0);
}

#[tokio::test]
async fn timeout_with_content_is_a_degraded_success() {
    let capability = StubCapability::new(vec![Outcome::Hang { has_content: true }]);
    let fx = fixture(configured(&capability), 30).await;

    let image = fx
        .coordinator
        .render_page("doc_42", 1, 1200, "webp", 85)
        .await
        .expect("partial render is usable");
    assert!(image.degraded);
    assert_eq!(image.cache_status, CacheStatus::Miss);
    assert_eq!(image.bytes.as_ref(), b"partial");
    assert_eq!(capability.loads(), 1);
}

#[tokio::test]
async fn timeout_without_content_is_retried() {
    let capability = StubCapability::new(vec![
        Outcome::Hang { has_content: false },
        Outcome::Succeed(PNG_BYTES),
    ]);
    let fx = fixture(configured(&capability), 30).await;

    let image = fx
        .coordinator
        .render_page("doc_42", 1, 1200, "webp", 85)
        .await
        .expect("second attempt succeeds");
    assert!(!image.degraded);
    assert_eq!(capability.loads(), 2);
}

#[tokio::test]
async fn placeholders_only_when_engine_is_disabled() {
    let fx = fixture(EngineMode::Disabled { placeholders: true }, 30).await;
    let image = fx
        .coordinator
        .render_page("doc_42", 3, 600, "webp", 85)
        .await
        .expect("placeholder");
    assert_eq!(image.cache_status, CacheStatus::Placeholder);
    assert_eq!(image.content_type, "image/svg+xml");
    assert!(
        fx.objects
            .list("variants/doc_42/")
            .await
            .expect("list")
            .is_empty(),
        "placeholders are never cached"
    );

    let fx = fixture(EngineMode::Disabled { placeholders: false }, 30).await;
    let err = fx
        .coordinator
        .render_page("doc_42", 1, 1200, "webp", 85)
        .await
        .expect_err("no engine and no placeholders");
    assert!(matches!(err, RenderError::EngineUnavailable));
}

#[tokio::test]
async fn misses_beyond_the_limit_are_throttled() {
    let fx = fixture(EngineMode::Disabled { placeholders: true }, 2).await;

    for _ in 0..2 {
        fx.coordinator
            .render_page("doc_42", 1, 1200, "webp", 85)
            .await
            .expect("within limit");
    }
    let err = fx
        .coordinator
        .render_page("doc_42", 1, 1200, "webp", 85)
        .await
        .expect_err("third miss is throttled");
    match err {
        RenderError::RateLimited { retry_after } => assert!(!retry_after.is_zero()),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn status_and_purge_track_cached_artifacts() {
    let capability = StubCapability::new(vec![Outcome::Succeed(PNG_BYTES)]);
    let fx = fixture(configured(&capability), 30).await;

    for page in [2, 1] {
        fx.coordinator
            .render_page("doc_42", page, 1200, "webp", 85)
            .await
            .expect("render");
        wait_for_object(&fx.objects, &format!("renders/doc_42/page-{page}.webp")).await;
    }
    fx.coordinator
        .render_thumbnail("doc_42")
        .await
        .expect("thumbnail");
    wait_for_object(&fx.objects, "thumbnails/doc_42.webp").await;

    let status = fx
        .coordinator
        .render_status("doc_42")
        .await
        .expect("status");
    assert_eq!(status.cached_pages, vec![1, 2]);
    assert!(status.has_thumbnail);
    assert!(status.engine_available);

    let removed = fx
        .coordinator
        .invalidate_document("doc_42")
        .await
        .expect("purge");
    assert_eq!(removed, 3);

    let status = fx
        .coordinator
        .render_status("doc_42")
        .await
        .expect("status");
    assert!(status.cached_pages.is_empty());
    assert!(!status.has_thumbnail);
    assert!(
        fx.objects
            .head("sources/doc_42.pdf")
            .await
            .expect("head")
            .is_some(),
        "sources survive a purge"
    );
}

#[tokio::test]
async fn source_url_is_signed_after_waiting_for_a_session() {
    let capability = StubCapability::new(vec![Outcome::Succeed(PNG_BYTES)]);
    let engine = configured_with_sessions(&capability, 1);
    let EngineMode::Configured(render_engine) = &engine else {
        panic!("engine should be configured");
    };
    let held = render_engine
        .pool()
        .acquire()
        .await
        .expect("hold the only session");

    let signer = signer_with_ttl(Duration::from_secs(2));
    let fx = fixture_with(
        engine.clone(),
        30,
        signer.clone(),
        Arc::new(MemoryCounterStore::new()),
    )
    .await;
    let coordinator = Arc::clone(&fx.coordinator);
    let render = tokio::spawn(async move {
        coordinator
            .render_page("doc_42", 1, 1200, "webp", 85)
            .await
    });

    // Queue on the semaphore for longer than the URL lifetime.
    tokio::time::sleep(Duration::from_secs(3)).await;
    held.discard().await;
    render
        .await
        .expect("render task")
        .expect("render after the session frees up");

    let sources = capability.sources();
    assert_eq!(sources.len(), 1);
    let url = &sources[0];
    let param = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .expect("query parameter")
    };
    let expires: i64 = param("expires").parse().expect("expires");
    signer
        .verify("sources/doc_42.pdf", expires, &param("signature"))
        .expect("url handed to the harness is still valid");
}

/// Counter store with a network-like round trip on every call.
struct RemoteCounters {
    inner: MemoryCounterStore,
}

#[async_trait]
impl CounterStore for RemoteCounters {
    async fn get(&self, key: &str) -> Result<Option<Versioned<RateLimitRecord>>, RepoError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.inner.get(key).await
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<i64>,
        record: &RateLimitRecord,
        ttl: Duration,
    ) -> Result<bool, RepoError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.inner.compare_and_put(key, expected, record, ttl).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_on_one_document_respect_the_limit() {
    let fx = fixture_with(
        EngineMode::Disabled { placeholders: true },
        10,
        support::signer(),
        Arc::new(RemoteCounters {
            inner: MemoryCounterStore::new(),
        }),
    )
    .await;

    let requests: Vec<_> = (0..64)
        .map(|_| {
            let coordinator = Arc::clone(&fx.coordinator);
            tokio::spawn(async move {
                coordinator
                    .render_page("doc_42", 1, 1200, "webp", 85)
                    .await
            })
        })
        .collect();

    let mut served = 0;
    for request in requests {
        match request.await.expect("request task") {
            Ok(_) => served += 1,
            Err(RenderError::RateLimited { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(served, 10);
}
