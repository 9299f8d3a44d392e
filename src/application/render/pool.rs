//! Bounded pool of render sessions.
//!
//! A semaphore caps the number of live sessions. Healthy sessions go back to
//! an idle set of at most `max_idle` entries; everything else is closed.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use metrics::{counter, gauge};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::util::lock::mutex_lock;

use super::engine::{EngineError, RenderCapability, RenderSession};

const LOCK_TARGET: &str = "application::render::pool";
const METRIC_IDLE_SESSIONS: &str = "stave_engine_idle_sessions";
const METRIC_SESSION_LAUNCH: &str = "stave_engine_session_launch_total";

#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capability: Arc<dyn RenderCapability>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn RenderSession>>>,
    max_idle: usize,
    launch_timeout: Duration,
}

impl SessionPool {
    pub fn new(
        capability: Arc<dyn RenderCapability>,
        max_sessions: usize,
        max_idle: usize,
        launch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capability,
                permits: Arc::new(Semaphore::new(max_sessions.max(1))),
                idle: Mutex::new(Vec::new()),
                max_idle,
                launch_timeout,
            }),
        }
    }

    /// Take an idle session or launch a new one, waiting for capacity.
    pub async fn acquire(&self) -> Result<PooledSession, EngineError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::PoolClosed)?;

        let idle = {
            let mut idle = mutex_lock(&self.inner.idle, LOCK_TARGET, "acquire");
            let session = idle.pop();
            gauge!(METRIC_IDLE_SESSIONS).set(idle.len() as f64);
            session
        };
        let session = match idle {
            Some(session) => session,
            None => {
                let launched = tokio::time::timeout(
                    self.inner.launch_timeout,
                    self.inner.capability.launch(),
                )
                .await
                .map_err(|_| {
                    EngineError::Launch(format!(
                        "no session after {}ms",
                        self.inner.launch_timeout.as_millis()
                    ))
                })??;
                counter!(METRIC_SESSION_LAUNCH).increment(1);
                debug!(
                    target = "application::render::pool",
                    op = "pool::acquire",
                    result = "launched",
                    "Launched render session"
                );
                launched
            }
        };

        Ok(PooledSession {
            session: Some(session),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    pub fn idle_count(&self) -> usize {
        mutex_lock(&self.inner.idle, LOCK_TARGET, "idle_count").len()
    }

    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Stop handing out sessions and close the idle ones.
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        let idle: Vec<_> = mutex_lock(&self.inner.idle, LOCK_TARGET, "shutdown")
            .drain(..)
            .collect();
        for session in idle {
            session.close().await;
        }
    }
}

/// A checked-out session. Call [`release`](Self::release) after a clean
/// render or [`discard`](Self::discard) otherwise; dropping the guard closes
/// the session in the background.
pub struct PooledSession {
    session: Option<Box<dyn RenderSession>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub fn session_mut(&mut self) -> Result<&mut (dyn RenderSession + 'static), EngineError> {
        self.session
            .as_deref_mut()
            .ok_or(EngineError::SessionClosed)
    }

    pub async fn release(mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if self.pool.max_idle == 0 || self.pool.permits.is_closed() {
            session.close().await;
            return;
        }

        if let Err(err) = session.reset().await {
            warn!(
                target = "application::render::pool",
                op = "pool::release",
                result = "reset_failed",
                error = %err,
                "Closing render session that failed to reset"
            );
            session.close().await;
            return;
        }

        let overflow = {
            let mut idle = mutex_lock(&self.pool.idle, LOCK_TARGET, "release");
            let overflow = if idle.len() < self.pool.max_idle {
                idle.push(session);
                None
            } else {
                Some(session)
            };
            gauge!(METRIC_IDLE_SESSIONS).set(idle.len() as f64);
            overflow
        };
        if let Some(session) = overflow {
            session.close().await;
        }
    }

    pub async fn discard(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(session.close());
            }
            Err(_) => warn!(
                target = "application::render::pool",
                op = "pool::drop",
                result = "leaked",
                "Render session dropped outside a runtime; relying on process cleanup"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::application::render::engine::testing::{Script, ScriptedCapability};

    fn pool(capability: &Arc<ScriptedCapability>, max_sessions: usize, max_idle: usize) -> SessionPool {
        SessionPool::new(
            Arc::new(Arc::clone(capability)),
            max_sessions,
            max_idle,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn released_sessions_are_reused() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Succeed(b"x")]));
        let pool = pool(&capability, 2, 1);

        pool.acquire().await.expect("acquire").release().await;
        pool.acquire().await.expect("acquire").release().await;

        assert_eq!(capability.launches.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn zero_idle_makes_sessions_ephemeral() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Succeed(b"x")]));
        let pool = pool(&capability, 2, 0);

        pool.acquire().await.expect("acquire").release().await;
        pool.acquire().await.expect("acquire").release().await;

        assert_eq!(capability.launches.load(Ordering::SeqCst), 2);
        assert_eq!(capability.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn capacity_is_bounded_until_release() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Succeed(b"x")]));
        let pool = pool(&capability, 1, 1);

        let held = pool.acquire().await.expect("acquire");
        assert_eq!(pool.available(), 0);
        let waiting = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(waiting.is_err());

        held.discard().await;
        assert_eq!(pool.available(), 1);
        pool.acquire().await.expect("acquire after release").discard().await;
    }

    #[tokio::test]
    async fn dropped_guard_closes_session() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Succeed(b"x")]));
        let pool = pool(&capability, 1, 1);

        drop(pool.acquire().await.expect("acquire"));
        for _ in 0..50 {
            if capability.closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(capability.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_idle_sessions_and_rejects_acquire() {
        let capability = Arc::new(ScriptedCapability::new(vec![Script::Succeed(b"x")]));
        let pool = pool(&capability, 1, 1);
        pool.acquire().await.expect("acquire").release().await;

        pool.shutdown().await;
        assert_eq!(capability.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.acquire().await, Err(EngineError::PoolClosed)));
    }
}
