//! Page rendering pipeline.
//!
//! The coordinator validates a request, serves it from the artifact cache when
//! possible, and otherwise drives the rendering capability under a bounded
//! retry policy before caching the result in the background.

mod coordinator;
pub mod engine;
pub mod harness;
pub mod placeholder;
pub mod pool;
pub mod retry;

use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::application::repos::RepoError;
use crate::domain::error::DomainError;

pub use coordinator::{RenderCoordinator, RenderDefaults};
pub use engine::{
    AttemptOutcome, AttemptState, EngineError, EngineOptions, RenderCapability, RenderEngine,
    RenderSession, RenderSignals, RenderTarget,
};
pub use harness::{HarnessAssets, HarnessJob};
pub use pool::{PooledSession, SessionPool};
pub use retry::{RetryError, RetryPolicy};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid render request: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("no rendering capability is configured")]
    EngineUnavailable,
    #[error("transient render failure: {0}")]
    Transient(#[source] EngineError),
    #[error("render rate limit exceeded; retry after {}s", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },
    #[error("render failed after {attempts} attempt(s): {last_error}")]
    Failed {
        attempts: u32,
        #[source]
        last_error: EngineError,
    },
    #[error(transparent)]
    Repository(#[from] RepoError),
}

impl RenderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RenderError::Transient(_))
    }
}

impl From<DomainError> for RenderError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::Validation { message } => RenderError::Validation(message),
            DomainError::NotFound { entity } => RenderError::NotFound(entity.to_string()),
        }
    }
}

/// How the coordinator produces bytes on a cache miss, fixed at construction.
#[derive(Clone)]
pub enum EngineMode {
    Configured(Arc<RenderEngine>),
    /// No capability. With `placeholders` set, misses get a placeholder image;
    /// otherwise they fail with [`RenderError::EngineUnavailable`].
    Disabled { placeholders: bool },
}

impl EngineMode {
    pub fn is_available(&self) -> bool {
        matches!(self, EngineMode::Configured(_))
    }
}
