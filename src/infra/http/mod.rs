mod error;
mod middleware;
mod render;

pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, codes};
pub use middleware::RequestContext;
pub use render::{AppState, build_router};
