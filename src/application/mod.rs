//! Application services: the render pipeline and the ports it depends on.

pub mod error;
pub mod rate_limit;
pub mod render;
pub mod repos;
pub mod signer;
