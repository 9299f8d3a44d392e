//! Infrastructure adapters and runtime bootstrap.

pub mod counters;
pub mod db;
pub mod documents;
pub mod engine;
pub mod error;
pub mod http;
pub mod storage;
pub mod telemetry;
