//! Stave renders pages of stored PDF documents into cacheable raster images.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
mod util;
