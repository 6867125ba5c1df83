//! Offline caching and sync for a single web application.
//!
//! - [`worker`]: versioned request interceptor with per-class strategies
//! - [`feed`]: structured snapshot of the content feed with a staleness window
//! - [`connectivity`]: online/offline flag fed by platform signals
//! - [`sync`]: periodic poll of the server's pending-mutation count

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod feed;
pub mod http;
pub mod sync;
pub mod worker;
