//! HTTP request/response types and the network seam.
//!
//! The interceptor never talks to reqwest directly; it goes through the
//! `Network` trait so tests can script network behaviour.

pub mod client;
pub mod types;

pub use client::{Network, NetworkError, ReqwestNetwork};
pub use types::{CachedResponse, Request, Response};

#[cfg(test)]
pub(crate) mod testing;
