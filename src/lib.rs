//! Turnstile - Per-Key Admission Control
//!
//! This crate implements a token bucket rate limiter keyed by client address.
//! Buckets live in a concurrent registry, idle buckets are swept by a background
//! evictor, and an axum middleware turns rejected checks into `429` responses.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
