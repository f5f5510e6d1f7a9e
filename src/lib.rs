//! Learning pipeline sample sender
//!
//! Decouples a real-time producer (a camera pipeline) from the learning
//! pipeline API. Samples go through a single-worker task queue with a
//! configurable backpressure policy, and are uploaded with token
//! authentication and bounded retry.

pub mod config;
pub mod models;
pub mod services;
