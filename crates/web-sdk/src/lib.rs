//! Pulse web SDK: client-side event tracking with privacy-aware context,
//! rotating sessions, dual-path delivery and passive bandwidth sampling.
//!
//! # Modules
//!
//! - [`tracker`]: Public entry point: `track` and its level wrappers
//! - [`sanitize`]: Redaction of sensitive query parameters from URLs
//! - [`user_agent`]: Bot, browser, OS and device classification
//! - [`context`]: Environment context subject to privacy flags
//! - [`session`]: Session id with sliding 30-minute inactivity expiry
//! - [`transport`]: Beacon-first delivery with an HTTP fallback
//! - [`bandwidth`]: Resource-timing batcher with periodic and eager flushes

pub mod bandwidth;
pub mod context;
pub mod pipeline;
pub mod sanitize;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod user_agent;

pub use bandwidth::{BandwidthBatcher, BandwidthBuffer};
pub use context::ContextBuilder;
pub use sanitize::{sanitize_resource_url, sanitize_url};
pub use session::SessionTracker;
pub use tracker::{Tracker, TrackerBuilder};
pub use transport::Transport;
pub use user_agent::classify;
