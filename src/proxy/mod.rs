//! Upstream calling and SSE relaying.
//!
//! `relay` owns the failover loop; `endpoints` builds per-platform URLs and
//! headers; `respond` translates upstream SSE into the common event shape
//! with exact client framing.

pub mod endpoints;
mod relay;
mod respond;
mod upstream_retry;

pub use endpoints::validate_base_url;
pub use relay::{RelayRequest, relay};

pub const UPSTREAM_BODY_PREVIEW_CHARS: usize = 300;
