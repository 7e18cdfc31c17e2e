//! Matrixon Testkit Library
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//! Date: 2024-12-11
//!
//! Test harness for the Matrix Client-Server API. Integration tests drive a
//! homeserver through [`Client`]: register users, create and join rooms,
//! send events, and then wait for federated state to converge by polling
//! `/sync` with a set of [`checks`] until every expected fact is visible.
//!
//! The harness is deliberately not a general-purpose Matrix client. Sync
//! envelopes stay untyped JSON, nothing is cached between calls, and every
//! failure is fatal to the operation that hit it, so a broken server shows
//! up as a precise test failure rather than a silent retry.

pub mod checks;
pub mod client;
pub mod error;
pub mod event;
pub mod http;
pub mod json;
pub mod sync;

pub use client::Client;
pub use error::{Error, Result};
pub use event::Event;
pub use http::{ApiResponse, RequestOptions};
pub use sync::{SyncCheck, SyncRequest};

// Re-export the crates test code needs alongside the harness.
pub use ruma;
pub use serde_json;
