//! # seine
//!
//! The `seine` crate is the capture core of a local HTTP(S) observation
//! toolkit. It models captured exchanges, scrubs sensitive material out of
//! them, keeps a bounded in-memory ring with live fan-out, persists
//! bounded session logs as NDJSON, and derives per-route API catalogs.
//!
//! The capture path is strictly one-way:
//!
//! ```text
//! proxy ⇒ sanitize ⇒ ring ⇒ subscribers
//!                 ⇘ session append (detached)
//! ```
//!
//! Offline, session logs fold into [`report::RouteReport`]s and merge into
//! a [`catalog::RouteCatalog`]. Nothing in this crate blocks the hot path
//! on disk or on a slow subscriber.
//!
//! The intercepting proxy servers that feed this crate live in
//! `seine-proxy`.

pub mod catalog;
mod errors;
pub mod export;
pub mod normalize;
pub mod record;
pub mod report;
pub mod ring;
pub mod sanitize;
pub mod session;

pub use errors::{Error, Result};
pub use record::{BodyCapture, CapturedRequest, CapturedResponse, LogRecord, DEFAULT_BODY_LIMIT};
pub use ring::{LogRing, Subscription, DEFAULT_RING_CAPACITY};
pub use sanitize::{sanitize, MASK};
pub use session::{SessionMeta, SessionStore};
