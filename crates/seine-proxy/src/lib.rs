//! Intercepting forward proxy for the seine capture toolkit.
//!
//! This crate hosts the data plane — an HTTP/1.1 forward proxy with
//! CONNECT tunneling and optional TLS interception against a local CA —
//! plus the control/observer API. Captured exchanges flow through
//! [`pipeline::CapturePipeline`] into the `seine` core: sanitized, pushed
//! into the live ring, and appended to the active session off the hot
//! path.

pub mod api;
pub mod ca;
pub mod codec;
pub mod config;
mod error;
pub mod forward;
pub mod pipeline;
pub mod server;
pub mod tunnel;
pub mod upstream;

pub use ca::CertificateAuthority;
pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use pipeline::CapturePipeline;
pub use server::{ProxyContext, ProxyServer};
