//! Proxyvisor - control service for a supervised reverse proxy
//!
//! This library provides:
//! - Persistent virtual-server records (display name, enable flag, config fragment)
//! - Rendering of the enabled records into a complete proxy configuration
//! - Supervision of a single proxy process: start, stop, status, output forwarding
//! - Most-recent-first access to the proxy's structured JSON access log
//! - An HTTP control API over all of the above

pub mod api;
pub mod config;
pub mod error;
pub mod render;
pub mod service;
pub mod store;
pub mod supervisor;

#[cfg(all(test, unix))]
mod test_support;
