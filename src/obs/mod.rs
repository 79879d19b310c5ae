//! OBS scene control over obs-websocket v5.
//!
//! This module provides:
//! - Message types for the subset of the protocol in use (`protocol`)
//! - The Identify authentication string (`auth`)
//! - A blocking client that lists and switches scenes (`client`)

pub mod auth;
pub mod client;
pub mod protocol;

pub use client::ObsClient;
