//! Conway Module
//!
//! Client for the Conway control plane: sandboxes and credits.

mod client;

pub use client::ConwayHttpClient;
