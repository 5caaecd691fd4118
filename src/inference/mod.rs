//! Inference Module
//!
//! Routing of chat requests across the configured provider families.
//! The runtime pays for its own thinking.

pub mod error;
pub mod http;
pub mod providers;
pub mod router;

pub use error::InferenceError;
pub use http::{HttpCapability, HttpRequest, HttpResponse, ReqwestHttp};
pub use router::{estimate_cost_cents, Router};
