//! Survival Module
//!
//! Tier classification and restrictions. To exist, the runtime must pay
//! for its compute.

pub mod governor;
