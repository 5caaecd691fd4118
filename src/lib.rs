//! MoneyClaw -- Credit-Governed Agent Runtime
//!
//! A long-running autonomous agent that pays for its own compute,
//! throttles itself as credits drain, and can replicate into isolated
//! sandboxes.

pub mod agent;
pub mod config;
pub mod conway;
pub mod heartbeat;
pub mod inference;
pub mod registry;
pub mod replication;
pub mod state;
pub mod survival;
pub mod types;
