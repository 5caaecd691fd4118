//! Replication Module
//!
//! Spawning and supervising child automata in isolated sandboxes.

pub mod lifecycle;
pub mod lineage;
pub mod spawn;

pub use lifecycle::{can_transition, is_valid_wallet_address, ChildState};
pub use lineage::{get_lineage, get_lineage_summary, prune_dead_children, LineageInfo};
pub use spawn::{cleanup, spawn_child, DEFAULT_CHILD_FUNDING_CENTS};
