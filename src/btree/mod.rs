//! The B+-tree engine: nodes, the node cache and six-mode lock, paths,
//! per-tree storage wiring, and the cursor iterator (spec §4.D).

pub mod cache;
pub mod iter;
pub mod key_cache;
pub mod node;
pub mod path;
pub mod store;
