//! A copy-on-write B+-tree storage engine: bucket allocator, write-ahead
//! journal, and a restart-not-block transaction engine tying them
//! together (see the module docs under `fs` for the public entry points).

pub mod alloc;
pub mod bkey;
pub mod bpos;
pub mod btree;
pub mod btree_id;
pub mod bucket;
pub mod codec;
pub mod device;
pub mod dump;
pub mod error;
pub mod fs;
pub mod journal;
pub mod options;
pub mod superblock;
pub mod trans;
