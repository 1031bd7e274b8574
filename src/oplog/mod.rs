//! Oplog Module
//!
//! Ordered, size-bounded log of write operations used for replication
//! between the two data nodes of a pair.

pub mod entry;
mod log;

pub use entry::{OplogEntry, Position};
pub use log::Oplog;
