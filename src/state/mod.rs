//! State Management Module
//!
//! Role/sync state ownership, the pure election resolver, and the
//! per-node owning task that drives both.

pub mod machine;
mod node;
pub mod resolver;

pub use machine::{HeartbeatSample, StateHandle};
pub use node::{NodeView, Role, SyncState};
pub use resolver::{Decision, ElectionInputs, MasterIs, PeerReport};
