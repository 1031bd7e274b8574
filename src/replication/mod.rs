//! Replication Module
//!
//! Oplog streaming between the master and slave sides of the pair, plus
//! the full-copy resync path.

mod master;
pub mod protocol;
pub mod resync;
pub mod slave;

pub use master::MasterService;
pub use protocol::{ErrorCode, FrameHeader, Message, ProcessKind, StatusReport};
pub use resync::ResyncController;
pub use slave::SlaveLoop;
