pub mod error;
pub mod frame;
pub mod media;
pub mod messages;

pub use error::{ErrorCode, WorkerExit, classify_worker_exit};
pub use frame::{Packet, Parser};
pub use messages::Message;

/// Pack a semantic version into one comparable integer.
pub fn combine_version(major: i32, minor: i32, patch: i32) -> i64 {
    major as i64 * 1_000_000 + minor as i64 * 1_000 + patch as i64
}

/// The oldest peer version this host will talk to.
pub const REQUIRED_PEER_VERSION: i64 = combine_version_const(0, 3, 3);

const fn combine_version_const(major: i32, minor: i32, patch: i32) -> i64 {
    major as i64 * 1_000_000 + minor as i64 * 1_000 + patch as i64
}
