//! Stable exit codes for `conductor` CLI commands.

pub const OK: i32 = 0;
/// Invalid arguments, config, or any unexpected failure.
pub const INVALID: i32 = 1;
/// `locks acquire` found the lock held and did not wait.
pub const LOCK_HELD: i32 = 2;
/// `locks acquire` gave up after its timeout.
pub const LOCK_TIMEOUT: i32 = 3;
