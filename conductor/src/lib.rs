//! Coordination primitives for executors working on shared git worktrees.
//!
//! The crate is split the same way throughout:
//!
//! - **[`core`]**: Pure logic (lock naming and staleness, history records and
//!   the session views folded from them). No I/O.
//! - **[`io`]**: Side-effecting operations (lock files, the append-only history
//!   log, configuration, git, child processes).
//!
//! The long-running hub service builds on these in the `conductor-hub` crate.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
