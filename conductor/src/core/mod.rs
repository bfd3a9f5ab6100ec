//! Deterministic logic with no I/O.
//!
//! Lock naming and staleness rules, session ids, and the history record
//! model with the session views folded from it.

pub mod history;
pub mod lock;
pub mod session;
