//! Stable exit codes for shipgate CLI commands.

/// Command succeeded; `build` shipped.
pub const OK: i32 = 0;
/// Invalid input, rejected transition, or an I/O failure.
pub const INVALID: i32 = 1;
/// `build` stopped before testing (missing target, hash mismatch, gate, review)
/// or `exec` was blocked by policy.
pub const BLOCKED: i32 = 2;
/// `build` ended in FAILED, or `exec` ran and failed.
pub const FAILED: i32 = 3;
