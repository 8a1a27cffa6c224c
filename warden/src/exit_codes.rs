//! Stable exit codes for warden CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config/arguments or other errors.
pub const INVALID: i32 = 1;
/// `warden test` ran and the tests failed or timed out.
pub const TESTS_FAILED: i32 = 2;
/// `warden cycle` finished but the process was not online.
pub const NOT_ONLINE: i32 = 3;
