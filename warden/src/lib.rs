//! Self-updating watchdog for a supervisor-managed process.
//!
//! Every interval warden pulls the process's checkout, reinstalls dependencies
//! and restarts the process when the revision changed, then asks the process
//! supervisor whether the process is `online`, pings a success or failure
//! health-check URL and relaunches the process when it is not. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure decisions (revision comparison, status classification,
//!   launch arguments). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (git, subprocesses, pm2, HTTP, state files).
//!   Traits at the supervisor/health/notify/test seams enable fakes in tests.
//!
//! Orchestration modules ([`cycle`], [`watch`]) coordinate core logic with I/O
//! to implement CLI commands.

pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watch;
