//! Pure decision logic for warden cycles. No I/O.

pub mod decision;
pub mod launch;
pub mod types;
