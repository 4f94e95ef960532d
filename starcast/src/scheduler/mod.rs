//! Calendar-driven jobs.

mod digest;

pub use digest::{Cadence, DigestScheduler};
