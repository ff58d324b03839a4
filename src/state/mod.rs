//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `QuotaTracker`: remaining request budget and reset time for one credential
//! - `PartitionState`: the per-partition crawl state machine
//! - `Clock`: time source shared by quota decisions and record timestamps

mod clock;
mod partition_state;
mod quota;

// Re-export main types
pub use clock::{Clock, SystemClock, TokioClock};
pub use partition_state::PartitionState;
pub use quota::{QuotaSnapshot, QuotaTracker};
