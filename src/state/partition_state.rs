/// Partition state definitions for tracking crawl progress
///
/// A partition walks `Idle → Fetching → Writing → Checkpointing → Fetching → …`
/// until it reaches one of the terminal states.
use std::fmt;

/// Represents the current state of one partition's crawl loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionState {
    // ===== Active States =====
    /// Loading the checkpoint before the first request
    Idle,

    /// Waiting on the remote API for the next page
    Fetching,

    /// Routing page records into the batch writer
    Writing,

    /// Persisting the cursor after a successful flush
    Checkpointing,

    // ===== Terminal States =====
    /// The cursor sequence is exhausted
    Done,

    /// A non-recoverable fetch error; the last checkpoint stays valid
    Failed,

    /// Stopped between pages on request
    Cancelled,

    /// Stopped by a page, record or runtime limit
    BudgetReached,
}

impl PartitionState {
    /// Returns true if the loop has stopped in this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Cancelled | Self::BudgetReached
        )
    }

    /// Returns true if a later run should pick this partition up again
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Done)
    }

    /// Returns true if moving from `self` to `next` is a legal step
    ///
    /// Any active state may fail; the other terminal states are only reached
    /// between pages.
    pub fn can_transition_to(&self, next: PartitionState) -> bool {
        use PartitionState::*;

        if next == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Idle, Fetching)
                | (Idle, Done)
                | (Idle, Cancelled)
                | (Fetching, Writing)
                | (Fetching, Cancelled)
                | (Fetching, BudgetReached)
                | (Writing, Checkpointing)
                | (Writing, Fetching)
                | (Checkpointing, Fetching)
                | (Checkpointing, Done)
                | (Checkpointing, Cancelled)
                | (Checkpointing, BudgetReached)
        )
    }

    /// Converts the state to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Writing => "writing",
            Self::Checkpointing => "checkpointing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::BudgetReached => "budget_reached",
        }
    }

    /// Parses a state from its database string representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "fetching" => Some(Self::Fetching),
            "writing" => Some(Self::Writing),
            "checkpointing" => Some(Self::Checkpointing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "budget_reached" => Some(Self::BudgetReached),
            _ => None,
        }
    }

    /// All states, in lifecycle order
    pub fn all() -> [PartitionState; 8] {
        [
            Self::Idle,
            Self::Fetching,
            Self::Writing,
            Self::Checkpointing,
            Self::Done,
            Self::Failed,
            Self::Cancelled,
            Self::BudgetReached,
        ]
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}
