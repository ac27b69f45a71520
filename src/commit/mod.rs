//! The commit engine: drains a frozen memtable into file-sets.

pub mod committer;
pub mod delete;
pub mod merge;
pub mod retention;
pub mod table;

pub use committer::{CommitPhase, CommitStats, Committer};
pub use merge::MergeInfo;
pub use retention::{Retention, RetentionAction};
pub use table::{PartitionStats, PartitionWriter};
