pub mod engine;
pub mod file_state;
pub mod hasher;
pub mod retry;
pub mod state;
pub mod task;

pub use engine::execute;
pub use file_state::{calculate_hash, hash_file, FileStats, MatchOptions};
pub use hasher::{calculate_hashes, collect_files, collect_hashes, StatsMap};
pub use retry::{with_retry, RetryPolicy};
pub use state::{NgsRun, PersistentState, ProteomicsRun, RunState, StateDocument};
pub use task::{
    CheckedCopy, CheckedMultiCopy, CheckedSync, RemoveLocal, RemoveRemote, Task, Write, TRIES,
};
