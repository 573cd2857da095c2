pub mod storage;
pub mod task;

// re-export
pub use storage::{
    CopyOptions, OpResult, StatInfo, StorageBackend, StorageContext, StorageError, StorageResult,
    ECOMM, EEXIST, ENOENT,
};
pub use task::{ChecksumAlgo, ChecksumMode, ChecksumSpec, LinkKey, NewTask, OpParams, TaskId, TaskKind, TaskStatus};
