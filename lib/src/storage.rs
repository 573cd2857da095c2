use crate::task::ChecksumSpec;
use serde::{Deserialize, Serialize};

// Result codes shared with the storage library, errno-valued.
// ----------------------------------------------------------------

/// Target does not exist.
pub const ENOENT: i32 = 2;
/// Destination already exists.
pub const EEXIST: i32 = 17;
/// Data-channel port binding failed; transient on busy hosts.
pub const ECOMM: i32 = 70;

#[derive(thiserror::Error, PartialEq, Debug, Clone, Eq)]
#[error("storage error {code}: {message}")]
pub struct StorageError {
    pub code: i32,
    pub message: String,
}

impl StorageError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata of a remote file as returned by a stat call.
#[derive(PartialEq, Debug, Clone, Copy, Eq)]
pub struct StatInfo {
    pub size: u64,
    /// Last modification time, Unix seconds.
    pub modified: i64,
}

/// Parameters of a single copy operation, fixed at daemon startup except for
/// the endpoints.
#[derive(PartialEq, Debug, Clone, Eq)]
pub struct CopyOptions {
    pub create_parents: bool,
    pub overwrite: bool,
    pub checksum: Option<ChecksumSpec>,
    /// Per-operation timeout handed to the storage library; 0 keeps the
    /// library default.
    pub timeout_secs: u64,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            create_parents: true,
            overwrite: false,
            checksum: None,
            timeout_secs: 0,
        }
    }
}

/// One live context of the storage library.
///
/// The library is not safe for concurrent in-flight operations within a
/// single context, so every worker opens its own and the context is `Send`
/// but never shared. The verbose log accumulates inside the context and is
/// drained per invocation via [`StorageContext::take_log`].
pub trait StorageContext: Send {
    fn copy(&mut self, source: &str, destination: &str, options: &CopyOptions) -> StorageResult<()>;

    fn unlink(&mut self, target: &str) -> StorageResult<()>;

    fn stat(&mut self, target: &str) -> StorageResult<StatInfo>;

    /// Drain the verbose log captured since the last drain.
    fn take_log(&mut self) -> String;
}

/// Factory for [`StorageContext`] values; the only handle subsystems share.
pub trait StorageBackend: Send + Sync {
    fn open_context(&self) -> Box<dyn StorageContext>;
}

/// Structured outcome of one gateway operation.
///
/// `exit_code == -1` with both timestamps zero and an empty message means
/// the task was cancelled before any storage call. The same shape with a
/// nonempty message is an internal error and is recorded as failed.
#[derive(PartialEq, Debug, Clone, Eq, Deserialize, Serialize)]
pub struct OpResult {
    pub exit_code: i32,
    /// Unix seconds; 0 when no storage call started.
    pub started_at: i64,
    /// Unix seconds; 0 when no storage call finished.
    pub finished_at: i64,
    pub message: String,
    /// Verbose storage-library log captured during this invocation.
    pub log: String,
}

impl OpResult {
    pub fn cancelled() -> Self {
        Self {
            exit_code: -1,
            started_at: 0,
            finished_at: 0,
            message: String::new(),
            log: String::new(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            started_at: 0,
            finished_at: 0,
            message: message.into(),
            log: String::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.exit_code == -1
            && self.started_at == 0
            && self.finished_at == 0
            && self.message.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
