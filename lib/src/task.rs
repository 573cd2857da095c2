use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable row identifier assigned by the upstream file-operations manager.
pub type TaskId = i64;

#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Transfer,
    Deletion,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Transfer => "transfer",
            TaskKind::Deletion => "deletion",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// The lifecycle state of a task row.
///
/// Rows only ever move forward: new -> queued -> active -> {done, failed,
/// cancelled}. The daemon owns every edge except the insertion of `new` rows
/// (the manager's job) and out-of-band moves to `cancelled` (also the
/// manager's job, honored via the cancellation registry).
pub enum TaskStatus {
    New,
    Queued,
    Active,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Queued => "queued",
            TaskStatus::Active => "active",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "new" => Ok(TaskStatus::New),
            "queued" => Ok(TaskStatus::Queued),
            "active" => Ok(TaskStatus::Active),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// The unit by which concurrency is bounded: an ordered site pair for
/// transfers, a single site for deletions. One pool exists per live link.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq, Hash, PartialOrd, Ord)]
pub enum LinkKey {
    Transfer {
        source_site: String,
        dest_site: String,
    },
    Deletion {
        site: String,
    },
}

impl LinkKey {
    pub fn kind(&self) -> TaskKind {
        match self {
            LinkKey::Transfer { .. } => TaskKind::Transfer,
            LinkKey::Deletion { .. } => TaskKind::Deletion,
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKey::Transfer {
                source_site,
                dest_site,
            } => write!(f, "{source_site}->{dest_site}"),
            LinkKey::Deletion { site } => f.write_str(site),
        }
    }
}

/// Per-task operation parameters. PFNs are opaque, fully qualified storage
/// URLs; the daemon never parses them beyond handing them to the gateway.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub enum OpParams {
    Transfer { source: String, destination: String },
    Deletion { file: String },
}

impl OpParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            OpParams::Transfer { .. } => TaskKind::Transfer,
            OpParams::Deletion { .. } => TaskKind::Deletion,
        }
    }
}

/// A `new` row as returned by the record store, ready for dispatch.
#[derive(PartialEq, Debug, Clone, Eq)]
pub struct NewTask {
    pub id: TaskId,
    pub params: OpParams,
    pub link: LinkKey,
}

#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgo {
    Crc32,
    Adler32,
    Md5,
}

impl ChecksumAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgo::Crc32 => "crc32",
            ChecksumAlgo::Adler32 => "adler32",
            ChecksumAlgo::Md5 => "md5",
        }
    }
}

impl FromStr for ChecksumAlgo {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "crc32" => Ok(ChecksumAlgo::Crc32),
            "adler32" => Ok(ChecksumAlgo::Adler32),
            "md5" => Ok(ChecksumAlgo::Md5),
            other => Err(format!("unknown checksum algorithm: {other}")),
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    Source,
    Target,
    #[default]
    Both,
}

/// Checksum verification request forwarded to the storage library.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct ChecksumSpec {
    pub mode: ChecksumMode,
    pub algorithm: ChecksumAlgo,
    /// Expected digest; empty means "verify source against destination".
    pub value: String,
}

impl ChecksumSpec {
    pub fn verify_both(algorithm: ChecksumAlgo) -> Self {
        Self {
            mode: ChecksumMode::Both,
            algorithm,
            value: String::new(),
        }
    }
}
