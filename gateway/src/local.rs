use siphon_lib::{
    CopyOptions, StatInfo, StorageBackend, StorageContext, StorageError, StorageResult, EEXIST,
    ENOENT,
};
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

// Unsupported PFN scheme (errno EINVAL).
const EINVAL: i32 = 22;

/// Local-filesystem storage backend.
///
/// Serves `file://` PFNs (and bare paths) against the host filesystem with
/// errno-faithful result codes, so the adapter's code mapping behaves exactly
/// as against remote endpoints. This is the backend development deployments
/// run on; remote-protocol backends bind [`StorageContext`] out-of-tree.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl StorageBackend for LocalBackend {
    fn open_context(&self) -> Box<dyn StorageContext> {
        Box::new(LocalContext { log: String::new() })
    }
}

struct LocalContext {
    log: String,
}

impl LocalContext {
    fn logln(&mut self, line: impl AsRef<str>) {
        let _ = writeln!(self.log, "{}", line.as_ref());
    }
}

fn pfn_to_path(pfn: &str) -> StorageResult<PathBuf> {
    if let Some(path) = pfn.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if pfn.contains("://") {
        return Err(StorageError::new(
            EINVAL,
            format!("unsupported PFN scheme: {pfn}"),
        ));
    }
    Ok(PathBuf::from(pfn))
}

fn io_error(error: std::io::Error, what: &str) -> StorageError {
    let code = match error.kind() {
        std::io::ErrorKind::NotFound => ENOENT,
        std::io::ErrorKind::AlreadyExists => EEXIST,
        _ => error.raw_os_error().unwrap_or(-1),
    };
    StorageError::new(code, format!("{what}: {error}"))
}

fn stat_path(path: &Path) -> StorageResult<StatInfo> {
    let meta = fs::metadata(path).map_err(|e| io_error(e, "stat failed"))?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(StatInfo {
        size: meta.len(),
        modified,
    })
}

impl StorageContext for LocalContext {
    fn copy(&mut self, source: &str, destination: &str, options: &CopyOptions) -> StorageResult<()> {
        let src = pfn_to_path(source)?;
        let dst = pfn_to_path(destination)?;
        self.logln(format!("copy {source} -> {destination}"));

        let src_meta = stat_path(&src).map_err(|mut e| {
            e.message = format!("source {}", e.message);
            e
        })?;
        self.logln(format!("source size {} bytes", src_meta.size));

        if !options.overwrite && dst.exists() {
            return Err(StorageError::new(
                EEXIST,
                format!("destination exists: {destination}"),
            ));
        }
        if let Some(checksum) = &options.checksum {
            // No digest support on the local filesystem.
            self.logln(format!(
                "checksum {} requested, skipped on local filesystem",
                checksum.algorithm.as_str()
            ));
        }
        if options.create_parents {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|e| io_error(e, "mkdir failed"))?;
            }
        }

        let written = fs::copy(&src, &dst).map_err(|e| io_error(e, "copy failed"))?;
        self.logln(format!("copied {written} bytes"));
        Ok(())
    }

    fn unlink(&mut self, target: &str) -> StorageResult<()> {
        let path = pfn_to_path(target)?;
        self.logln(format!("unlink {target}"));
        fs::remove_file(&path).map_err(|e| io_error(e, "unlink failed"))?;
        Ok(())
    }

    fn stat(&mut self, target: &str) -> StorageResult<StatInfo> {
        let path = pfn_to_path(target)?;
        self.logln(format!("stat {target}"));
        stat_path(&path)
    }

    fn take_log(&mut self) -> String {
        std::mem::take(&mut self.log)
    }
}
