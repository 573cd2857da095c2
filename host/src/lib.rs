//! Daemon entry plumbing: command line, configuration document, logging
//! bootstrap and privilege handling for `siphond`.

use clap::Parser;
use serde::{Deserialize, Serialize};
use siphon_lib::{ChecksumAlgo, ChecksumSpec, CopyOptions};
use siphon_sched::SchedulerConfig;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("privilege error: {0}")]
    Privileges(String),
}

pub type HostResult<T> = Result<T, HostError>;

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/siphon/config.json")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/siphon/tasks.sqlite")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_parallel_links() -> usize {
    4
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "siphond",
    about = "File-operations daemon: drains the transfer and deletion queues",
    long_about = None
)]
pub struct Cli {
    #[arg(long, require_equals = true, default_value = "/etc/siphon/config.json")]
    /// Path to the JSON configuration document
    pub config_path: PathBuf,

    #[arg(long, require_equals = true, default_value = "/var/lib/siphon/tasks.sqlite")]
    /// Path to the task database
    pub db_path: PathBuf,

    #[arg(long, require_equals = true)]
    /// Override logging.level from the configuration document
    pub log_level: Option<String>,

    #[arg(long, require_equals = true)]
    /// Override logging.path from the configuration document
    pub log_path: Option<PathBuf>,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            db_path: default_db_path(),
            log_level: None,
            log_path: None,
        }
    }
}

// The configuration document. Unrecognized keys are ignored.
// ----------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// OS user to drop privileges to when started as root.
    pub user: Option<String>,
    pub file_operations: FileOperations,
    pub logging: Logging,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FileOperations {
    pub daemon: DaemonSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Worker bound of each per-link pool.
    #[serde(default = "default_max_parallel_links")]
    pub max_parallel_links: usize,
    /// Checksum algorithm for transfers: crc32, adler32 or md5.
    pub checksum: Option<String>,
    /// Per-transfer timeout in seconds; 0 keeps the storage-library default.
    pub transfer_timeout: u64,
    pub overwrite: bool,
    /// Opaque verbosity setting forwarded to the storage library.
    pub gfal2_verbosity: Option<String>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            max_parallel_links: default_max_parallel_links(),
            checksum: None,
            transfer_timeout: 0,
            overwrite: false,
            gfal2_verbosity: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rotating log files; stdout only when absent.
    pub path: Option<PathBuf>,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: None,
        }
    }
}

/// Fully validated startup options.
#[derive(Debug, Clone)]
pub struct DaemonOpts {
    pub cli: Cli,
    pub config: Config,
    checksum: Option<ChecksumAlgo>,
}

impl DaemonOpts {
    /// Read the command line, load the configuration document, apply the
    /// command-line overrides and validate. Every failure here is startup
    /// misconfiguration and fatal.
    pub fn init() -> HostResult<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> HostResult<Self> {
        let file = std::fs::File::open(&cli.config_path).map_err(|e| {
            HostError::Config(format!(
                "cannot open config {}: {e}",
                cli.config_path.display()
            ))
        })?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;

        // Command line wins over the document.
        if let Some(level) = &cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(path) = &cli.log_path {
            config.logging.path = Some(path.clone());
        }

        Self::validate(cli, config)
    }

    fn validate(cli: Cli, config: Config) -> HostResult<Self> {
        let daemon = &config.file_operations.daemon;
        if daemon.max_parallel_links == 0 {
            return Err(HostError::Config(
                "file_operations.daemon.max_parallel_links must be positive".to_string(),
            ));
        }
        let checksum = daemon
            .checksum
            .as_deref()
            .map(|raw| raw.parse::<ChecksumAlgo>())
            .transpose()
            .map_err(HostError::Config)?;
        Ok(Self {
            cli,
            config,
            checksum,
        })
    }

    /// Transfer parameters fixed for the life of the daemon.
    pub fn copy_options(&self) -> CopyOptions {
        let daemon = &self.config.file_operations.daemon;
        CopyOptions {
            create_parents: true,
            overwrite: daemon.overwrite,
            checksum: self.checksum.map(ChecksumSpec::verify_both),
            timeout_secs: daemon.transfer_timeout,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.config.file_operations.daemon.max_parallel_links,
            ..SchedulerConfig::default()
        }
    }
}

/// Drop root privileges to the configured user (setgid before setuid).
/// A no-op when not running as root.
pub fn drop_privileges(user_name: &str) -> HostResult<()> {
    use nix::unistd::{setgid, setuid, Uid, User};

    if !Uid::effective().is_root() {
        tracing::debug!("drop_privileges: not running as root, keeping current user");
        return Ok(());
    }

    let user = User::from_name(user_name)
        .map_err(|e| HostError::Privileges(format!("cannot resolve user {user_name}: {e}")))?
        .ok_or_else(|| HostError::Privileges(format!("unknown user: {user_name}")))?;

    setgid(user.gid)
        .and_then(|_| setuid(user.uid))
        .map_err(|e| HostError::Privileges(format!("cannot switch to {user_name}: {e}")))?;

    tracing::info!("drop_privileges: running as {user_name} ({}/{})", user.uid, user.gid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use siphon_lib::ChecksumMode;
    use std::io::Write as _;

    fn cli_for(config: &str) -> (tempfile::TempDir, Cli) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(config.as_bytes()).unwrap();
        let cli = Cli {
            config_path: path,
            ..Cli::default()
        };
        (dir, cli)
    }

    #[test]
    fn full_document_parses() {
        let (_dir, cli) = cli_for(
            r#"{
                "user": "fileops",
                "file_operations": {
                    "daemon": {
                        "max_parallel_links": 8,
                        "checksum": "adler32",
                        "transfer_timeout": 600,
                        "overwrite": true,
                        "gfal2_verbosity": "VERBOSE"
                    },
                    "manager": { "ignored": true }
                },
                "logging": { "level": "debug", "path": "/var/log/siphon" },
                "web": { "ignored": "yes" }
            }"#,
        );
        let opts = DaemonOpts::from_cli(cli).unwrap();

        assert_eq!(opts.config.user.as_deref(), Some("fileops"));
        assert_eq!(opts.scheduler_config().max_concurrent, 8);
        assert_eq!(opts.config.logging.level, "debug");

        let copy = opts.copy_options();
        assert!(copy.create_parents);
        assert!(copy.overwrite);
        assert_eq!(copy.timeout_secs, 600);
        let checksum = copy.checksum.unwrap();
        assert_eq!(checksum.algorithm, ChecksumAlgo::Adler32);
        assert_eq!(checksum.mode, ChecksumMode::Both);
    }

    #[test]
    fn empty_document_gets_defaults() {
        let (_dir, cli) = cli_for("{}");
        let opts = DaemonOpts::from_cli(cli).unwrap();
        assert_eq!(opts.scheduler_config().max_concurrent, 4);
        assert_eq!(opts.config.logging.level, "info");
        assert!(opts.config.logging.path.is_none());
        let copy = opts.copy_options();
        assert!(!copy.overwrite);
        assert!(copy.checksum.is_none());
    }

    #[test]
    fn unknown_checksum_is_fatal() {
        let (_dir, cli) = cli_for(r#"{ "file_operations": { "daemon": { "checksum": "sha1" } } }"#);
        assert!(matches!(
            DaemonOpts::from_cli(cli),
            Err(HostError::Config(_))
        ));
    }

    #[test]
    fn zero_parallelism_is_fatal() {
        let (_dir, cli) = cli_for(r#"{ "file_operations": { "daemon": { "max_parallel_links": 0 } } }"#);
        assert!(matches!(
            DaemonOpts::from_cli(cli),
            Err(HostError::Config(_))
        ));
    }

    #[test]
    fn missing_config_file_is_fatal() {
        let cli = Cli {
            config_path: PathBuf::from("/nonexistent/siphon.json"),
            ..Cli::default()
        };
        assert!(matches!(
            DaemonOpts::from_cli(cli),
            Err(HostError::Config(_))
        ));
    }

    #[test]
    fn command_line_overrides_logging() {
        let (_dir, mut cli) = cli_for(r#"{ "logging": { "level": "warn" } }"#);
        cli.log_level = Some("trace".to_string());
        cli.log_path = Some(PathBuf::from("/tmp/siphon-logs"));

        let opts = DaemonOpts::from_cli(cli).unwrap();
        assert_eq!(opts.config.logging.level, "trace");
        assert_eq!(
            opts.config.logging.path.as_deref(),
            Some(std::path::Path::new("/tmp/siphon-logs"))
        );
    }
}
