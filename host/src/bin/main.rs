use anyhow::Context;
use siphon_gateway::{Gateway, LocalBackend};
use siphon_host::{drop_privileges, DaemonOpts, HostError, HostResult};
use siphon_sched::Scheduler;
use siphon_taskdb::TaskStore;
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = DaemonOpts::init()?;
    let _guard = subscribe_log(&opts.config.logging.level, &opts.config.logging.path)?;
    debug!("Start config:\n{:#?}", opts.config);

    if let Some(user) = &opts.config.user {
        drop_privileges(user)?;
    }
    if let Some(verbosity) = &opts.config.file_operations.daemon.gfal2_verbosity {
        debug!("storage-library verbosity: {verbosity}");
    }

    let store = TaskStore::open_or_create(&opts.cli.db_path)
        .with_context(|| format!("could not open task database {}", opts.cli.db_path.display()))?;
    let gateway = Gateway::new(Arc::new(LocalBackend::new()), opts.copy_options());

    let stop = CancellationToken::new();
    install_signal_handlers(stop.clone())?;

    info!(
        "siphond starting: db={}, max_parallel_links={}",
        opts.cli.db_path.display(),
        opts.scheduler_config().max_concurrent,
    );

    let mut scheduler = Scheduler::new(store, gateway, opts.scheduler_config(), stop);
    if let Err(err) = scheduler.run().await {
        // The shutdown path (orphan recovery, pool drain) already ran;
        // nonzero exits are reserved for startup misconfiguration.
        error!("scheduler loop failed: {err}");
    }
    Ok(())
}

/// Translate SIGTERM and SIGHUP into the cooperative stop token.
fn install_signal_handlers(stop: CancellationToken) -> HostResult<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM, stopping"),
            _ = hangup.recv() => info!("received SIGHUP, stopping"),
        }
        stop.cancel();
    });
    Ok(())
}

/// Stdout fmt layer always; a daily-rotating file layer underneath the
/// configured directory when one is given. The returned guard flushes the
/// non-blocking writer and must live as long as `main`.
fn subscribe_log(log_level: &str, log_path: &Option<PathBuf>) -> HostResult<Option<WorkerGuard>> {
    let stdout_filter =
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(stdout_filter);

    if let Some(dir) = log_path {
        create_dir_all(dir).map_err(HostError::Io)?;

        let appender = tracing_appender::rolling::daily(dir, "siphond.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let file_filter =
            EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(file_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
        Ok(None)
    }
}
