use chrono::Utc;
use siphon_lib::{CopyOptions, OpParams, OpResult, StorageBackend, StorageContext, ECOMM, EEXIST, ENOENT};
use std::sync::Arc;

/// Port-bind failures (code 70) are retried this many times before the last
/// outcome propagates. Any other failure surfaces immediately.
pub const MAX_PORT_BIND_ATTEMPTS: u32 = 5;

/// Executes storage primitives on behalf of workers.
///
/// Copy parameters are fixed at daemon startup; only the endpoints vary per
/// task. The adapter opens one fresh context per invocation so that verbose
/// logs never leak across concurrent calls, and it never panics: every
/// outcome, including plumbing failures, becomes a structured [`OpResult`].
#[derive(Clone)]
pub struct Gateway {
    backend: Arc<dyn StorageBackend>,
    copy_options: CopyOptions,
}

impl Gateway {
    pub fn new(backend: Arc<dyn StorageBackend>, copy_options: CopyOptions) -> Self {
        Self {
            backend,
            copy_options,
        }
    }

    /// Run one operation to completion. Blocking, possibly for hours; the
    /// caller is expected to host this on a blocking-capable thread.
    pub fn execute(&self, params: &OpParams) -> OpResult {
        let mut context = self.backend.open_context();
        let mut result = match params {
            OpParams::Transfer {
                source,
                destination,
            } => self.run_transfer(context.as_mut(), source, destination),
            OpParams::Deletion { file } => run_deletion(context.as_mut(), file),
        };
        result.log = context.take_log();
        result
    }

    fn run_transfer(
        &self,
        context: &mut dyn StorageContext,
        source: &str,
        destination: &str,
    ) -> OpResult {
        // With overwrite forbidden, an existing destination is success by
        // contract; the caller has verified size/checksum via its own stat.
        // Some backends overwrite regardless, so the copy is never issued.
        if !self.copy_options.overwrite {
            let started = Utc::now().timestamp();
            if context.stat(destination).is_ok() {
                return OpResult {
                    exit_code: 0,
                    started_at: started,
                    finished_at: Utc::now().timestamp(),
                    message: "Destination file already exists".to_string(),
                    log: String::new(),
                };
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Utc::now().timestamp();
            let outcome = context.copy(source, destination, &self.copy_options);
            let finished = Utc::now().timestamp();

            return match outcome {
                Ok(()) => OpResult {
                    exit_code: 0,
                    started_at: started,
                    finished_at: finished,
                    message: String::new(),
                    log: String::new(),
                },
                Err(error) if error.code == EEXIST => OpResult {
                    exit_code: 0,
                    started_at: started,
                    finished_at: finished,
                    message: "Destination file already exists".to_string(),
                    log: String::new(),
                },
                Err(error) if error.code == ECOMM && attempt < MAX_PORT_BIND_ATTEMPTS => {
                    tracing::warn!(
                        "Gateway.copy: port binding failed (attempt {attempt}/{MAX_PORT_BIND_ATTEMPTS}), retrying"
                    );
                    continue;
                }
                Err(error) => OpResult {
                    exit_code: error.code,
                    started_at: started,
                    finished_at: finished,
                    message: error.message,
                    log: String::new(),
                },
            };
        }
    }
}

fn run_deletion(context: &mut dyn StorageContext, target: &str) -> OpResult {
    let started = Utc::now().timestamp();
    let outcome = context.unlink(target);
    let finished = Utc::now().timestamp();

    match outcome {
        Ok(()) => OpResult {
            exit_code: 0,
            started_at: started,
            finished_at: finished,
            message: String::new(),
            log: String::new(),
        },
        // A target that is already gone is what the manager wanted anyway.
        Err(error) if error.code == ENOENT || error.code == ECOMM => OpResult {
            exit_code: 0,
            started_at: started,
            finished_at: finished,
            message: "Target file does not exist.".to_string(),
            log: String::new(),
        },
        Err(error) => OpResult {
            exit_code: error.code,
            started_at: started,
            finished_at: finished,
            message: error.message,
            log: String::new(),
        },
    }
}
