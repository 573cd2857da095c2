use siphon_lib::{
    CopyOptions, StatInfo, StorageBackend, StorageContext, StorageError, StorageResult, ENOENT,
};
use std::{
    collections::{HashMap, VecDeque},
    fmt::Write as _,
    sync::{Arc, Mutex},
    time::Duration,
};

type Script<T> = HashMap<String, VecDeque<StorageResult<T>>>;

#[derive(Default)]
struct MockState {
    copy_script: Script<()>,
    unlink_script: Script<()>,
    stat_script: Script<StatInfo>,
    calls: Vec<String>,
    op_delay: Option<Duration>,
    live_ops: usize,
    max_live_ops: usize,
}

/// Scripted storage backend for tests.
///
/// Outcomes are queued per PFN and consumed call by call; unscripted copies
/// and unlinks succeed, unscripted stats report a missing target. Every call
/// is journaled so tests can assert which operations ran (and, for cancelled
/// tasks, that none did). Clones share state, mirroring how one backend
/// hands contexts to many workers.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_copy(&self, source: &str, outcomes: Vec<StorageResult<()>>) {
        let mut state = self.state.lock().unwrap();
        state
            .copy_script
            .insert(source.to_string(), outcomes.into());
    }

    pub fn script_unlink(&self, target: &str, outcomes: Vec<StorageResult<()>>) {
        let mut state = self.state.lock().unwrap();
        state
            .unlink_script
            .insert(target.to_string(), outcomes.into());
    }

    pub fn script_stat(&self, target: &str, outcomes: Vec<StorageResult<StatInfo>>) {
        let mut state = self.state.lock().unwrap();
        state
            .stat_script
            .insert(target.to_string(), outcomes.into());
    }

    /// Make every operation block for `delay`, to hold workers in flight.
    pub fn set_op_delay(&self, delay: Duration) {
        self.state.lock().unwrap().op_delay = Some(delay);
    }

    /// Journal of calls in execution order, formatted as
    /// `"<op> <pfn>[ <pfn>]"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// High-water mark of storage operations in flight at once.
    pub fn max_live_ops(&self) -> usize {
        self.state.lock().unwrap().max_live_ops
    }
}

impl StorageBackend for MockBackend {
    fn open_context(&self) -> Box<dyn StorageContext> {
        Box::new(MockContext {
            state: self.state.clone(),
            log: String::new(),
        })
    }
}

struct MockContext {
    state: Arc<Mutex<MockState>>,
    log: String,
}

impl MockContext {
    /// Journal the call and track the in-flight gauge; the scripted delay
    /// runs outside the state lock.
    fn enter(&mut self, call: String) -> Option<Duration> {
        let _ = writeln!(self.log, "{call}");
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state.live_ops += 1;
        state.max_live_ops = state.max_live_ops.max(state.live_ops);
        state.op_delay
    }

    fn run_op<T>(
        &mut self,
        call: String,
        pop: impl FnOnce(&mut MockState) -> Option<StorageResult<T>>,
        fallback: StorageResult<T>,
    ) -> StorageResult<T> {
        let delay = self.enter(call);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock().unwrap();
        state.live_ops -= 1;
        pop(&mut state).unwrap_or(fallback)
    }
}

impl StorageContext for MockContext {
    fn copy(
        &mut self,
        source: &str,
        destination: &str,
        _options: &CopyOptions,
    ) -> StorageResult<()> {
        let source = source.to_string();
        self.run_op(
            format!("copy {source} {destination}"),
            |state| {
                state
                    .copy_script
                    .get_mut(&source)
                    .and_then(|queue| queue.pop_front())
            },
            Ok(()),
        )
    }

    fn unlink(&mut self, target: &str) -> StorageResult<()> {
        let target = target.to_string();
        self.run_op(
            format!("unlink {target}"),
            |state| {
                state
                    .unlink_script
                    .get_mut(&target)
                    .and_then(|queue| queue.pop_front())
            },
            Ok(()),
        )
    }

    fn stat(&mut self, target: &str) -> StorageResult<StatInfo> {
        let target = target.to_string();
        self.run_op(
            format!("stat {target}"),
            |state| {
                state
                    .stat_script
                    .get_mut(&target)
                    .and_then(|queue| queue.pop_front())
            },
            Err(StorageError::new(ENOENT, "no such file")),
        )
    }

    fn take_log(&mut self) -> String {
        std::mem::take(&mut self.log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_outcomes_are_consumed_in_order() {
        let backend = MockBackend::new();
        backend.script_unlink(
            "gsiftp://x/y",
            vec![Err(StorageError::new(ENOENT, "no such file")), Ok(())],
        );

        let mut context = backend.open_context();
        assert!(context.unlink("gsiftp://x/y").is_err());
        assert!(context.unlink("gsiftp://x/y").is_ok());
        // Exhausted scripts fall back to success.
        assert!(context.unlink("gsiftp://x/y").is_ok());
    }

    #[test]
    fn contexts_share_the_journal_but_not_the_log() {
        let backend = MockBackend::new();
        let mut first = backend.open_context();
        let mut second = backend.open_context();

        first.unlink("gsiftp://x/one").unwrap();
        second.unlink("gsiftp://x/two").unwrap();

        assert_eq!(
            backend.calls(),
            vec!["unlink gsiftp://x/one", "unlink gsiftp://x/two"]
        );
        assert!(first.take_log().contains("one"));
        assert!(!second.take_log().contains("one"));
    }
}
