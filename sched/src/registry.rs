use siphon_lib::TaskId;
use std::collections::HashSet;
use std::sync::Mutex;

/// Shared set of the task ids currently in `queued`, one instance per task
/// kind.
///
/// Membership invariant: an id is in the registry iff its row is in
/// `queued`. The scheduler rebuilds the set from the database on every poll,
/// so an id the manager has cancelled (by moving the row out of `queued`)
/// disappears here before its worker runs. Claiming the own id is the
/// worker's first step; losing that race means the task was cancelled
/// between enqueue and dispatch.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    ids: Mutex<HashSet<TaskId>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole membership with the database's current `queued`
    /// set.
    pub fn refresh(&self, ids: HashSet<TaskId>) {
        *self.ids.lock().unwrap() = ids;
    }

    /// Run `enqueue` (the `new -> queued` row transition) and append `id`,
    /// both under the registry lock, so a concurrent refresh never observes
    /// the row queued without its registry entry. The row write comes
    /// first; a crash in between leaves a queued row with no entry, which
    /// the next orphan recovery resets.
    pub fn enqueue_with<E>(
        &self,
        id: TaskId,
        enqueue: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        let mut ids = self.ids.lock().unwrap();
        enqueue()?;
        ids.insert(id);
        Ok(())
    }

    /// Atomically claim `id`. True means the caller won the dispatch race
    /// and owns the task; false means the id was removed externally and the
    /// task must be treated as cancelled.
    pub fn try_claim(&self, id: TaskId) -> bool {
        self.ids.lock().unwrap().remove(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.ids.lock().unwrap().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let registry = CancelRegistry::new();
        registry.refresh(HashSet::from([7]));

        assert!(registry.try_claim(7));
        assert!(!registry.try_claim(7));
    }

    #[test]
    fn refresh_replaces_membership() {
        let registry = CancelRegistry::new();
        registry.refresh(HashSet::from([1, 2, 3]));
        registry.refresh(HashSet::from([2]));

        assert!(!registry.contains(1));
        assert!(registry.contains(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn enqueue_with_skips_insert_on_write_failure() {
        let registry = CancelRegistry::new();
        let result: Result<(), &str> = registry.enqueue_with(9, || Err("db down"));

        assert!(result.is_err());
        assert!(!registry.contains(9));
    }

    #[test]
    fn concurrent_claims_never_hand_out_the_same_id() {
        use std::sync::Arc;

        let registry = Arc::new(CancelRegistry::new());
        registry.refresh((0..100).collect());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).filter(|id| registry.try_claim(*id)).count()
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
        assert!(registry.is_empty());
    }
}
