// In-memory ExecutionStore
// Map lock held only to find or insert an entry; record operations lock that record only

use crate::domain::{ExecutionRecord, ExecutionStatus, ExecutionSummary, OutputChunk};
use crate::error::{AppError, Result};
use crate::port::{ExecutionFilter, ExecutionStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

type Entry = Arc<Mutex<ExecutionRecord>>;

#[derive(Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<String, Entry>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Result<Entry> {
        let map = self
            .records
            .read()
            .map_err(|_| AppError::Store("execution map lock poisoned".to_string()))?;
        map.get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("execution {}", id)))
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let map = self
            .records
            .read()
            .map_err(|_| AppError::Store("execution map lock poisoned".to_string()))?;
        Ok(map.values().cloned().collect())
    }
}

fn lock(entry: &Entry) -> Result<std::sync::MutexGuard<'_, ExecutionRecord>> {
    entry
        .lock()
        .map_err(|_| AppError::Store("execution record lock poisoned".to_string()))
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, record: &ExecutionRecord) -> Result<()> {
        let mut map = self
            .records
            .write()
            .map_err(|_| AppError::Store("execution map lock poisoned".to_string()))?;
        if map.contains_key(&record.id) {
            return Err(AppError::Conflict(format!("execution {} already exists", record.id)));
        }
        map.insert(record.id.clone(), Arc::new(Mutex::new(record.clone())));
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        match self.entry(id) {
            Ok(entry) => Ok(Some(lock(&entry)?.clone())),
            Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>> {
        let mut summaries = Vec::new();
        for entry in self.entries()? {
            let record = lock(&entry)?;
            if filter.matches(&record) {
                summaries.push(record.summary());
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    async fn save_state(&self, record: &ExecutionRecord) -> Result<()> {
        let entry = self.entry(&record.id)?;
        let mut stored = lock(&entry)?;
        if stored.status.is_terminal() && stored.status != record.status {
            return Err(AppError::InvalidState(format!(
                "execution {} is already {}",
                record.id, stored.status
            )));
        }
        stored.status = record.status;
        stored.exit_code = record.exit_code;
        stored.reason = record.reason.clone();
        stored.started_at = record.started_at;
        stored.completed_at = record.completed_at;
        stored.pid = record.pid;
        Ok(())
    }

    async fn append_output(&self, id: &str, chunk: &OutputChunk) -> Result<()> {
        let entry = self.entry(id)?;
        let mut stored = lock(&entry)?;
        stored.append_output(chunk.clone())?;
        Ok(())
    }

    async fn request_cancel(&self, id: &str) -> Result<bool> {
        let entry = self.entry(id)?;
        let mut stored = lock(&entry)?;
        Ok(stored.request_cancel())
    }

    async fn find_unfinished(&self) -> Result<Vec<ExecutionRecord>> {
        let mut unfinished = Vec::new();
        for entry in self.entries()? {
            let record = lock(&entry)?;
            if matches!(record.status, ExecutionStatus::Scheduled | ExecutionStatus::Running) {
                unfinished.push(record.clone());
            }
        }
        Ok(unfinished)
    }

    async fn evict(&self, id: &str) -> Result<bool> {
        let mut map = self
            .records
            .write()
            .map_err(|_| AppError::Store("execution map lock poisoned".to_string()))?;
        let Some(entry) = map.get(id) else {
            return Ok(false);
        };
        let status = lock(entry)?.status;
        if !status.is_terminal() {
            return Err(AppError::InvalidState(format!(
                "execution {} is still {}",
                id, status
            )));
        }
        map.remove(id);
        Ok(true)
    }

    async fn evict_finished_before(&self, cutoff_millis: i64) -> Result<u64> {
        let mut map = self
            .records
            .write()
            .map_err(|_| AppError::Store("execution map lock poisoned".to_string()))?;
        let mut expired = Vec::new();
        for (id, entry) in map.iter() {
            let record = lock(entry)?;
            let finished_before = record.completed_at.is_some_and(|t| t < cutoff_millis);
            if record.is_terminal() && finished_before {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            map.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StreamKind;

    fn record(id: &str, caller: &str, created_at: i64) -> ExecutionRecord {
        ExecutionRecord::new(id, "echo hi", caller, created_at)
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = InMemoryExecutionStore::new();
        store.insert(&record("e1", "alice", 1)).await.unwrap();

        let found = store.find_by_id("e1").await.unwrap().unwrap();
        assert_eq!(found.caller_id, "alice");
        assert!(store.find_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let store = InMemoryExecutionStore::new();
        store.insert(&record("e1", "alice", 1)).await.unwrap();
        let err = store.insert(&record("e1", "bob", 2)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_save_state_keeps_cancel_flag_and_output() {
        let store = InMemoryExecutionStore::new();
        let mut r = record("e1", "alice", 1);
        store.insert(&r).await.unwrap();

        r.start(2, Some(10)).unwrap();
        store.save_state(&r).await.unwrap();
        store
            .append_output("e1", &OutputChunk::new(0, StreamKind::Stdout, "hi\n", 3))
            .await
            .unwrap();
        assert!(store.request_cancel("e1").await.unwrap());

        // supervisor's copy has neither the flag nor the output
        r.finish(0, 4).unwrap();
        store.save_state(&r).await.unwrap();

        let stored = store.find_by_id("e1").await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(stored.cancel_requested);
        assert_eq!(stored.output.len(), 1);
        assert_eq!(stored.pid, Some(10));
    }

    #[tokio::test]
    async fn test_terminal_record_cannot_change_status() {
        let store = InMemoryExecutionStore::new();
        let mut r = record("e1", "alice", 1);
        store.insert(&r).await.unwrap();
        r.cancel(2).unwrap();
        store.save_state(&r).await.unwrap();

        let mut late = record("e1", "alice", 1);
        late.start(3, None).unwrap();
        let err = store.save_state(&late).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_request_cancel_is_set_once() {
        let store = InMemoryExecutionStore::new();
        store.insert(&record("e1", "alice", 1)).await.unwrap();
        assert!(store.request_cancel("e1").await.unwrap());
        assert!(!store.request_cancel("e1").await.unwrap());
        assert!(matches!(
            store.request_cancel("nope").await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let store = InMemoryExecutionStore::new();
        store.insert(&record("a", "alice", 1)).await.unwrap();
        store.insert(&record("b", "bob", 2)).await.unwrap();
        store.insert(&record("c", "alice", 3)).await.unwrap();

        let mine = store.list(&ExecutionFilter::for_caller("alice")).await.unwrap();
        let ids: Vec<_> = mine.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);

        let limited = store
            .list(&ExecutionFilter {
                limit: Some(1),
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "c");
    }

    #[tokio::test]
    async fn test_evict_refuses_non_terminal() {
        let store = InMemoryExecutionStore::new();
        let mut r = record("e1", "alice", 1);
        store.insert(&r).await.unwrap();

        assert!(matches!(
            store.evict("e1").await.unwrap_err(),
            AppError::InvalidState(_)
        ));

        r.cancel(5).unwrap();
        store.save_state(&r).await.unwrap();
        assert!(store.evict("e1").await.unwrap());
        assert!(!store.evict("e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_finished_before_cutoff() {
        let store = InMemoryExecutionStore::new();
        for (id, done_at) in [("old", Some(100)), ("new", Some(900)), ("live", None)] {
            let mut r = record(id, "alice", 1);
            store.insert(&r).await.unwrap();
            if let Some(t) = done_at {
                r.cancel(t).unwrap();
                store.save_state(&r).await.unwrap();
            }
        }

        assert_eq!(store.evict_finished_before(500).await.unwrap(), 1);
        assert!(store.find_by_id("old").await.unwrap().is_none());
        assert!(store.find_by_id("new").await.unwrap().is_some());
        assert!(store.find_by_id("live").await.unwrap().is_some());
        assert_eq!(store.find_unfinished().await.unwrap().len(), 1);
    }
}
