use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{apply_save, sort_for_dequeue, RequestStore, StoredRequest};
use crate::error::StoreError;
use crate::models::{Attempt, LifecycleState, Request, RequestId};

/// 文件存储
///
/// 每个请求一个 JSON 文件 `<dir>/<request_id>.json`，先写临时文件再 rename。
/// 打开时全部读入内存，之后写穿。
pub struct FileStore {
    dir: PathBuf,
    records: Mutex<HashMap<RequestId, StoredRequest>>,
    sequence: AtomicU64,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|source| io_err(&dir, source))?;

        let mut records = HashMap::new();
        let mut entries = fs::read_dir(&dir).await.map_err(|source| io_err(&dir, source))?;
        while let Some(entry) = entries.next_entry().await.map_err(|source| io_err(&dir, source))? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read(&path).await.map_err(|source| io_err(&path, source))?;
            match serde_json::from_slice::<StoredRequest>(&content) {
                Ok(stored) => {
                    records.insert(stored.request.id, stored);
                }
                Err(e) => warn!("跳过无法解析的状态文件 {}: {}", path.display(), e),
            }
        }

        let next_sequence = records
            .values()
            .map(|r| r.request.sequence + 1)
            .max()
            .unwrap_or(0);
        info!("📂 已从 {} 载入 {} 个请求", dir.display(), records.len());

        Ok(Self {
            dir,
            records: Mutex::new(records),
            sequence: AtomicU64::new(next_sequence),
        })
    }

    fn path_for(&self, id: RequestId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn persist(&self, stored: &StoredRequest) -> Result<(), StoreError> {
        let path = self.path_for(stored.request.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", stored.request.id));
        let json = serde_json::to_vec_pretty(stored)?;
        fs::write(&tmp, &json).await.map_err(|source| io_err(&tmp, source))?;
        fs::rename(&tmp, &path).await.map_err(|source| io_err(&path, source))?;
        Ok(())
    }
}

#[async_trait]
impl RequestStore for FileStore {
    async fn insert(&self, request: &Request) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&request.id) {
            return Err(StoreError::AlreadyExists(request.id));
        }
        let stored = StoredRequest {
            request: request.clone(),
            attempts: Vec::new(),
        };
        self.persist(&stored).await?;
        records.insert(request.id, stored);
        Ok(())
    }

    async fn load(&self, id: RequestId) -> Result<Request, StoreError> {
        self.records
            .lock()
            .await
            .get(&id)
            .map(|r| r.request.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, request: &mut Request, attempt: Option<&Attempt>) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let current = records.get(&request.id).ok_or(StoreError::NotFound(request.id))?;

        // 先在副本上应用，落盘成功后才替换内存中的记录
        let mut next = current.clone();
        let mut candidate = request.clone();
        apply_save(&mut next, &mut candidate, attempt)?;
        self.persist(&next).await?;

        records.insert(request.id, next);
        *request = candidate;
        Ok(())
    }

    async fn attempts(&self, id: RequestId) -> Result<Vec<Attempt>, StoreError> {
        self.records
            .lock()
            .await
            .get(&id)
            .map(|r| r.attempts.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_in_states(&self, states: &[LifecycleState]) -> Result<Vec<Request>, StoreError> {
        let mut list: Vec<Request> = self
            .records
            .lock()
            .await
            .values()
            .filter(|r| states.contains(&r.request.state))
            .map(|r| r.request.clone())
            .collect();
        sort_for_dequeue(&mut list);
        Ok(list)
    }

    async fn next_sequence(&self) -> Result<u64, StoreError> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptOutcome, Priority, ReportType, RequestFields, Requestor};

    fn new_request(sequence: u64) -> Request {
        Request::new(
            RequestFields::new(ReportType::TrafficCrash, Requestor::default()),
            Priority::Standard,
            sequence,
        )
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            let seq = store.next_sequence().await.unwrap();
            let mut request = new_request(seq);
            id = request.id;
            store.insert(&request).await.unwrap();

            let mut attempt = Attempt::open(id, 1);
            request.state = LifecycleState::Submitting;
            request.attempt_count = 1;
            store.save(&mut request, Some(&attempt)).await.unwrap();

            attempt.close(AttemptOutcome::TransientFailure, Some("timeout".to_string()));
            request.state = LifecycleState::FailedRetryable;
            store.save(&mut request, Some(&attempt)).await.unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        let request = store.load(id).await.unwrap();
        assert_eq!(request.state, LifecycleState::FailedRetryable);
        assert_eq!(request.version, 2);

        let attempts = store.attempts(id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::TransientFailure);

        assert_eq!(store.next_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_version_check_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let mut request = new_request(0);
        store.insert(&request).await.unwrap();

        let mut stale = request.clone();
        request.state = LifecycleState::Submitting;
        store.save(&mut request, None).await.unwrap();

        stale.state = LifecycleState::Rejected;
        assert!(store.save(&mut stale, None).await.is_err());
        assert_eq!(stale.version, 0);

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load(request.id).await.unwrap().state, LifecycleState::Submitting);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let request = new_request(0);
        store.insert(&request).await.unwrap();
        assert!(matches!(store.insert(&request).await, Err(StoreError::AlreadyExists(_))));
    }
}
