use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{apply_save, sort_for_dequeue, RequestStore, StoredRequest};
use crate::error::StoreError;
use crate::models::{Attempt, LifecycleState, Request, RequestId};

/// 内存存储（测试用）
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<RequestId, StoredRequest>>,
    sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert(&self, request: &Request) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&request.id) {
            return Err(StoreError::AlreadyExists(request.id));
        }
        records.insert(
            request.id,
            StoredRequest {
                request: request.clone(),
                attempts: Vec::new(),
            },
        );
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
        let stored = records
            .get_mut(&request.id)
            .ok_or(StoreError::NotFound(request.id))?;
        apply_save(stored, request, attempt)
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
