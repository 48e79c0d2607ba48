//! 持久化 - 基础设施层
//!
//! 请求和它的尝试记录一起保存。每次状态转换都在释放请求锁之前写入，
//! 进程重启后只靠这里的数据恢复。

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::{Attempt, LifecycleState, Request, RequestId};

/// 一个请求的完整持久化记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRequest {
    pub request: Request,
    pub attempts: Vec<Attempt>,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// 新建请求，`id` 已存在时失败
    async fn insert(&self, request: &Request) -> Result<(), StoreError>;

    async fn load(&self, id: RequestId) -> Result<Request, StoreError>;

    /// 写入请求（和可选的一条尝试记录），两者一起生效
    ///
    /// `request.version` 必须等于已存的版本，成功后加一。
    /// 尝试记录按序号覆盖。
    async fn save(&self, request: &mut Request, attempt: Option<&Attempt>) -> Result<(), StoreError>;

    /// 按序号排列的尝试记录
    async fn attempts(&self, id: RequestId) -> Result<Vec<Attempt>, StoreError>;

    /// 处于给定状态的请求，按 (优先级, 入队序号) 排序
    async fn list_in_states(&self, states: &[LifecycleState]) -> Result<Vec<Request>, StoreError>;

    /// 分配下一个入队序号
    async fn next_sequence(&self) -> Result<u64, StoreError>;
}

/// 乐观锁检查通过后写入记录
fn apply_save(
    stored: &mut StoredRequest,
    request: &mut Request,
    attempt: Option<&Attempt>,
) -> Result<(), StoreError> {
    if stored.request.version != request.version {
        return Err(StoreError::VersionConflict {
            id: request.id,
            expected: request.version,
            actual: stored.request.version,
        });
    }
    request.version += 1;
    request.updated_at = chrono::Utc::now();

    if let Some(attempt) = attempt {
        match stored.attempts.iter_mut().find(|a| a.number == attempt.number) {
            Some(existing) => *existing = attempt.clone(),
            None => {
                stored.attempts.push(attempt.clone());
                stored.attempts.sort_by_key(|a| a.number);
            }
        }
    }
    stored.request = request.clone();
    Ok(())
}

fn sort_for_dequeue(requests: &mut [Request]) {
    requests.sort_by_key(|r| (r.priority, r.sequence));
}
