//! 任务协调器 - 编排层
//!
//! ## 职责
//!
//! 1. **并发上限**：`Semaphore` 限制同时进行的提交数量
//! 2. **请求锁**：提交引擎和对账器修改同一请求前必须持有它的锁
//! 3. **提交状态**：校验转换、落盘、发事件，全部在锁释放前完成
//! 4. **队列**：从持久化状态按 (优先级, 入队序号) 取下一个就绪请求
//! 5. **外部边界**：入队、查询状态、取证据、请求放弃
//! 6. **崩溃恢复**：启动时把中断的请求放回队列

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tracing::{info, warn};

use crate::error::{AppResult, EvidenceError, RejectionReason, StoreError};
use crate::models::{
    AttemptOutcome, EvidenceRecord, ExternalRef, LifecycleState, Priority, Request, RequestFields,
    RequestId, TransitionEvent,
};
use crate::models::state::is_allowed;
use crate::services::{EventSink, EvidenceStore};
use crate::store::RequestStore;

/// 持有某个请求的锁
///
/// 只能由 [`JobCoordinator::lock`] 创建，[`JobCoordinator::commit`] 需要它作为凭证
pub struct RequestGuard {
    id: RequestId,
    _guard: OwnedMutexGuard<()>,
}

impl RequestGuard {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

/// 对外的状态视图
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatusView {
    pub id: RequestId,
    pub state: LifecycleState,
    pub priority: Priority,
    pub attempt_count: u32,
    pub external_ref: Option<ExternalRef>,
    pub rejection: Option<RejectionReason>,
    pub abandon_requested: bool,
    pub evidence: Vec<EvidenceRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct JobCoordinator {
    store: Arc<dyn RequestStore>,
    evidence: Arc<dyn EvidenceStore>,
    events: Arc<dyn EventSink>,
    locks: Mutex<HashMap<RequestId, Arc<tokio::sync::Mutex<()>>>>,
    slots: Arc<Semaphore>,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn RequestStore>,
        evidence: Arc<dyn EvidenceStore>,
        events: Arc<dyn EventSink>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            evidence,
            events,
            locks: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    pub fn evidence_store(&self) -> &Arc<dyn EvidenceStore> {
        &self.evidence
    }

    /// 提交并发槽位
    pub fn slots(&self) -> Arc<Semaphore> {
        self.slots.clone()
    }

    /// 获取请求锁
    pub async fn lock(&self, id: RequestId) -> RequestGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id).or_default().clone()
        };
        RequestGuard {
            id,
            _guard: mutex.lock_owned().await,
        }
    }

    /// 终态请求不再需要锁；只在没有其他等待者时移除
    fn forget_lock(&self, id: RequestId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mutex) = locks.get(&id) {
            // map 自身一份 + 当前持有者一份
            if Arc::strong_count(mutex) <= 2 {
                locks.remove(&id);
            }
        }
    }

    /// 执行一次状态转换：校验 → 落盘（含尝试记录）→ 发事件
    pub async fn commit(
        &self,
        guard: &RequestGuard,
        request: &mut Request,
        to: LifecycleState,
        reason: impl Into<String>,
        attempt: Option<&crate::models::Attempt>,
    ) -> Result<(), StoreError> {
        debug_assert_eq!(guard.id(), request.id);
        let from = request.state;
        if !is_allowed(from, to) {
            return Err(StoreError::IllegalTransition {
                id: request.id,
                from,
                to,
            });
        }

        request.state = to;
        if let Err(e) = self.store.save(request, attempt).await {
            request.state = from;
            return Err(e);
        }

        let failure = match to {
            LifecycleState::Rejected | LifecycleState::Expired => request.rejection.as_ref().and_then(|r| r.kind()),
            _ => None,
        };
        let event = TransitionEvent::new(request.id, Some(from), to, reason).with_failure(failure);
        self.events.emit(&event).await;

        if to.is_terminal() {
            self.forget_lock(request.id);
        }
        Ok(())
    }

    /// 不改变状态的写入（轮询记录、放弃标记）
    pub async fn save(&self, guard: &RequestGuard, request: &mut Request) -> Result<(), StoreError> {
        debug_assert_eq!(guard.id(), request.id);
        self.store.save(request, None).await
    }

    // ========== 外部边界 ==========

    /// 入队，立即返回请求 ID
    pub async fn enqueue(&self, fields: RequestFields, priority: Priority) -> Result<RequestId, StoreError> {
        let sequence = self.store.next_sequence().await?;
        let request = Request::new(fields, priority, sequence);
        self.store.insert(&request).await?;

        info!(
            "📥 已入队: 请求 {} ({}, {:?}, 序号 {})",
            request.id, request.fields.report_type, priority, sequence
        );
        let event = TransitionEvent::new(request.id, None, LifecycleState::Queued, "enqueued");
        self.events.emit(&event).await;
        Ok(request.id)
    }

    /// 查询状态
    pub async fn status(&self, id: RequestId) -> AppResult<RequestStatusView> {
        let request = self.store.load(id).await?;
        let evidence = self.evidence.list_for_request(id).await?;
        Ok(RequestStatusView {
            id: request.id,
            state: request.state,
            priority: request.priority,
            attempt_count: request.attempt_count,
            external_ref: request.external_ref,
            rejection: request.rejection,
            abandon_requested: request.abandon_requested,
            evidence,
            created_at: request.created_at,
            updated_at: request.updated_at,
        })
    }

    /// 请求的全部证据，按采集顺序
    pub async fn evidence_for_request(&self, id: RequestId) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        self.evidence.list_for_request(id).await
    }

    /// 某次尝试的证据，按采集顺序
    pub async fn evidence_for_attempt(&self, id: RequestId, attempt: u32) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        self.evidence.list_for_attempt(id, attempt).await
    }

    /// 标记放弃
    ///
    /// 不会中断进行中的尝试，提交引擎在下一次尝试或重试前看到标记后拒绝请求。
    /// 返回 `false` 表示请求已经受理或已是终态，标记不再起作用。
    pub async fn request_abandon(&self, id: RequestId) -> Result<bool, StoreError> {
        let guard = self.lock(id).await;
        let mut request = self.store.load(id).await?;
        if request.state.is_terminal() || request.state.is_polling() {
            info!("请求 {} 已处于 {}，放弃请求不生效", id, request.state);
            return Ok(false);
        }
        if !request.abandon_requested {
            request.abandon_requested = true;
            self.save(&guard, &mut request).await?;
            info!("🛑 请求 {} 已标记放弃", id);
        }
        Ok(true)
    }

    // ========== 队列 ==========

    /// 下一个可认领的请求
    ///
    /// 已标记放弃的请求不等退避结束，尽快交给引擎拒绝
    pub async fn next_ready(&self, now: DateTime<Utc>) -> Result<Option<Request>, StoreError> {
        Ok(self
            .store
            .list_in_states(&[LifecycleState::Queued])
            .await?
            .into_iter()
            .find(|r| r.is_ready(now) || r.abandon_requested))
    }

    // ========== 崩溃恢复 ==========

    /// 启动时恢复中断的请求，返回恢复数量
    ///
    /// - `Submitting`：打开的尝试记为中断，回到 `Queued`（已有外部编号则回到 `Submitted`）
    /// - `FailedRetryable`：回到 `Queued`
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let interrupted = self
            .store
            .list_in_states(&[LifecycleState::Submitting, LifecycleState::FailedRetryable])
            .await?;
        let mut recovered = 0;

        for stale in interrupted {
            let guard = self.lock(stale.id).await;
            let mut request = self.store.load(stale.id).await?;
            let open = self
                .store
                .attempts(request.id)
                .await?
                .into_iter()
                .find(|a| a.is_open());

            match request.state {
                LifecycleState::Submitting => {
                    let mut closed = open;
                    if let Some(attempt) = closed.as_mut() {
                        attempt.close(AttemptOutcome::TransientFailure, Some("interrupted by restart".to_string()));
                    }
                    let to = if request.external_ref.is_some() {
                        LifecycleState::Submitted
                    } else {
                        LifecycleState::Queued
                    };
                    request.next_attempt_at = None;
                    self.commit(&guard, &mut request, to, "recovered after restart", closed.as_ref())
                        .await?;
                }
                LifecycleState::FailedRetryable => {
                    self.commit(&guard, &mut request, LifecycleState::Queued, "recovered after restart", None)
                        .await?;
                }
                _ => continue,
            }
            warn!("♻️ 请求 {} 已恢复为 {}", request.id, request.state);
            recovered += 1;
        }

        if recovered > 0 {
            info!("♻️ 共恢复 {} 个中断的请求", recovered);
        }
        Ok(recovered)
    }
}
