use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::models::request::RequestId;
use crate::models::state::LifecycleState;

/// 状态转换事件，交给外部通知 / 计费边界消费
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub request_id: RequestId,
    /// 入队时为空
    pub from: Option<LifecycleState>,
    pub to: LifecycleState,
    pub at: DateTime<Utc>,
    pub reason: String,
    /// 进入 `Rejected` / `Expired` 时的失败分类
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl TransitionEvent {
    pub fn new(
        request_id: RequestId,
        from: Option<LifecycleState>,
        to: LifecycleState,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            from,
            to,
            at: Utc::now(),
            reason: reason.into(),
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: Option<FailureKind>) -> Self {
        self.failure = failure;
        self
    }
}
