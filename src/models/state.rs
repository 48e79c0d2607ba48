//! 请求生命周期状态机
//!
//! ```text
//! Queued → Submitting → Submitted → (Reconciling) → Completed | Rejected | Expired
//!              ↓   ↑
//!       FailedRetryable → Queued | Rejected
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// 等待提交
    Queued,
    /// 已被认领，正在提交
    Submitting,
    /// 门户已受理，持有外部编号
    Submitted,
    /// 门户反馈正在处理
    Reconciling,
    /// 暂时性失败，将退避后回到队列
    FailedRetryable,
    /// 门户已完成
    Completed,
    /// 被拒绝（校验、门户拒绝、重试耗尽、放弃）
    Rejected,
    /// 超过最大年龄仍无结果
    Expired,
}

impl LifecycleState {
    /// 终态：不会再有自动转换
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Completed | LifecycleState::Rejected | LifecycleState::Expired
        )
    }

    /// 是否属于对账轮询集合
    pub fn is_polling(self) -> bool {
        matches!(self, LifecycleState::Submitted | LifecycleState::Reconciling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Queued => "queued",
            LifecycleState::Submitting => "submitting",
            LifecycleState::Submitted => "submitted",
            LifecycleState::Reconciling => "reconciling",
            LifecycleState::FailedRetryable => "failed_retryable",
            LifecycleState::Completed => "completed",
            LifecycleState::Rejected => "rejected",
            LifecycleState::Expired => "expired",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 给定状态允许转换到的状态
pub fn allowed_transitions(from: LifecycleState) -> &'static [LifecycleState] {
    use LifecycleState::*;
    match from {
        // Submitted: 已有外部编号时的短路；Rejected: 校验失败或放弃
        Queued => &[Submitting, Submitted, Rejected],
        // Queued: 崩溃恢复
        Submitting => &[Submitted, FailedRetryable, Rejected, Queued],
        FailedRetryable => &[Queued, Rejected],
        Submitted => &[Reconciling, Completed, Rejected, Expired],
        Reconciling => &[Completed, Rejected, Expired],
        Completed | Rejected | Expired => &[],
    }
}

pub fn is_allowed(from: LifecycleState, to: LifecycleState) -> bool {
    allowed_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for state in [Completed, Rejected, Expired] {
            assert!(state.is_terminal());
            assert!(allowed_transitions(state).is_empty());
        }
    }

    #[test]
    fn failed_retryable_only_returns_to_queue_or_rejects() {
        assert!(is_allowed(FailedRetryable, Queued));
        assert!(is_allowed(FailedRetryable, Rejected));
        assert!(!is_allowed(FailedRetryable, Submitting));
        assert!(!is_allowed(FailedRetryable, Submitted));
    }

    #[test]
    fn only_reconciler_states_reach_completed() {
        assert!(is_allowed(Submitted, Completed));
        assert!(is_allowed(Reconciling, Completed));
        assert!(!is_allowed(Submitting, Completed));
        assert!(!is_allowed(Queued, Completed));
    }

    #[test]
    fn polling_set_is_submitted_and_reconciling() {
        let polling: Vec<_> = [
            Queued,
            Submitting,
            Submitted,
            Reconciling,
            FailedRetryable,
            Completed,
            Rejected,
            Expired,
        ]
        .into_iter()
        .filter(|s| s.is_polling())
        .collect();
        assert_eq!(polling, vec![Submitted, Reconciling]);
    }
}
