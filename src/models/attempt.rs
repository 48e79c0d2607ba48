use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::evidence::EvidenceId;
use crate::models::request::RequestId;

/// 一次提交尝试的标识：请求 + 尝试序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId {
    pub request_id: RequestId,
    pub number: u32,
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.request_id, self.number)
    }
}

/// 尝试结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// 进行中，尚未落盘结果
    Open,
    Success,
    TransientFailure,
    PermanentFailure,
}

/// 一次提交尝试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub request_id: RequestId,
    /// 从 1 开始连续递增
    pub number: u32,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub evidence: Vec<EvidenceId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn open(request_id: RequestId, number: u32) -> Self {
        Self {
            request_id,
            number,
            outcome: AttemptOutcome::Open,
            error: None,
            evidence: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn id(&self) -> AttemptId {
        AttemptId {
            request_id: self.request_id,
            number: self.number,
        }
    }

    pub fn is_open(&self) -> bool {
        self.outcome == AttemptOutcome::Open
    }

    /// 记录结果并关闭
    pub fn close(&mut self, outcome: AttemptOutcome, error: Option<String>) {
        self.outcome = outcome;
        self.error = error;
        self.ended_at = Some(Utc::now());
    }
}
