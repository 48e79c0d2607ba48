use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::RejectionReason;
use crate::models::report_type::ReportType;
use crate::models::state::LifecycleState;

/// 请求唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 优先级：`Priority` 类整体排在 `Standard` 之前，类内先进先出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Priority,
    Standard,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Standard
    }
}

/// 门户分配的外部跟踪编号，一经设置不可更改
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRef(pub String);

impl fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 申请人信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requestor {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// 门户表单需要的字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFields {
    pub report_type: ReportType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_number: Option<String>,
    pub requestor: Requestor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub officer_badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// 自由文本说明
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RequestFields {
    pub fn new(report_type: ReportType, requestor: Requestor) -> Self {
        Self {
            report_type,
            case_number: None,
            requestor,
            incident_date: None,
            officer_badge: None,
            location: None,
            description: None,
        }
    }
}

/// 请求：一次预期提交的工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub fields: RequestFields,
    pub priority: Priority,
    /// 入队序号，用于类内 FIFO
    pub sequence: u64,
    pub state: LifecycleState,
    pub attempt_count: u32,
    pub external_ref: Option<ExternalRef>,
    pub abandon_requested: bool,
    pub rejection: Option<RejectionReason>,
    /// 退避结束前不会被再次认领
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub consecutive_poll_failures: u32,
    /// 每次持久化加一
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn new(fields: RequestFields, priority: Priority, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new(),
            fields,
            priority,
            sequence,
            state: LifecycleState::Queued,
            attempt_count: 0,
            external_ref: None,
            abandon_requested: false,
            rejection: None,
            next_attempt_at: None,
            submitted_at: None,
            last_polled_at: None,
            consecutive_poll_failures: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// 退避时间已过，可以被认领
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == LifecycleState::Queued && self.next_attempt_at.map_or(true, |t| t <= now)
    }

    /// 从受理时刻起算的年龄
    pub fn age_since_submission(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.submitted_at.unwrap_or(self.created_at)
    }
}
