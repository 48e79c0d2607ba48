use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::request::RequestId;

/// 证据记录标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvidenceId(pub Uuid);

impl EvidenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EvidenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 证据记录（不可变）
///
/// 截图内容按 SHA-256 摘要寻址存放，记录本身只保存指针和元数据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: EvidenceId,
    pub request_id: RequestId,
    pub attempt_number: u32,
    /// 同一请求内的采集顺序
    pub sequence: u64,
    pub step: String,
    pub captured_at: DateTime<Utc>,
    /// 截图内容的 SHA-256（hex）
    pub digest: String,
    /// 可取回的制品引用
    pub artifact: String,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub byte_len: usize,
}
