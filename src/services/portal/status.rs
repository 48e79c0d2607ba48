//! 门户状态词汇 → 内部状态分类

use phf::phf_map;
use serde::{Deserialize, Serialize};

/// 状态分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// 已受理，尚未处理
    Pending,
    /// 处理中
    InProgress,
    /// 记录已可领取
    Completed,
    /// 门户拒绝
    Denied,
    /// 无法识别
    Unknown,
}

impl StatusClass {
    pub fn is_resolved(self) -> bool {
        matches!(self, StatusClass::Completed | StatusClass::Denied)
    }
}

/// 门户状态原文（小写、空白归一）
static STATUS_VOCABULARY: phf::Map<&'static str, StatusClass> = phf_map! {
    "submitted" => StatusClass::Pending,
    "received" => StatusClass::Pending,
    "pending" => StatusClass::Pending,
    "new" => StatusClass::Pending,
    "awaiting payment" => StatusClass::Pending,
    "in progress" => StatusClass::InProgress,
    "processing" => StatusClass::InProgress,
    "under review" => StatusClass::InProgress,
    "assigned" => StatusClass::InProgress,
    "in review" => StatusClass::InProgress,
    "completed" => StatusClass::Completed,
    "complete" => StatusClass::Completed,
    "fulfilled" => StatusClass::Completed,
    "closed" => StatusClass::Completed,
    "ready for download" => StatusClass::Completed,
    "records available" => StatusClass::Completed,
    "denied" => StatusClass::Denied,
    "rejected" => StatusClass::Denied,
    "withdrawn" => StatusClass::Denied,
    "cancelled" => StatusClass::Denied,
    "no responsive records" => StatusClass::Denied,
};

/// 把门户状态原文归类
///
/// 先整句精确匹配，再在原文中找最长的已知短语。
pub fn classify(raw: &str) -> StatusClass {
    let normalized = normalize(raw);
    if normalized.is_empty() {
        return StatusClass::Unknown;
    }
    if let Some(class) = STATUS_VOCABULARY.get(normalized.as_str()) {
        return *class;
    }

    let padded = format!(" {} ", normalized);
    STATUS_VOCABULARY
        .entries()
        .filter(|(phrase, _)| padded.contains(&format!(" {} ", phrase)))
        .max_by_key(|(phrase, _)| phrase.len())
        .map(|(_, class)| *class)
        .unwrap_or(StatusClass::Unknown)
}

fn normalize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_vocabulary() {
        assert_eq!(classify("Pending"), StatusClass::Pending);
        assert_eq!(classify("IN PROGRESS"), StatusClass::InProgress);
        assert_eq!(classify("Ready for Download"), StatusClass::Completed);
        assert_eq!(classify("Denied"), StatusClass::Denied);
    }

    #[test]
    fn phrase_inside_sentence() {
        assert_eq!(classify("Status: Under Review (est. 30 days)"), StatusClass::InProgress);
        assert_eq!(classify("Your request has been closed."), StatusClass::Completed);
    }

    #[test]
    fn longest_phrase_wins() {
        assert_eq!(classify("Closed - no responsive records"), StatusClass::Denied);
    }

    #[test]
    fn unknown_text() {
        assert_eq!(classify(""), StatusClass::Unknown);
        assert_eq!(classify("Lorem ipsum"), StatusClass::Unknown);
        assert!(!classify("something else").is_resolved());
    }
}
