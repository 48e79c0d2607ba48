//! 页面文本分类
//!
//! 提交后的页面只能靠文本判断结果：拿到编号、可重试的错误页、门户拒绝，或者都不是。

use regex::Regex;
use std::sync::OnceLock;

/// 提交结果页的判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageVerdict {
    /// 找到确认编号
    Confirmed {
        reference: String,
        message: Option<String>,
    },
    /// 门户返回可重试的错误页
    Retriable(String),
    /// 门户拒绝
    Rejected(String),
    /// 既没有编号也没有已知的失败提示
    Unconfirmable,
}

const RETRIABLE_PHRASES: &[&str] = &[
    "service unavailable",
    "temporarily unavailable",
    "try again later",
    "please try again",
    "too many requests",
    "gateway timeout",
    "bad gateway",
    "session has expired",
    "session expired",
    "internal server error",
];

const REJECTION_PHRASES: &[&str] = &[
    "is invalid",
    "invalid case",
    "not a valid",
    "is required",
    "not found",
    "could not be processed",
    "has been rejected",
    "request denied",
    "not eligible",
];

const SUCCESS_INDICATORS: &[&str] = &[
    "thank you",
    "successfully",
    "has been received",
    "submitted",
    "confirmation",
];

fn confirmation_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)confirmation\s*(?:number|no\.?|#)?\s*:?\s*([A-Z0-9][A-Z0-9-]{3,})",
            r"(?i)reference\s*(?:number|no\.?|#)?\s*:?\s*([A-Z0-9][A-Z0-9-]{3,})",
            r"(?i)request\s*(?:id|number|#)\s*:?\s*([A-Z0-9][A-Z0-9-]{3,})",
            r"(?i)tracking\s*(?:number|no\.?|#)?\s*:?\s*([A-Z0-9][A-Z0-9-]{3,})",
            r"(?i)ticket\s*(?:number|no\.?|#)?\s*:?\s*([A-Z0-9][A-Z0-9-]{3,})",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn status_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?im)^\s*(?:request\s+)?status\s*:?\s*(.+?)\s*$").ok())
        .as_ref()
}

/// 从页面文本中提取确认编号
///
/// 编号必须含数字，避免把 "Confirmation: received" 之类的提示语当成编号。
pub fn extract_reference(text: &str) -> Option<String> {
    confirmation_patterns().iter().find_map(|re| {
        re.captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim_end_matches('-').to_ascii_uppercase())
            .find(|candidate| candidate.len() >= 4 && candidate.chars().any(|c| c.is_ascii_digit()))
    })
}

/// 判定提交结果页
pub fn classify_submission(text: &str) -> PageVerdict {
    if let Some(reference) = extract_reference(text) {
        return PageVerdict::Confirmed {
            reference,
            message: success_message(text),
        };
    }

    let lower = text.to_lowercase();
    if let Some(phrase) = RETRIABLE_PHRASES.iter().find(|p| lower.contains(*p)) {
        return PageVerdict::Retriable(sentence_containing(text, phrase).unwrap_or_else(|| phrase.to_string()));
    }
    if let Some(phrase) = REJECTION_PHRASES.iter().find(|p| lower.contains(*p)) {
        return PageVerdict::Rejected(sentence_containing(text, phrase).unwrap_or_else(|| phrase.to_string()));
    }
    PageVerdict::Unconfirmable
}

/// 页面上是否是可重试的错误
pub fn is_retriable_page(text: &str) -> bool {
    let lower = text.to_lowercase();
    RETRIABLE_PHRASES.iter().any(|p| lower.contains(p))
}

/// 从状态查询页提取状态原文
pub fn extract_status(text: &str) -> Option<String> {
    status_pattern()?
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}

fn success_message(text: &str) -> Option<String> {
    SUCCESS_INDICATORS
        .iter()
        .find_map(|indicator| sentence_containing(text, indicator))
}

fn sentence_containing(text: &str, phrase: &str) -> Option<String> {
    text.split(|c| c == '.' || c == '\n')
        .map(str::trim)
        .find(|s| s.to_lowercase().contains(phrase))
        .map(str::to_string)
}
