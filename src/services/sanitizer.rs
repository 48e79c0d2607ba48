//! 输入清洗服务 - 业务能力层
//!
//! 目标门户遇到 `< > & #` 这类字符会直接出错，所以任何网络动作之前都必须先清洗。
//!
//! - 纯外观问题（多余字符、控制字符、超长自由文本）静默修正并记录
//! - 清洗后为空或格式无效的字段直接返回 [`ValidationError`]，不会进入提交
//!
//! 清洗是幂等的：对清洗结果再清洗一次，结果不变且没有新的违规记录。

use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

use crate::config::SanitizerConfig;
use crate::error::ValidationError;
use crate::models::{ReportType, RequestFields, Requestor};

/// 违规类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// `<` 或 `>`
    AngleBracket,
    /// `&`
    Ampersand,
    /// `#`
    HashMark,
    /// 其他黑名单字符
    Blocked(char),
    /// 换行、制表符等控制字符
    ControlCharacter,
    /// 结构化字段中不允许的字符
    Disallowed,
    /// 自由文本超长被截断
    Truncated,
}

impl ViolationKind {
    fn for_blocked(c: char) -> Self {
        match c {
            '<' | '>' => ViolationKind::AngleBracket,
            '&' => ViolationKind::Ampersand,
            '#' => ViolationKind::HashMark,
            other => ViolationKind::Blocked(other),
        }
    }
}

/// 一条已修正的违规
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub kind: ViolationKind,
    pub occurrences: usize,
}

/// 清洗结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub fields: RequestFields,
    pub violations: Vec<Violation>,
}

/// 输入清洗服务
#[derive(Debug, Clone)]
pub struct Sanitizer {
    blocklist: Vec<char>,
    max_text_len: usize,
    max_name_len: usize,
    max_case_number_len: usize,
}

fn email_regex() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").ok())
        .as_ref()
}

impl Sanitizer {
    pub fn new(config: &SanitizerConfig) -> Self {
        // 空白和控制字符另有处理规则，放进黑名单会破坏幂等性
        let mut blocklist: Vec<char> = config
            .blocklist
            .chars()
            .filter(|c| !c.is_whitespace() && !c.is_control())
            .collect();
        blocklist.sort_unstable();
        blocklist.dedup();
        Self {
            blocklist,
            max_text_len: config.max_text_len.max(1),
            max_name_len: config.max_name_len.max(1),
            max_case_number_len: config.max_case_number_len.max(1),
        }
    }

    /// 清洗所有字段，日期相关规则以今天为准
    pub fn sanitize(&self, fields: &RequestFields) -> Result<Sanitized, ValidationError> {
        self.sanitize_on(fields, Utc::now().date_naive())
    }

    /// 清洗所有字段，日期相关规则以 `today` 为准
    pub fn sanitize_on(
        &self,
        fields: &RequestFields,
        today: NaiveDate,
    ) -> Result<Sanitized, ValidationError> {
        let mut violations = Vec::new();

        let case_number = match &fields.case_number {
            Some(raw) => self.clean_case_number(raw, &mut violations)?,
            None => None,
        };

        let requestor = Requestor {
            first_name: self
                .clean_optional(
                    "first_name",
                    Some(fields.requestor.first_name.as_str()),
                    self.max_name_len,
                    &mut violations,
                )?
                .unwrap_or_default(),
            last_name: self
                .clean_optional(
                    "last_name",
                    Some(fields.requestor.last_name.as_str()),
                    self.max_name_len,
                    &mut violations,
                )?
                .unwrap_or_default(),
            email: self.clean_email(&fields.requestor.email, &mut violations)?,
            phone: clean_phone(fields.requestor.phone.as_deref())?,
            company: self.clean_optional(
                "company",
                fields.requestor.company.as_deref(),
                self.max_name_len,
                &mut violations,
            )?,
            address: self.clean_optional(
                "address",
                fields.requestor.address.as_deref(),
                self.max_text_len,
                &mut violations,
            )?,
        };

        let officer_badge = match &fields.officer_badge {
            Some(raw) => self.clean_identifier("officer_badge", raw, &mut violations)?,
            None => None,
        };

        let cleaned = RequestFields {
            report_type: fields.report_type,
            case_number,
            requestor,
            incident_date: fields.incident_date,
            officer_badge,
            location: self.clean_optional(
                "location",
                fields.location.as_deref(),
                self.max_text_len,
                &mut violations,
            )?,
            description: self.clean_optional(
                "description",
                fields.description.as_deref(),
                self.max_text_len,
                &mut violations,
            )?,
        };

        check_report_restrictions(&cleaned, today)?;

        for v in &violations {
            debug!(
                "已修正字段 {}: {:?} × {}",
                v.field, v.kind, v.occurrences
            );
        }

        Ok(Sanitized {
            fields: cleaned,
            violations,
        })
    }

    /// 清洗一段自由文本
    ///
    /// 删除黑名单字符，控制字符替换为空格，合并连续空白，首尾去空，超长截断。
    pub fn clean_text(
        &self,
        field: &str,
        input: &str,
        max_len: usize,
        violations: &mut Vec<Violation>,
    ) -> String {
        let mut tally = Tally::new(field);
        let mut kept = String::with_capacity(input.len());

        for c in input.chars() {
            if self.blocklist.contains(&c) {
                tally.add(ViolationKind::for_blocked(c));
            } else if c.is_control() {
                tally.add(ViolationKind::ControlCharacter);
                kept.push(' ');
            } else {
                kept.push(c);
            }
        }

        let mut collapsed = kept.split_whitespace().collect::<Vec<_>>().join(" ");

        if collapsed.chars().count() > max_len {
            collapsed = collapsed.chars().take(max_len).collect::<String>();
            collapsed.truncate(collapsed.trim_end().len());
            tally.add(ViolationKind::Truncated);
        }

        tally.flush(violations);
        collapsed
    }

    fn clean_optional(
        &self,
        field: &str,
        input: Option<&str>,
        max_len: usize,
        violations: &mut Vec<Violation>,
    ) -> Result<Option<String>, ValidationError> {
        let Some(raw) = input else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let cleaned = self.clean_text(field, raw, max_len, violations);
        if cleaned.is_empty() {
            return Err(ValidationError::EmptyField {
                field: field.to_string(),
            });
        }
        Ok(Some(cleaned))
    }

    /// 案件编号：只保留字母数字和连字符，统一大写
    fn clean_case_number(
        &self,
        raw: &str,
        violations: &mut Vec<Violation>,
    ) -> Result<Option<String>, ValidationError> {
        let Some(cleaned) = self.clean_identifier("case_number", raw, violations)? else {
            return Ok(None);
        };
        if cleaned.chars().count() > self.max_case_number_len {
            return Err(ValidationError::InvalidShape {
                field: "case_number".to_string(),
                reason: format!("长度超过 {}", self.max_case_number_len),
            });
        }
        Ok(Some(cleaned))
    }

    fn clean_identifier(
        &self,
        field: &str,
        raw: &str,
        violations: &mut Vec<Violation>,
    ) -> Result<Option<String>, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let mut tally = Tally::new(field);
        let mut cleaned = String::with_capacity(trimmed.len());
        for c in trimmed.chars() {
            if c.is_ascii_alphanumeric() || c == '-' {
                cleaned.push(c.to_ascii_uppercase());
            } else if self.blocklist.contains(&c) {
                tally.add(ViolationKind::for_blocked(c));
            } else {
                tally.add(ViolationKind::Disallowed);
            }
        }
        tally.flush(violations);
        if cleaned.is_empty() {
            return Err(ValidationError::EmptyField {
                field: field.to_string(),
            });
        }
        Ok(Some(cleaned))
    }

    fn clean_email(
        &self,
        raw: &str,
        violations: &mut Vec<Violation>,
    ) -> Result<String, ValidationError> {
        let mut tally = Tally::new("email");
        let mut cleaned = String::with_capacity(raw.len());
        for c in raw.trim().chars() {
            if self.blocklist.contains(&c) {
                tally.add(ViolationKind::for_blocked(c));
            } else if c.is_whitespace() || c.is_control() {
                tally.add(ViolationKind::Disallowed);
            } else {
                cleaned.extend(c.to_lowercase());
            }
        }
        tally.flush(violations);

        if cleaned.is_empty() {
            return Err(ValidationError::EmptyField {
                field: "email".to_string(),
            });
        }
        if !email_regex().map_or(false, |re| re.is_match(&cleaned)) {
            return Err(ValidationError::InvalidShape {
                field: "email".to_string(),
                reason: format!("无效的邮箱格式: {}", cleaned),
            });
        }
        Ok(cleaned)
    }
}

/// 电话号码：只保留数字，美国 10 位号码（去掉国家码 1）
fn clean_phone(raw: Option<&str>) -> Result<Option<String>, ValidationError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        digits.remove(0);
    }
    if digits.len() != 10 {
        return Err(ValidationError::InvalidShape {
            field: "phone".to_string(),
            reason: format!("电话号码长度无效: {}", raw),
        });
    }
    Ok(Some(digits))
}

/// 各报告类型的附加要求
fn check_report_restrictions(fields: &RequestFields, today: NaiveDate) -> Result<(), ValidationError> {
    let report_type = fields.report_type;

    if report_type.requires_case_number() && fields.case_number.is_none() {
        return Err(ValidationError::EmptyField {
            field: "case_number".to_string(),
        });
    }

    if let Some(max_age_days) = report_type.max_age_days() {
        let Some(incident_date) = fields.incident_date else {
            return Err(ValidationError::ReportRestriction(format!(
                "{} 需要提供事件日期",
                report_type
            )));
        };
        if (today - incident_date).num_days() > max_age_days {
            return Err(ValidationError::ReportRestriction(format!(
                "{} 只能申请事件发生 {} 天以内的记录",
                report_type, max_age_days
            )));
        }
    }

    match report_type {
        ReportType::BodyCamera | ReportType::Surveillance
            if fields.case_number.is_none() && fields.officer_badge.is_none() =>
        {
            Err(ValidationError::ReportRestriction(format!(
                "{} 需要案件编号或警员编号",
                report_type
            )))
        }
        ReportType::CallsForService | ReportType::CrimeStatistics if fields.location.is_none() => {
            Err(ValidationError::ReportRestriction(format!(
                "{} 需要提供具体地址或区域",
                report_type
            )))
        }
        _ => Ok(()),
    }
}

/// 单个字段内按类型累计违规次数
struct Tally<'a> {
    field: &'a str,
    counts: Vec<(ViolationKind, usize)>,
}

impl<'a> Tally<'a> {
    fn new(field: &'a str) -> Self {
        Self {
            field,
            counts: Vec::new(),
        }
    }

    fn add(&mut self, kind: ViolationKind) {
        match self.counts.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, n)) => *n += 1,
            None => self.counts.push((kind, 1)),
        }
    }

    fn flush(self, violations: &mut Vec<Violation>) {
        violations.extend(self.counts.into_iter().map(|(kind, occurrences)| Violation {
            field: self.field.to_string(),
            kind,
            occurrences,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(&SanitizerConfig::default())
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn incident(description: &str) -> RequestFields {
        let mut fields = RequestFields::new(
            ReportType::Incident,
            Requestor {
                first_name: "Jane".to_string(),
                last_name: "Doe".to_string(),
                email: "Jane.Doe@Example.com".to_string(),
                ..Default::default()
            },
        );
        fields.case_number = Some("2024-000123".to_string());
        fields.description = Some(description.to_string());
        fields
    }

    #[test]
    fn strips_known_failure_characters() {
        let mut violations = Vec::new();
        let cleaned = sanitizer().clean_text("description", "Case #123 & <urgent>", 2000, &mut violations);

        assert_eq!(cleaned, "Case 123 urgent");
        assert_eq!(violations.len(), 3);
        let kinds: Vec<_> = violations.iter().map(|v| v.kind).collect();
        assert!(kinds.contains(&ViolationKind::HashMark));
        assert!(kinds.contains(&ViolationKind::Ampersand));
        assert!(kinds.contains(&ViolationKind::AngleBracket));
    }

    #[test]
    fn cosmetic_violations_are_not_fatal() {
        let result = sanitizer()
            .sanitize_on(&incident("Case #123 & <urgent>"), today())
            .unwrap();
        assert_eq!(result.fields.description.as_deref(), Some("Case 123 urgent"));
        assert_eq!(result.violations.len(), 3);
        assert_eq!(result.fields.requestor.email, "jane.doe@example.com");
    }

    #[test]
    fn control_characters_become_spaces() {
        let mut violations = Vec::new();
        let cleaned = sanitizer().clean_text("description", "line one\n\tline two", 2000, &mut violations);
        assert_eq!(cleaned, "line one line two");
        assert_eq!(
            violations,
            vec![Violation {
                field: "description".to_string(),
                kind: ViolationKind::ControlCharacter,
                occurrences: 2,
            }]
        );
    }

    #[test]
    fn long_text_is_truncated() {
        let mut violations = Vec::new();
        let cleaned = sanitizer().clean_text("description", "abc def ghi", 8, &mut violations);
        assert_eq!(cleaned, "abc def");
        assert_eq!(violations[0].kind, ViolationKind::Truncated);
    }

    #[test]
    fn field_emptied_by_cleaning_fails_fast() {
        let err = sanitizer().sanitize_on(&incident("<&#>"), today()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::EmptyField {
                field: "description".to_string()
            }
        );
    }

    #[test]
    fn case_number_is_normalized() {
        let mut fields = incident("ok");
        fields.case_number = Some(" 2024/00#12-ab ".to_string());
        let result = sanitizer().sanitize_on(&fields, today()).unwrap();
        assert_eq!(result.fields.case_number.as_deref(), Some("20240012-AB"));
    }

    #[test]
    fn invalid_email_is_fatal() {
        let mut fields = incident("ok");
        fields.requestor.email = "not-an-email".to_string();
        assert!(matches!(
            sanitizer().sanitize_on(&fields, today()),
            Err(ValidationError::InvalidShape { .. })
        ));
    }

    #[test]
    fn phone_keeps_ten_digits() {
        assert_eq!(
            clean_phone(Some("+1 (602) 555-0199")).unwrap().as_deref(),
            Some("6025550199")
        );
        assert!(clean_phone(Some("555-0199")).is_err());
        assert_eq!(clean_phone(Some("  ")).unwrap(), None);
    }

    #[test]
    fn recordings_911_respect_retention_window() {
        let mut fields = incident("ok");
        fields.report_type = ReportType::Recordings911;
        fields.incident_date = Some(today() - chrono::Duration::days(191));
        assert!(matches!(
            sanitizer().sanitize_on(&fields, today()),
            Err(ValidationError::ReportRestriction(_))
        ));

        fields.incident_date = Some(today() - chrono::Duration::days(30));
        assert!(sanitizer().sanitize_on(&fields, today()).is_ok());
    }

    #[test]
    fn body_camera_needs_case_or_badge() {
        let mut fields = incident("ok");
        fields.report_type = ReportType::BodyCamera;
        fields.case_number = None;
        assert!(sanitizer().sanitize_on(&fields, today()).is_err());

        fields.officer_badge = Some("b-1234".to_string());
        let result = sanitizer().sanitize_on(&fields, today()).unwrap();
        assert_eq!(result.fields.officer_badge.as_deref(), Some("B-1234"));
    }

    #[test]
    fn custom_blocklist_reports_each_character() {
        let config = SanitizerConfig {
            blocklist: "%$ ".to_string(),
            ..SanitizerConfig::default()
        };
        let mut violations = Vec::new();
        let cleaned = Sanitizer::new(&config).clean_text("description", "50% off $5", 100, &mut violations);
        assert_eq!(cleaned, "50 off 5");
        assert_eq!(violations.len(), 2);
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent(
            description in "\\PC{0,300}",
            first_name in "[ -~\\n\\t]{0,40}",
            case_number in "[A-Za-z0-9#&<> -]{1,30}",
        ) {
            let mut fields = incident(&description);
            fields.requestor.first_name = first_name;
            fields.case_number = Some(case_number);

            if let Ok(first) = sanitizer().sanitize_on(&fields, today()) {
                let second = sanitizer().sanitize_on(&first.fields, today()).unwrap();
                prop_assert_eq!(&second.fields, &first.fields);
                prop_assert!(second.violations.is_empty());
            }
        }
    }
}
