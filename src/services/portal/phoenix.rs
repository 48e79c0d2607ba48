//! Phoenix PD 公共记录门户驱动
//!
//! 所有会话共享一个浏览器进程，每个会话独占一个标签页。

use async_trait::async_trait;
use chromiumoxide::element::Element;
use chromiumoxide::Browser;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PortalError;
use crate::infrastructure::JsExecutor;
use crate::models::{ExternalRef, RequestFields};
use crate::services::evidence::Snapshot;
use crate::services::pacing::{pause, PacingModel, StepKind};
use crate::services::portal::page_classifier::{self, PageVerdict};
use crate::services::portal::status::StatusClass;
use crate::services::portal::{Confirmation, ExternalStatus, PortalDriver, PortalSession, UNCONFIRMED_STEP};
use crate::utils::truncate_text;

pub const PORTAL_ID: &str = "phoenix_pd";

const REQUEST_LINK_PATTERNS: &[&str] = &["records request", "public records", "police report", "request a report"];

const SUBMIT_SELECTORS: &[&str] = &[
    "button[type='submit']",
    "input[type='submit']",
    "input[value*='Submit']",
];

const STATUS_INPUT_SELECTORS: &[&str] = &[
    "input[name*='confirmation']",
    "input[name*='reference']",
    "input[name*='request']",
    "input[id*='confirmation']",
    "input[placeholder*='onfirmation']",
];

/// 表单字段及其候选选择器
struct FieldSlot {
    name: &'static str,
    selectors: &'static [&'static str],
}

const CASE_NUMBER: FieldSlot = FieldSlot {
    name: "case_number",
    selectors: &["input[name*='case']", "input[id*='case']", "input[placeholder*='ase']", "input[name*='report']"],
};
const FIRST_NAME: FieldSlot = FieldSlot {
    name: "first_name",
    selectors: &["input[name*='first']", "input[name*='fname']", "input[id*='first']"],
};
const LAST_NAME: FieldSlot = FieldSlot {
    name: "last_name",
    selectors: &["input[name*='last']", "input[name*='lname']", "input[id*='last']"],
};
const EMAIL: FieldSlot = FieldSlot {
    name: "email",
    selectors: &["input[type='email']", "input[name*='email']", "input[id*='email']"],
};
const PHONE: FieldSlot = FieldSlot {
    name: "phone",
    selectors: &["input[type='tel']", "input[name*='phone']", "input[id*='phone']"],
};
const COMPANY: FieldSlot = FieldSlot {
    name: "company",
    selectors: &["input[name*='company']", "input[name*='organization']", "input[id*='company']"],
};
const ADDRESS: FieldSlot = FieldSlot {
    name: "address",
    selectors: &["input[name*='address']", "input[id*='address']", "textarea[name*='address']"],
};
const INCIDENT_DATE: FieldSlot = FieldSlot {
    name: "incident_date",
    selectors: &["input[type='date']", "input[name*='date']", "input[id*='date']"],
};
const OFFICER_BADGE: FieldSlot = FieldSlot {
    name: "officer_badge",
    selectors: &["input[name*='officer']", "input[name*='badge']", "input[id*='badge']"],
};
const LOCATION: FieldSlot = FieldSlot {
    name: "location",
    selectors: &["input[name*='location']", "input[name*='area']", "input[id*='location']"],
};
const DESCRIPTION: FieldSlot = FieldSlot {
    name: "description",
    selectors: &["textarea[name*='description']", "textarea[name*='detail']", "textarea"],
};

/// Phoenix PD 门户
pub struct PhoenixPortal {
    browser: Arc<Browser>,
    portal_url: String,
    status_url: String,
    pacing: Arc<dyn PacingModel>,
}

impl PhoenixPortal {
    pub fn new(
        browser: Arc<Browser>,
        portal_url: impl Into<String>,
        status_url: impl Into<String>,
        pacing: Arc<dyn PacingModel>,
    ) -> Self {
        Self {
            browser,
            portal_url: portal_url.into(),
            status_url: status_url.into(),
            pacing,
        }
    }
}

#[async_trait]
impl PortalDriver for PhoenixPortal {
    fn portal_id(&self) -> &str {
        PORTAL_ID
    }

    async fn open_session(&self) -> Result<Box<dyn PortalSession>, PortalError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| PortalError::transient("open_session", e.to_string()))?;
        debug!("已为门户会话创建新标签页");

        Ok(Box::new(PhoenixSession {
            js: JsExecutor::new(page),
            portal_url: self.portal_url.clone(),
            status_url: self.status_url.clone(),
            pacing: self.pacing.clone(),
            captures: Vec::new(),
            submit_dispatched: false,
        }))
    }
}

/// 一个标签页上的门户会话
pub struct PhoenixSession {
    js: JsExecutor,
    portal_url: String,
    status_url: String,
    pacing: Arc<dyn PacingModel>,
    captures: Vec<Snapshot>,
    /// 申请表单的提交按钮已点击
    submit_dispatched: bool,
}

impl PhoenixSession {
    async fn goto(&self, url: &str, step: &str) -> Result<(), PortalError> {
        self.js
            .page()
            .goto(url)
            .await
            .map_err(|e| PortalError::transient(step, format!("{} 加载失败: {}", url, e)))?;
        pause(self.pacing.as_ref(), StepKind::PageLoad).await;

        let text = self.js.body_text().await?;
        if page_classifier::is_retriable_page(&text) {
            return Err(PortalError::transient(step, "门户返回错误页"));
        }
        Ok(())
    }

    /// 截图失败只告警，中间步骤的证据不影响流程
    async fn capture(&mut self, step: &str) {
        match self.snapshot(step).await {
            Ok(snapshot) => self.captures.push(snapshot),
            Err(e) => warn!("截图失败 ({}): {}", step, e),
        }
    }

    /// 没有直达表单时，点击入口链接
    async fn open_request_form(&self) -> Result<(), PortalError> {
        let has_form: bool = self.js.eval_as("document.querySelectorAll('form').length > 0").await?;
        if has_form {
            return Ok(());
        }

        let patterns = serde_json::to_string(REQUEST_LINK_PATTERNS)
            .map_err(|e| PortalError::transient("find_form", e.to_string()))?;
        let script = format!(
            r#"(() => {{
                const patterns = {patterns};
                const links = Array.from(document.querySelectorAll('a, button'));
                const hit = links.find(el => {{
                    const text = (el.innerText || '').toLowerCase();
                    return patterns.some(p => text.includes(p));
                }});
                if (!hit) return false;
                hit.click();
                return true;
            }})()"#
        );
        if !self.js.eval_as::<bool>(script).await? {
            return Err(PortalError::transient("find_form", "找不到申请入口"));
        }
        if let Err(e) = self.js.page().wait_for_navigation().await {
            debug!("入口链接未触发导航: {}", e);
        }
        pause(self.pacing.as_ref(), StepKind::PageLoad).await;
        Ok(())
    }

    async fn select_report_type(&self, fields: &RequestFields) -> Result<(), PortalError> {
        let value = json_str(fields.report_type.form_value())?;
        let label = json_str(fields.report_type.display_name())?;
        let script = format!(
            r#"(() => {{
                const value = {value};
                const label = {label};
                const input = document.querySelector(`input[type='radio'][value*='${{value}}'], input[type='checkbox'][value*='${{value}}']`);
                if (input) {{ input.click(); return true; }}
                for (const select of document.querySelectorAll('select')) {{
                    const option = Array.from(select.options).find(o => o.value.includes(value) || o.text.includes(label));
                    if (option) {{
                        select.value = option.value;
                        select.dispatchEvent(new Event('change', {{ bubbles: true }}));
                        return true;
                    }}
                }}
                const labelEl = Array.from(document.querySelectorAll('label')).find(l => l.innerText.includes(label));
                if (labelEl) {{ labelEl.click(); return true; }}
                return false;
            }})()"#
        );
        if !self.js.eval_as::<bool>(script).await? {
            return Err(PortalError::transient(
                "select_report_type",
                format!("找不到报告类型选项: {}", fields.report_type.display_name()),
            ));
        }
        pause(self.pacing.as_ref(), StepKind::FieldGap).await;
        Ok(())
    }

    /// 按候选选择器找到第一个可见输入框，清空后逐字输入
    async fn fill_slot(&self, slot: &FieldSlot, value: &str) -> Result<bool, PortalError> {
        for selector in slot.selectors {
            let quoted = json_str(selector)?;
            let cleared: bool = self
                .js
                .eval_as(format!(
                    r#"(() => {{
                        const el = document.querySelector({quoted});
                        if (!el || el.offsetParent === null) return false;
                        el.focus();
                        el.value = '';
                        return true;
                    }})()"#
                ))
                .await?;
            if !cleared {
                continue;
            }

            let element = self.js.page().find_element(*selector).await?;
            element.click().await?;
            for ch in value.chars() {
                element.type_str(ch.to_string()).await?;
                pause(self.pacing.as_ref(), StepKind::Keystroke).await;
            }
            debug!("已填写字段 {}", slot.name);
            pause(self.pacing.as_ref(), StepKind::FieldGap).await;
            return Ok(true);
        }
        debug!("页面上没有字段 {}", slot.name);
        Ok(false)
    }

    async fn fill_form(&self, fields: &RequestFields) -> Result<usize, PortalError> {
        let requestor = &fields.requestor;
        let date = fields.incident_date.map(|d| d.format("%m/%d/%Y").to_string());
        let plan: [(&FieldSlot, Option<&str>); 11] = [
            (&CASE_NUMBER, fields.case_number.as_deref()),
            (&FIRST_NAME, Some(requestor.first_name.as_str())),
            (&LAST_NAME, Some(requestor.last_name.as_str())),
            (&EMAIL, Some(requestor.email.as_str())),
            (&PHONE, requestor.phone.as_deref()),
            (&COMPANY, requestor.company.as_deref()),
            (&ADDRESS, requestor.address.as_deref()),
            (&INCIDENT_DATE, date.as_deref()),
            (&OFFICER_BADGE, fields.officer_badge.as_deref()),
            (&LOCATION, fields.location.as_deref()),
            (&DESCRIPTION, fields.description.as_deref()),
        ];

        let mut filled = 0;
        for (slot, value) in plan {
            match value {
                Some(v) if !v.is_empty() => {
                    if self.fill_slot(slot, v).await? {
                        filled += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(filled)
    }

    async fn find_submit_button(&self) -> Result<Element, PortalError> {
        for selector in SUBMIT_SELECTORS {
            if let Ok(button) = self.js.page().find_element(*selector).await {
                button.scroll_into_view().await?;
                return Ok(button);
            }
        }
        Err(PortalError::transient("submit", "找不到提交按钮"))
    }
}

#[async_trait]
impl PortalSession for PhoenixSession {
    async fn navigate(&mut self) -> Result<(), PortalError> {
        info!("正在打开门户: {}", self.portal_url);
        let url = self.portal_url.clone();
        self.goto(&url, "navigate").await?;

        let title = self.js.title().await.unwrap_or_default().to_lowercase();
        if !(title.contains("phoenix") || title.contains("public safety") || title.contains("records")) {
            return Err(PortalError::transient("navigate", format!("页面标题不符: {}", title)));
        }

        self.open_request_form().await?;
        pause(self.pacing.as_ref(), StepKind::ReadForm).await;
        self.capture("request_form_page").await;
        Ok(())
    }

    async fn fill_and_submit(&mut self, fields: &RequestFields) -> Result<Confirmation, PortalError> {
        self.select_report_type(fields).await?;
        let filled = self.fill_form(fields).await?;
        if filled < 2 {
            return Err(PortalError::transient(
                "fill_form",
                format!("只填写了 {} 个字段，表单结构可能已变化", filled),
            ));
        }
        self.capture("form_filled").await;

        pause(self.pacing.as_ref(), StepKind::BeforeSubmit).await;
        self.capture("pre_submit").await;
        let button = self.find_submit_button().await?;

        // 点击提交之后门户可能已经受理，任何失败都不能再重试
        self.submit_dispatched = true;
        button
            .click()
            .await
            .map_err(|e| PortalError::permanent(UNCONFIRMED_STEP, format!("点击提交按钮出错: {}", e)))?;
        if let Err(e) = self.js.page().wait_for_navigation().await {
            debug!("提交后未触发导航: {}", e);
        }
        pause(self.pacing.as_ref(), StepKind::AfterSubmit).await;
        let text = self
            .js
            .body_text()
            .await
            .map_err(|e| PortalError::permanent(UNCONFIRMED_STEP, format!("提交后无法读取页面: {}", e)))?;

        let (reference, message) = submitted_page_outcome(&text)?;
        info!("✓ 门户已受理，确认编号: {}", reference);
        Ok(Confirmation {
            reference: ExternalRef(reference),
            message,
            page_url: self.js.current_url().await,
        })
    }

    async fn query_status(&mut self, reference: &ExternalRef) -> Result<ExternalStatus, PortalError> {
        let url = self.status_url.clone();
        self.goto(&url, "query_status").await?;
        pause(self.pacing.as_ref(), StepKind::StatusCheck).await;

        let mut entered = false;
        for selector in STATUS_INPUT_SELECTORS {
            if let Ok(input) = self.js.page().find_element(*selector).await {
                input.click().await?;
                for ch in reference.0.chars() {
                    input.type_str(ch.to_string()).await?;
                    pause(self.pacing.as_ref(), StepKind::Keystroke).await;
                }
                entered = true;
                break;
            }
        }
        if !entered {
            return Err(PortalError::transient("query_status", "找不到状态查询输入框"));
        }

        self.find_submit_button().await?.click().await?;
        if let Err(e) = self.js.page().wait_for_navigation().await {
            debug!("状态查询未触发导航: {}", e);
        }
        pause(self.pacing.as_ref(), StepKind::PageLoad).await;

        let text = self.js.body_text().await?;
        if page_classifier::is_retriable_page(&text) {
            return Err(PortalError::transient("query_status", "门户返回错误页"));
        }
        Ok(match page_classifier::extract_status(&text) {
            Some(raw) => ExternalStatus::from_raw(raw),
            None => {
                debug!("状态页没有状态行: {}", truncate_text(&text, 200));
                ExternalStatus {
                    raw: String::new(),
                    class: StatusClass::Unknown,
                }
            }
        })
    }

    async fn snapshot(&mut self, step: &str) -> Result<Snapshot, PortalError> {
        let image = self.js.screenshot_png().await?;
        Ok(Snapshot {
            step: step.to_string(),
            image,
            page_url: self.js.current_url().await,
            page_title: self.js.title().await,
        })
    }

    fn drain_captures(&mut self) -> Vec<Snapshot> {
        std::mem::take(&mut self.captures)
    }

    fn submit_dispatched(&self) -> bool {
        self.submit_dispatched
    }

    async fn close(self: Box<Self>) {
        self.js.close().await;
    }
}

fn json_str(value: &str) -> Result<String, PortalError> {
    serde_json::to_string(value).map_err(|e| PortalError::transient("script", e.to_string()))
}

/// 提交后页面的结论：确认编号和提示语，或不可重试的错误
///
/// 点击提交之后门户可能已经受理，错误页也不能证明没有受理，所以没有暂时性错误。
fn submitted_page_outcome(text: &str) -> Result<(String, Option<String>), PortalError> {
    match page_classifier::classify_submission(text) {
        PageVerdict::Confirmed { reference, message } => Ok((reference, message)),
        PageVerdict::Retriable(detail) => {
            warn!("提交后门户返回错误页: {}", detail);
            Err(PortalError::permanent(
                UNCONFIRMED_STEP,
                format!("提交后门户返回错误页，无法确认是否受理: {}", detail),
            ))
        }
        PageVerdict::Rejected(detail) => Err(PortalError::permanent("after_submit", detail)),
        PageVerdict::Unconfirmable => {
            warn!("提交后页面: {}", truncate_text(text, 200));
            Err(PortalError::permanent(UNCONFIRMED_STEP, "提交后未找到确认编号，需要人工核实"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_of(result: Result<(String, Option<String>), PortalError>) -> String {
        match result {
            Err(PortalError::Permanent { step, .. }) => step,
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn error_page_after_submit_goes_to_follow_up() {
        let result = submitted_page_outcome("503 Service Unavailable. Please try again later.");
        assert_eq!(step_of(result), UNCONFIRMED_STEP);
    }

    #[test]
    fn unrecognized_page_after_submit_goes_to_follow_up() {
        assert_eq!(
            step_of(submitted_page_outcome("Welcome to the Phoenix Public Safety portal")),
            UNCONFIRMED_STEP
        );
    }
}
