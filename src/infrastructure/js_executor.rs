//! JS 执行器 - 基础设施层
//!
//! 持有唯一的 page 资源，只暴露"执行 JS"和截图的能力

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::PortalError;

/// JS 执行器
///
/// 职责：
/// - 持有唯一的 Page 资源（一个会话一个标签页）
/// - 暴露 eval() 能力
/// - 不认识 Request / 门户表单
/// - 不处理业务流程
pub struct JsExecutor {
    page: Page,
}

impl JsExecutor {
    /// 创建新的 JS 执行器
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    /// 获取 page 的引用（用于其他操作）
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// 执行 JS 代码并返回 JSON 结果
    pub async fn eval(&self, js_code: impl Into<String>) -> Result<JsonValue, PortalError> {
        let result = self.page.evaluate(js_code.into()).await?;
        result
            .into_value()
            .map_err(|e| PortalError::transient("eval", e.to_string()))
    }

    /// 执行 JS 代码并反序列化为指定类型
    pub async fn eval_as<T: DeserializeOwned>(&self, js_code: impl Into<String>) -> Result<T, PortalError> {
        let json_value = self.eval(js_code).await?;
        serde_json::from_value(json_value).map_err(|e| PortalError::transient("eval", e.to_string()))
    }

    /// 页面可见文本
    pub async fn body_text(&self) -> Result<String, PortalError> {
        self.eval_as("document.body ? document.body.innerText : ''").await
    }

    /// 整页 PNG 截图
    pub async fn screenshot_png(&self) -> Result<Vec<u8>, PortalError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        Ok(self.page.screenshot(params).await?)
    }

    pub async fn current_url(&self) -> Option<String> {
        self.page.url().await.ok().flatten()
    }

    pub async fn title(&self) -> Option<String> {
        self.page.get_title().await.ok().flatten()
    }

    /// 关闭标签页
    pub async fn close(self) {
        if let Err(e) = self.page.close().await {
            debug!("关闭页面失败: {}", e);
        }
    }
}
