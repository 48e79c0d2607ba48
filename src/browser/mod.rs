//! 浏览器资源
//!
//! 整个进程只持有一个 [`Browser`]，门户会话各自在上面开标签页。

mod connection;
mod headless;

use chromiumoxide::Browser;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BrowserConfig as BrowserSettings;
use crate::error::BrowserError;

pub use connection::connect_to_browser;
pub use headless::launch_headless_browser;

/// 配置了调试端口就连接现有浏览器，否则启动无头浏览器
pub async fn open_browser(settings: &BrowserSettings) -> Result<Arc<Browser>, BrowserError> {
    let browser = match settings.debug_port {
        Some(port) => connect_to_browser(port).await?,
        None => {
            launch_headless_browser(
                settings.executable.as_deref(),
                settings.proxy_url.as_deref(),
                Duration::from_secs(settings.session_timeout_secs),
            )
            .await?
        }
    };
    Ok(Arc::new(browser))
}
