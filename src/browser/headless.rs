use std::path::Path;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::error::BrowserError;

/// 启动无头浏览器
///
/// `executable` 为空时由 chromiumoxide 自动查找本机的 Chrome / Chromium
pub async fn launch_headless_browser(
    executable: Option<&Path>,
    proxy_url: Option<&str>,
    request_timeout: Duration,
) -> Result<Browser, BrowserError> {
    info!("🚀 启动无头浏览器...");

    let mut args = vec![
        "--disable-gpu".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
    ];
    if let Some(proxy) = proxy_url {
        debug!("使用代理: {}", proxy);
        args.push(format!("--proxy-server={}", proxy));
    }

    let mut builder = BrowserConfig::builder()
        .new_headless_mode()
        .request_timeout(request_timeout)
        .args(args);
    if let Some(path) = executable {
        debug!("浏览器可执行文件: {}", path.display());
        builder = builder.chrome_executable(path);
    }
    let config = builder.build().map_err(|e| {
        error!("配置无头浏览器失败: {}", e);
        BrowserError::LaunchFailed(e)
    })?;

    let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
        error!("启动无头浏览器失败: {}", e);
        BrowserError::LaunchFailed(e.to_string())
    })?;
    debug!("无头浏览器启动成功");

    // 在后台处理浏览器事件
    tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    sleep(tokio::time::Duration::from_millis(300)).await;
    info!("✅ 无头浏览器已就绪");

    Ok(browser)
}
