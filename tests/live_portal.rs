use std::sync::Arc;

use records_request_submit::browser::open_browser;
use records_request_submit::config::Config;
use records_request_submit::services::{FixedPacing, PhoenixPortal, PortalDriver, PortalSession};
use records_request_submit::utils::logging;

#[tokio::test]
#[ignore] // 默认忽略，需要手动运行：cargo test -- --ignored
async fn test_open_request_form() {
    logging::init(true);

    let config = Config::load().expect("加载配置失败");
    let browser = open_browser(&config.browser).await.expect("打开浏览器失败");

    let portal = PhoenixPortal::new(
        browser,
        config.portal.url.clone(),
        config.portal.status_url.clone(),
        Arc::new(FixedPacing::zero()),
    );

    // 只打开表单，不提交
    let mut session = portal.open_session().await.expect("创建会话失败");
    session.navigate().await.expect("打开申请表单失败");

    let snapshot = session.snapshot("live_form").await.expect("截图失败");
    assert!(!snapshot.image.is_empty(), "截图不应为空");

    session.close().await;
}

#[tokio::test]
#[ignore]
async fn test_browser_connection() {
    logging::init(true);

    let config = Config::load().expect("加载配置失败");
    let result = open_browser(&config.browser).await;

    assert!(result.is_ok(), "应该能够成功连接浏览器");
}
