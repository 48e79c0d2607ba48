/// 日志工具模块
///
/// 提供日志初始化和格式化输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::orchestrator::PoolStats;

/// 初始化日志
///
/// `RUST_LOG` 优先；否则按 `verbose` 选择 debug 或 info
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("records_request_submit={},warn", default_level)));

    // 测试里可能重复初始化，忽略错误
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 公共记录申请自动提交");
    info!("🌐 目标门户: {} ({})", config.portal.target, config.portal.url);
    info!("📊 最大并发数: {}", config.submission.max_concurrent);
    info!("🔁 最大尝试次数: {}", config.submission.max_attempts);
    info!("📁 状态目录: {}", config.storage.state_dir.display());
    info!("📁 证据目录: {}", config.evidence.dir.display());
    info!("{}", "=".repeat(60));
}

/// 记录入队信息
pub fn log_intake_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 从申请目录读取到 {} 个新请求", total);
    info!("📋 最多同时提交 {} 个请求", max_concurrent);
}

/// 打印最终统计信息
pub fn print_final_stats(stats: &PoolStats, follow_up_file: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 运行结束统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("📨 处理: {}", stats.processed);
    info!("✅ 已受理: {}", stats.submitted);
    info!("❌ 已拒绝: {}", stats.rejected);
    info!("🔁 等待重试: {}", stats.requeued);
    info!("⚠️ 出错: {}", stats.errors);
    info!("{}", "=".repeat(60));
    info!("\n需要人工跟进的请求见: {}", follow_up_file);
}

/// 截断长文本用于日志显示
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_by_chars() {
        assert_eq!(truncate_text("门户返回错误页", 4), "门户返回...");
        assert_eq!(truncate_text("short", 10), "short");
    }
}
