//! 人工跟进写入服务 - 业务能力层
//!
//! 只负责把需要人工处理的请求追加到跟进文件，不关心流程

use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::models::Request;

/// 人工跟进写入服务
///
/// 职责：
/// - 将过期未决、提交后无法确认的请求写入跟进文件
/// - 每行一条，只追加
pub struct FollowUpWriter {
    path: PathBuf,
}

impl FollowUpWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// 追加一条跟进记录
    pub async fn write(&self, request: &Request, note: &str) -> std::io::Result<()> {
        debug!("写入人工跟进: 请求 {} | {}", request.id, note);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let line = format!(
            "{} | 请求 {} | {} | 外部编号: {} | 状态: {} | {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            request.id,
            request.fields.report_type.display_name(),
            request
                .external_ref
                .as_ref()
                .map(|r| r.0.as_str())
                .unwrap_or("-"),
            request.state,
            note
        );
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
