use crate::models::request::{Priority, RequestFields};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 待入队的请求文件（一个 TOML 文件一个请求）
///
/// ```toml
/// priority = "priority"
/// report_type = "incident"
/// case_number = "2024-00123456"
///
/// [requestor]
/// first_name = "Jane"
/// last_name = "Doe"
/// email = "jane@example.com"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeRequest {
    #[serde(default)]
    pub priority: Priority,
    #[serde(flatten)]
    pub fields: RequestFields,
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
}

/// 从 TOML 文件加载一个待入队请求
pub async fn load_intake_file(toml_file_path: &Path) -> Result<IntakeRequest> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut intake: IntakeRequest = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    intake.file_path = Some(toml_file_path.to_path_buf());

    Ok(intake)
}

/// 从文件夹中加载所有待入队请求，解析失败的文件跳过并告警
pub async fn load_all_intake_files(folder_path: &Path) -> Result<Vec<IntakeRequest>> {
    if !folder_path.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path.display());
    }

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(folder_path)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    // 按文件名排序，保证同一批次内的入队顺序稳定
    paths.sort();

    let mut requests = Vec::new();
    for path in paths {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_intake_file(&path).await {
            Ok(intake) => {
                tracing::info!("成功加载请求: {}", intake.fields.report_type);
                requests.push(intake);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    Ok(requests)
}
