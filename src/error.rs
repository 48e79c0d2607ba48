use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{LifecycleState, RequestId};

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 浏览器相关错误
    #[error("浏览器错误: {0}")]
    Browser(#[from] BrowserError),
    /// 门户交互错误
    #[error("门户错误: {0}")]
    Portal(#[from] PortalError),
    /// 输入校验错误
    #[error("校验错误: {0}")]
    Validation(#[from] ValidationError),
    /// 持久化错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 证据存储错误
    #[error("证据错误: {0}")]
    Evidence(#[from] EvidenceError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

/// 浏览器相关错误
#[derive(Debug, Error)]
pub enum BrowserError {
    /// 连接浏览器失败
    #[error("无法连接到浏览器 (端口: {port}): {source}")]
    ConnectionFailed {
        port: u16,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 启动浏览器失败
    #[error("启动浏览器失败: {0}")]
    LaunchFailed(String),
}

/// 门户交互错误
///
/// 只有两类：可重试的和不可重试的。判断依据是门户的行为，而不是底层库的错误类型。
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortalError {
    /// 网络超时、页面加载失败、门户返回可重试的错误页
    #[error("门户暂时性错误 ({step}): {detail}")]
    Transient { step: String, detail: String },
    /// 门户明确拒绝
    #[error("门户拒绝 ({step}): {detail}")]
    Permanent { step: String, detail: String },
}

impl PortalError {
    pub fn transient(step: impl Into<String>, detail: impl Into<String>) -> Self {
        PortalError::Transient {
            step: step.into(),
            detail: detail.into(),
        }
    }

    pub fn permanent(step: impl Into<String>, detail: impl Into<String>) -> Self {
        PortalError::Permanent {
            step: step.into(),
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PortalError::Transient { .. })
    }
}

impl From<chromiumoxide::error::CdpError> for PortalError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        // CDP 层面的失败（超时、连接断开、元素找不到）都视为暂时性错误
        PortalError::transient("cdp", err.to_string())
    }
}

/// 输入校验错误（清洗后仍无法提交）
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    /// 必填字段为空
    #[error("字段 {field} 为空或清洗后为空")]
    EmptyField { field: String },
    /// 字段格式不符合门户要求
    #[error("字段 {field} 格式无效: {reason}")]
    InvalidShape { field: String, reason: String },
    /// 报告类型的附加限制
    #[error("报告类型限制: {0}")]
    ReportRestriction(String),
}

/// 持久化错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 请求不存在
    #[error("请求不存在: {0}")]
    NotFound(RequestId),
    /// 请求已存在
    #[error("请求已存在: {0}")]
    AlreadyExists(RequestId),
    /// 乐观锁冲突
    #[error("请求 {id} 版本冲突: 期望 {expected}, 实际 {actual}")]
    VersionConflict {
        id: RequestId,
        expected: u64,
        actual: u64,
    },
    /// 非法状态转换
    #[error("请求 {id} 非法状态转换: {from} -> {to}")]
    IllegalTransition {
        id: RequestId,
        from: LifecycleState,
        to: LifecycleState,
    },
    /// 文件读写失败
    #[error("读写状态文件失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 序列化失败
    #[error("状态序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 证据存储错误
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// 文件读写失败
    #[error("读写证据失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 证据内容与摘要不一致
    #[error("证据 {id} 摘要不匹配")]
    DigestMismatch { id: String },
    /// 证据不存在
    #[error("证据不存在: {0}")]
    NotFound(String),
    /// 元数据序列化失败
    #[error("证据元数据序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 配置值不合法
    #[error("配置项 {key} 不合法: {reason}")]
    Invalid { key: String, reason: String },
}

/// 失败分类
///
/// 用于事件和日志，和请求最终的 [`RejectionReason`] 一一对应或更细。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationFailed,
    TransientPortalError,
    PermanentPortalError,
    ReconciliationError,
    ExpiredNoResolution,
    ConcurrencyViolation,
}

/// 请求进入 `Rejected` / `Expired` 的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    /// 清洗失败，从未提交
    ValidationFailed(String),
    /// 门户明确拒绝提交
    PermanentPortalError(String),
    /// 暂时性错误重试次数耗尽
    AttemptsExhausted(String),
    /// 外部请求放弃
    Abandoned,
    /// 门户在受理后拒绝（对账发现）
    PortalDenied(String),
    /// 超过最大年龄仍无结果
    ExpiredNoResolution,
}

impl RejectionReason {
    /// 对应的失败分类，放弃不算失败
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            RejectionReason::ValidationFailed(_) => Some(FailureKind::ValidationFailed),
            RejectionReason::PermanentPortalError(_) | RejectionReason::PortalDenied(_) => {
                Some(FailureKind::PermanentPortalError)
            }
            RejectionReason::AttemptsExhausted(_) => Some(FailureKind::TransientPortalError),
            RejectionReason::ExpiredNoResolution => Some(FailureKind::ExpiredNoResolution),
            RejectionReason::Abandoned => None,
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::ValidationFailed(d) => write!(f, "validation_failed: {}", d),
            RejectionReason::PermanentPortalError(d) => write!(f, "permanent_portal_error: {}", d),
            RejectionReason::AttemptsExhausted(d) => write!(f, "attempts_exhausted: {}", d),
            RejectionReason::Abandoned => write!(f, "abandoned"),
            RejectionReason::PortalDenied(d) => write!(f, "portal_denied: {}", d),
            RejectionReason::ExpiredNoResolution => write!(f, "expired_no_resolution"),
        }
    }
}

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
