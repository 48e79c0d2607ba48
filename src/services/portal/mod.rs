//! 门户驱动 - 业务能力层
//!
//! "驱动一个浏览器会话操作某个门户" 的抽象。
//! 新增一个门户只需新增一个 [`PortalDriver`] 实现，提交引擎和对账器不需要改动。

pub mod page_classifier;
pub mod phoenix;
pub mod status;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PortalError;
use crate::models::{ExternalRef, RequestFields};
use crate::services::evidence::Snapshot;

pub use phoenix::PhoenixPortal;
pub use status::StatusClass;

/// 提交后无法确认是否受理时使用的步骤名，这类请求需要人工跟进
pub const UNCONFIRMED_STEP: &str = "unconfirmed";

/// 门户受理后的确认信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub reference: ExternalRef,
    /// 确认页上的提示语
    pub message: Option<String>,
    pub page_url: Option<String>,
}

/// 门户返回的状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalStatus {
    /// 门户原文
    pub raw: String,
    pub class: StatusClass,
}

impl ExternalStatus {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let class = status::classify(&raw);
        Self { raw, class }
    }
}

/// 门户驱动
#[async_trait]
pub trait PortalDriver: Send + Sync {
    /// 门户标识，对应配置项 `portal.target`
    fn portal_id(&self) -> &str;

    /// 打开一个独占会话
    async fn open_session(&self) -> Result<Box<dyn PortalSession>, PortalError>;
}

/// 门户会话
///
/// 一个会话同一时间只服务一次提交或一次状态查询，不在并发任务间共享。
#[async_trait]
pub trait PortalSession: Send {
    /// 打开门户入口并进入申请表单
    async fn navigate(&mut self) -> Result<(), PortalError>;

    /// 填写并提交表单，返回门户分配的外部编号
    async fn fill_and_submit(&mut self, fields: &RequestFields) -> Result<Confirmation, PortalError>;

    /// 查询已提交请求的状态
    async fn query_status(&mut self, reference: &ExternalRef) -> Result<ExternalStatus, PortalError>;

    /// 截取当前页面
    async fn snapshot(&mut self, step: &str) -> Result<Snapshot, PortalError>;

    /// 取出会话在中间步骤自行截取的快照
    fn drain_captures(&mut self) -> Vec<Snapshot> {
        Vec::new()
    }

    /// 提交按钮是否已经点击过
    ///
    /// 一旦为 true，门户可能已经受理，这次尝试之后的任何失败都不能重试。
    fn submit_dispatched(&self) -> bool {
        false
    }

    /// 关闭会话，释放页面
    async fn close(self: Box<Self>);
}
