//! # Records Request Submit
//!
//! 一个用于自动提交公共记录申请并跟踪其状态的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（Page、会话），只暴露能力
//! - `JsExecutor` - 一个标签页的 page owner，提供 eval() / 截图能力
//! - `SessionLease` - 独占一个门户会话，任何退出路径上都会关闭
//! - `store/` - 请求和尝试记录的持久化
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个请求
//! - `PortalDriver` - 打开门户、填写提交、查询状态
//! - `Sanitizer` - 清洗和校验输入
//! - `EvidenceRecorder` - 按内容寻址保存截图证据
//! - `PacingModel` - 步骤之间的停顿
//! - `EventSink` / `FollowUpWriter` - 状态事件和人工跟进记录
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一次提交尝试"的完整流程
//! - `AttemptCtx` - 上下文封装（request_id + 第几次尝试）
//! - `SubmissionEngine` - 流程编排（claim → execute → settle）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/coordinator` - 请求锁、并发槽位、队列和状态转换
//! - `orchestrator/submission_pool` - 提交工作池
//! - `orchestrator/reconciler` - 外部状态对账
//! - `orchestrator/app` - 应用生命周期，持有浏览器
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod store;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::{LifecycleState, Priority, Request, RequestFields, RequestId};
pub use orchestrator::{App, JobCoordinator, StatusReconciler};
pub use workflow::{AttemptCtx, SubmissionEngine};
