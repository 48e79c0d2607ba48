//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责调度和资源管理，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用
//! - 管理应用生命周期（初始化、恢复、运行、停止）
//! - 扫描申请目录并入队
//! - 管理浏览器资源（Browser）
//!
//! ### `coordinator` - 任务协调器
//! - 请求锁、并发槽位、队列
//! - 所有状态转换的唯一入口（校验 → 落盘 → 事件）
//! - 入队、查询状态、取证据、放弃
//!
//! ### `submission_pool` - 提交工作池
//! - N 个工作者从队列取就绪请求，交给提交引擎
//!
//! ### `reconciler` - 状态对账器
//! - 按年龄分档轮询已受理请求的外部状态
//!
//! ## 层次关系
//!
//! ```text
//! app
//!  ├─ submission_pool ──→ workflow::SubmissionEngine ─┐
//!  └─ reconciler ─────────────────────────────────────┤
//!                                                     ↓
//!                                    coordinator (锁 / 状态 / 队列)
//!                                                     ↓
//!              services (能力层：portal / sanitizer / evidence / pacing / events)
//!                                                     ↓
//!                           infrastructure (基础设施：JsExecutor / SessionLease)
//! ```

pub mod app;
pub mod coordinator;
pub mod reconciler;
pub mod submission_pool;

// 重新导出主要类型
pub use app::App;
pub use coordinator::{JobCoordinator, RequestGuard, RequestStatusView};
pub use reconciler::{PollSchedule, ReconcileReport, StatusReconciler};
pub use submission_pool::{PoolStats, SubmissionPool};
