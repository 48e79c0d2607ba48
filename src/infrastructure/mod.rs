//! 基础设施层（Infrastructure Layer）
//!
//! 持有稀缺资源（页面、会话），只暴露能力

pub mod js_executor;
pub mod session;

pub use js_executor::JsExecutor;
pub use session::{supervise, SessionLease};
