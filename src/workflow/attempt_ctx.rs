//! 提交尝试上下文
//!
//! 封装"我正在处理哪个请求的第几次尝试"这一信息

use std::fmt::Display;

use crate::models::{Attempt, RequestFields, RequestId};

/// 提交尝试上下文
///
/// 认领成功后创建，携带清洗后的字段，执行阶段不再读取存储
#[derive(Debug, Clone)]
pub struct AttemptCtx {
    pub request_id: RequestId,

    /// 已落盘的打开状态的尝试
    pub attempt: Attempt,

    /// 清洗后的表单字段
    pub fields: RequestFields,
}

impl AttemptCtx {
    pub fn new(attempt: Attempt, fields: RequestFields) -> Self {
        Self {
            request_id: attempt.request_id,
            attempt,
            fields,
        }
    }

    pub fn number(&self) -> u32 {
        self.attempt.number
    }
}

impl Display for AttemptCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = self.request_id.to_string();
        write!(f, "[请求 {} 第 {} 次]", &id[..8.min(id.len())], self.attempt.number)
    }
}
