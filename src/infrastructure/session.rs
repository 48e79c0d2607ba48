//! 独占会话租约 - 基础设施层
//!
//! 一个租约独占一个门户会话，任何退出路径上都会关闭它：
//! - 正常结束调用 [`SessionLease::release`]
//! - 提前返回或 panic 时由 `Drop` 在后台关闭
//! - [`supervise`] 给租约内的工作加上超时

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PortalError;
use crate::services::portal::{PortalDriver, PortalSession};

pub struct SessionLease {
    session: Option<Box<dyn PortalSession>>,
    label: String,
}

impl SessionLease {
    /// 从驱动打开一个会话
    pub async fn acquire(driver: &dyn PortalDriver, label: impl Into<String>) -> Result<Self, PortalError> {
        let label = label.into();
        let session = driver.open_session().await?;
        debug!("{} 已获取 {} 会话", label, driver.portal_id());
        Ok(Self {
            session: Some(session),
            label,
        })
    }

    /// 会话本体
    pub fn session(&mut self) -> Result<&mut dyn PortalSession, PortalError> {
        match self.session.as_mut() {
            Some(session) => Ok(session.as_mut()),
            None => Err(PortalError::transient("session", "会话已释放")),
        }
    }

    /// 关闭会话
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            debug!("{} 会话已释放", self.label);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    debug!("{} 会话未显式释放，后台关闭", self.label);
                    handle.spawn(async move { session.close().await });
                }
                Err(_) => warn!("{} 会话在运行时之外被丢弃，无法关闭", self.label),
            }
        }
    }
}

/// 在超时限制内执行租约内的工作
pub async fn supervise<T, F>(limit: Duration, step: &str, work: F) -> Result<T, PortalError>
where
    F: Future<Output = Result<T, PortalError>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} 超时 ({:?})", step, limit);
            Err(PortalError::transient(step, format!("超时 ({}s)", limit.as_secs())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::models::{ExternalRef, RequestFields};
    use crate::services::evidence::Snapshot;
    use crate::services::portal::{Confirmation, ExternalStatus};

    struct CountingDriver {
        closed: Arc<AtomicUsize>,
    }

    struct CountingSession {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PortalDriver for CountingDriver {
        fn portal_id(&self) -> &str {
            "counting"
        }

        async fn open_session(&self) -> Result<Box<dyn PortalSession>, PortalError> {
            Ok(Box::new(CountingSession {
                closed: self.closed.clone(),
            }))
        }
    }

    #[async_trait]
    impl PortalSession for CountingSession {
        async fn navigate(&mut self) -> Result<(), PortalError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn fill_and_submit(&mut self, _fields: &RequestFields) -> Result<Confirmation, PortalError> {
            Err(PortalError::permanent("submit", "unused"))
        }

        async fn query_status(&mut self, _reference: &ExternalRef) -> Result<ExternalStatus, PortalError> {
            Err(PortalError::transient("status", "unused"))
        }

        async fn snapshot(&mut self, step: &str) -> Result<Snapshot, PortalError> {
            Ok(Snapshot {
                step: step.to_string(),
                image: Vec::new(),
                page_url: None,
                page_title: None,
            })
        }

        async fn close(self: Box<Self>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn released_on_every_path() {
        let closed = Arc::new(AtomicUsize::new(0));
        let driver = CountingDriver { closed: closed.clone() };

        let lease = SessionLease::acquire(&driver, "explicit").await.unwrap();
        lease.release().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        {
            let _lease = SessionLease::acquire(&driver, "dropped").await.unwrap();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn supervised_work_times_out_as_transient() {
        let closed = Arc::new(AtomicUsize::new(0));
        let driver = CountingDriver { closed };
        let mut lease = SessionLease::acquire(&driver, "slow").await.unwrap();

        let session = lease.session().unwrap();
        let result = supervise(Duration::from_millis(50), "navigate", session.navigate()).await;
        assert!(matches!(result, Err(PortalError::Transient { .. })));
        lease.release().await;
    }
}
