//! 状态对账器 - 编排层
//!
//! 定期查询已受理请求在门户上的状态，把外部状态映射回生命周期：
//!
//! - `Pending` / `Unknown`：只记录轮询时间
//! - `InProgress`：`Submitted → Reconciling`
//! - `Completed`：`→ Completed`
//! - `Denied`：`→ Rejected`
//! - 超过最大年龄仍无结果：`→ Expired`，写入人工跟进文件
//!
//! 查询失败只更新轮询记录，从不改变状态。

use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::error::{AppResult, FailureKind, PortalError, RejectionReason};
use crate::infrastructure::session::{supervise, SessionLease};
use crate::models::{ExternalRef, LifecycleState, Request, RequestId};
use crate::orchestrator::coordinator::{JobCoordinator, RequestGuard};
use crate::services::pacing::{pause, PacingModel, StepKind};
use crate::services::portal::{ExternalStatus, PortalDriver, StatusClass};
use crate::services::FollowUpWriter;

/// 轮询计划
///
/// 按受理后的年龄分档，越新的请求轮询越频繁
#[derive(Debug, Clone)]
pub struct PollSchedule {
    tiers: Vec<(chrono::Duration, Duration)>,
    tail: Duration,
    max_age: chrono::Duration,
}

impl PollSchedule {
    pub fn new(tiers: Vec<(chrono::Duration, Duration)>, tail: Duration, max_age: chrono::Duration) -> Self {
        Self { tiers, tail, max_age }
    }

    pub fn from_config(config: &ReconcileConfig) -> Self {
        let tiers = config
            .poll_tiers
            .iter()
            .map(|tier| {
                (
                    chrono::Duration::hours(tier.max_age_hours as i64),
                    Duration::from_secs(tier.interval_secs),
                )
            })
            .collect();
        Self::new(
            tiers,
            Duration::from_secs(config.tail_interval_secs),
            chrono::Duration::hours(config.max_request_age_hours as i64),
        )
    }

    /// 给定年龄对应的轮询间隔
    pub fn interval_for(&self, age: chrono::Duration) -> Duration {
        self.tiers
            .iter()
            .find(|(max_age, _)| age < *max_age)
            .map(|(_, interval)| *interval)
            .unwrap_or(self.tail)
    }

    /// 从未轮询过，或距上次轮询已超过当前档位的间隔
    pub fn is_due(&self, request: &Request, now: DateTime<Utc>) -> bool {
        let Some(last) = request.last_polled_at else {
            return true;
        };
        let interval = self.interval_for(request.age_since_submission(now));
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        elapsed >= interval
    }

    pub fn is_over_age(&self, request: &Request, now: DateTime<Utc>) -> bool {
        request.age_since_submission(now) >= self.max_age
    }
}

/// 一轮对账的统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub polled: usize,
    pub transitioned: usize,
    pub expired: usize,
    pub failures: usize,
    pub skipped: usize,
}

impl Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "查询 {} / 转换 {} / 过期 {} / 失败 {} / 未到期 {}",
            self.polled, self.transitioned, self.expired, self.failures, self.skipped
        )
    }
}

/// 单个请求的对账结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollEffect {
    Unchanged,
    Transitioned,
    Expired,
}

pub struct StatusReconciler {
    coordinator: Arc<JobCoordinator>,
    driver: Arc<dyn PortalDriver>,
    pacing: Arc<dyn PacingModel>,
    schedule: PollSchedule,
    query_timeout: Duration,
    follow_up: Arc<FollowUpWriter>,
    tick: Duration,
}

impl StatusReconciler {
    pub fn new(
        coordinator: Arc<JobCoordinator>,
        driver: Arc<dyn PortalDriver>,
        pacing: Arc<dyn PacingModel>,
        schedule: PollSchedule,
        query_timeout: Duration,
        follow_up: Arc<FollowUpWriter>,
        tick: Duration,
    ) -> Self {
        Self {
            coordinator,
            driver,
            pacing,
            schedule,
            query_timeout,
            follow_up,
            tick,
        }
    }

    pub fn schedule(&self) -> &PollSchedule {
        &self.schedule
    }

    /// 跑一轮对账
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> AppResult<ReconcileReport> {
        let candidates = self
            .coordinator
            .store()
            .list_in_states(&[LifecycleState::Submitted, LifecycleState::Reconciling])
            .await?;
        let mut report = ReconcileReport::default();

        for request in candidates {
            let over_age = self.schedule.is_over_age(&request, now);
            if !over_age && !self.schedule.is_due(&request, now) {
                report.skipped += 1;
                continue;
            }

            let Some(reference) = request.external_ref.clone() else {
                warn!("请求 {} 处于 {} 但没有外部编号，跳过对账", request.id, request.state);
                report.skipped += 1;
                continue;
            };

            pause(self.pacing.as_ref(), StepKind::StatusCheck).await;
            let polled = self.poll(request.id, &reference).await;
            report.polled += 1;
            if polled.is_err() {
                report.failures += 1;
            }

            match self.apply(request.id, polled, over_age, now).await {
                Ok(PollEffect::Transitioned) => report.transitioned += 1,
                Ok(PollEffect::Expired) => report.expired += 1,
                Ok(PollEffect::Unchanged) => {}
                Err(e) => {
                    error!("请求 {} 对账结果写入失败: {}", request.id, e);
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// 不持锁查询外部状态
    async fn poll(&self, id: RequestId, reference: &ExternalRef) -> Result<ExternalStatus, PortalError> {
        let label = format!("[对账 {}]", reference);
        let mut lease = SessionLease::acquire(self.driver.as_ref(), label).await?;
        let result = match lease.session() {
            Ok(session) => supervise(self.query_timeout, "query_status", session.query_status(reference)).await,
            Err(e) => Err(e),
        };
        lease.release().await;

        match &result {
            Ok(status) => debug!("请求 {} 外部状态: {} ({:?})", id, status.raw, status.class),
            Err(e) => warn!("⚠️ {:?}: 请求 {} 状态查询失败: {}", FailureKind::ReconciliationError, id, e),
        }
        result
    }

    /// 持锁应用查询结果
    async fn apply(
        &self,
        id: RequestId,
        polled: Result<ExternalStatus, PortalError>,
        over_age: bool,
        now: DateTime<Utc>,
    ) -> AppResult<PollEffect> {
        let guard = self.coordinator.lock(id).await;
        let mut request = self.coordinator.store().load(id).await?;
        if !request.state.is_polling() {
            debug!("请求 {} 已处于 {}，丢弃本次查询结果", id, request.state);
            return Ok(PollEffect::Unchanged);
        }
        request.last_polled_at = Some(now);

        let status = match polled {
            Ok(status) => {
                request.consecutive_poll_failures = 0;
                status
            }
            Err(_) => {
                request.consecutive_poll_failures += 1;
                if over_age {
                    return self.expire(&guard, &mut request).await;
                }
                self.coordinator.save(&guard, &mut request).await?;
                return Ok(PollEffect::Unchanged);
            }
        };

        match status.class {
            StatusClass::Completed => {
                let reason = format!("portal status: {}", status.raw);
                self.coordinator
                    .commit(&guard, &mut request, LifecycleState::Completed, reason, None)
                    .await?;
                info!("✅ 请求 {} 已完成: {}", id, status.raw);
                Ok(PollEffect::Transitioned)
            }
            StatusClass::Denied => {
                request.rejection = Some(RejectionReason::PortalDenied(status.raw.clone()));
                let reason = format!("portal status: {}", status.raw);
                self.coordinator
                    .commit(&guard, &mut request, LifecycleState::Rejected, reason, None)
                    .await?;
                warn!("❌ 请求 {} 被门户拒绝: {}", id, status.raw);
                Ok(PollEffect::Transitioned)
            }
            _ if over_age => self.expire(&guard, &mut request).await,
            StatusClass::InProgress if request.state == LifecycleState::Submitted => {
                let reason = format!("portal status: {}", status.raw);
                self.coordinator
                    .commit(&guard, &mut request, LifecycleState::Reconciling, reason, None)
                    .await?;
                info!("🔄 请求 {} 门户处理中: {}", id, status.raw);
                Ok(PollEffect::Transitioned)
            }
            StatusClass::Unknown => {
                info!("请求 {} 无法识别的外部状态: {}", id, status.raw);
                self.coordinator.save(&guard, &mut request).await?;
                Ok(PollEffect::Unchanged)
            }
            _ => {
                self.coordinator.save(&guard, &mut request).await?;
                Ok(PollEffect::Unchanged)
            }
        }
    }

    async fn expire(&self, guard: &RequestGuard, request: &mut Request) -> AppResult<PollEffect> {
        request.rejection = Some(RejectionReason::ExpiredNoResolution);
        self.coordinator
            .commit(guard, request, LifecycleState::Expired, "no resolution before max age", None)
            .await?;
        warn!("⌛ 请求 {} 超过最大年龄仍无结果，已过期", request.id);

        if let Err(e) = self.follow_up.write(request, "超过最大年龄仍无结果").await {
            error!("请求 {} 写入人工跟进失败: {}", request.id, e);
        }
        Ok(PollEffect::Expired)
    }

    /// 按 tick 循环对账，直到收到关闭信号
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("🔎 状态对账器已启动 (间隔 {} 秒)", self.tick.as_secs());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.reconcile_once(Utc::now()).await {
                Ok(report) if report.polled > 0 => info!("🔎 对账完成: {}", report),
                Ok(report) => debug!("🔎 对账完成: {}", report),
                Err(e) => error!("对账失败: {}", e),
            }
        }
        info!("🔎 状态对账器已停止");
    }
}
