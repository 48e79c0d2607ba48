//! 提交流程 - 流程层
//!
//! 核心职责：定义"一次提交尝试"的完整流程
//!
//! 流程顺序：
//! 1. claim：持锁检查放弃 / 外部编号 / 清洗，创建第 N+1 次尝试，`Queued → Submitting`
//! 2. execute：不持锁，独占会话里完成 打开门户 → 填写 → 提交 → 截取确认页
//! 3. settle：重新持锁，按结果转到 `Submitted` / 退避后 `Queued` / `Rejected`

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::SubmissionConfig;
use crate::error::{AppResult, FailureKind, PortalError, RejectionReason};
use crate::infrastructure::session::{supervise, SessionLease};
use crate::models::{Attempt, AttemptOutcome, EvidenceId, LifecycleState, Request, RequestId};
use crate::orchestrator::coordinator::{JobCoordinator, RequestGuard};
use crate::services::portal::{Confirmation, PortalDriver, PortalSession, UNCONFIRMED_STEP};
use crate::services::{EvidenceRecorder, FollowUpWriter, Sanitizer};
use crate::workflow::attempt_ctx::AttemptCtx;
use crate::workflow::backoff::BackoffPolicy;

/// 确认页截图的重试次数
const CONFIRMATION_CAPTURE_TRIES: u32 = 3;

const CONFIRMATION_EVIDENCE_STEP: &str = "confirmation_evidence";

/// 认领结果
#[derive(Debug)]
pub enum ClaimOutcome {
    /// 已创建新的尝试，可以执行
    Claimed(AttemptCtx),
    /// 请求已被其他工作者认领或不在队列中
    AlreadyClaimed(LifecycleState),
    /// 退避未结束或打开的尝试已达上限
    NotReady,
    /// 认领时直接得出结果，没有创建尝试（校验失败、放弃、已有外部编号、次数耗尽）
    Resolved(LifecycleState),
}

/// 单次尝试的执行结果
#[derive(Debug)]
pub struct AttemptResult {
    pub outcome: Result<Confirmation, PortalError>,
    pub evidence: Vec<EvidenceId>,
}

/// 引擎限制
#[derive(Debug, Clone)]
pub struct SubmissionLimits {
    pub max_attempts: u32,
    pub max_open_attempts: u32,
    pub attempt_timeout: Duration,
}

impl From<&SubmissionConfig> for SubmissionLimits {
    fn from(config: &SubmissionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            max_open_attempts: config.max_open_attempts.max(1),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }
}

/// 提交引擎
///
/// - 编排一次尝试的完整流程
/// - 只在读写状态时持有请求锁，页面等待期间不持锁
/// - 不持有浏览器资源，会话从驱动按需租用
pub struct SubmissionEngine {
    coordinator: Arc<JobCoordinator>,
    driver: Arc<dyn PortalDriver>,
    sanitizer: Sanitizer,
    recorder: Arc<EvidenceRecorder>,
    backoff: BackoffPolicy,
    follow_up: Arc<FollowUpWriter>,
    limits: SubmissionLimits,
}

impl SubmissionEngine {
    pub fn new(
        coordinator: Arc<JobCoordinator>,
        driver: Arc<dyn PortalDriver>,
        sanitizer: Sanitizer,
        recorder: Arc<EvidenceRecorder>,
        backoff: BackoffPolicy,
        follow_up: Arc<FollowUpWriter>,
        limits: SubmissionLimits,
    ) -> Self {
        Self {
            coordinator,
            driver,
            sanitizer,
            recorder,
            backoff,
            follow_up,
            limits,
        }
    }

    pub fn coordinator(&self) -> &Arc<JobCoordinator> {
        &self.coordinator
    }

    /// 认领 + 执行 + 结算，返回本轮结束后的状态
    pub async fn process(&self, id: RequestId) -> AppResult<LifecycleState> {
        match self.claim(id).await? {
            ClaimOutcome::Claimed(ctx) => {
                let result = self.execute(&ctx).await;
                Ok(self.settle(&ctx, result).await?)
            }
            ClaimOutcome::AlreadyClaimed(state) | ClaimOutcome::Resolved(state) => Ok(state),
            ClaimOutcome::NotReady => Ok(LifecycleState::Queued),
        }
    }

    /// 持锁认领
    pub async fn claim(&self, id: RequestId) -> AppResult<ClaimOutcome> {
        let guard = self.coordinator.lock(id).await;
        let store = self.coordinator.store();
        let mut request = store.load(id).await?;

        if request.state != LifecycleState::Queued {
            debug!("请求 {} 处于 {}，跳过认领", id, request.state);
            return Ok(ClaimOutcome::AlreadyClaimed(request.state));
        }

        if request.abandon_requested {
            return self.reject(&guard, &mut request, RejectionReason::Abandoned, None).await;
        }

        // 已有外部编号说明门户已受理过，绝不重复提交
        if let Some(existing) = request.external_ref.clone() {
            warn!(
                "⚠️ {:?}: 请求 {} 已有外部编号 {}，直接回到 Submitted",
                FailureKind::ConcurrencyViolation,
                id,
                existing
            );
            self.coordinator
                .commit(
                    &guard,
                    &mut request,
                    LifecycleState::Submitted,
                    format!("existing external reference {}", existing),
                    None,
                )
                .await?;
            return Ok(ClaimOutcome::Resolved(LifecycleState::Submitted));
        }

        if !request.is_ready(Utc::now()) {
            return Ok(ClaimOutcome::NotReady);
        }

        if request.attempt_count >= self.limits.max_attempts {
            let reason = RejectionReason::AttemptsExhausted(format!("{} attempts used", request.attempt_count));
            return self.reject(&guard, &mut request, reason, None).await;
        }

        let sanitized = match self.sanitizer.sanitize(&request.fields) {
            Ok(sanitized) => sanitized,
            Err(e) => {
                warn!("❌ 请求 {} 清洗失败: {}", id, e);
                let reason = RejectionReason::ValidationFailed(e.to_string());
                return self.reject(&guard, &mut request, reason, None).await;
            }
        };
        if !sanitized.violations.is_empty() {
            info!("请求 {} 清洗修正了 {} 处输入", id, sanitized.violations.len());
        }

        let attempts = store.attempts(id).await?;
        let open = attempts.iter().filter(|a| a.is_open()).count() as u32;
        if open >= self.limits.max_open_attempts {
            warn!("请求 {} 已有 {} 个打开的尝试，暂不认领", id, open);
            return Ok(ClaimOutcome::NotReady);
        }

        let number = request.attempt_count + 1;
        let attempt = Attempt::open(id, number);
        request.attempt_count = number;
        request.next_attempt_at = None;
        self.coordinator
            .commit(
                &guard,
                &mut request,
                LifecycleState::Submitting,
                format!("attempt {} claimed", number),
                Some(&attempt),
            )
            .await?;

        let ctx = AttemptCtx::new(attempt, sanitized.fields);
        info!("{} 🚀 开始提交", ctx);
        Ok(ClaimOutcome::Claimed(ctx))
    }

    /// 不持锁执行一次尝试
    pub async fn execute(&self, ctx: &AttemptCtx) -> AttemptResult {
        let mut evidence = Vec::new();

        let mut lease = match SessionLease::acquire(self.driver.as_ref(), ctx.to_string()).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("{} 无法获取门户会话: {}", ctx, e);
                return AttemptResult {
                    outcome: Err(e),
                    evidence,
                };
            }
        };

        let mut confirmed = None;
        let outcome = match lease.session() {
            Ok(session) => {
                supervise(
                    self.limits.attempt_timeout,
                    "attempt",
                    self.drive(session, ctx, &mut evidence, &mut confirmed),
                )
                .await
            }
            Err(e) => Err(e),
        };
        let dispatched = lease.session().map(|s| s.submit_dispatched()).unwrap_or(false);
        lease.release().await;
        let outcome = after_dispatch(outcome, dispatched, confirmed.as_ref());

        match &outcome {
            Ok(confirmation) => info!("{} ✓ 门户已受理: {}", ctx, confirmation.reference),
            Err(e) if e.is_transient() => warn!("{} ⚠️ 暂时性失败: {}", ctx, e),
            Err(e) => error!("{} ❌ 门户拒绝: {}", ctx, e),
        }
        AttemptResult { outcome, evidence }
    }

    async fn drive(
        &self,
        session: &mut dyn PortalSession,
        ctx: &AttemptCtx,
        evidence: &mut Vec<EvidenceId>,
        confirmed: &mut Option<Confirmation>,
    ) -> Result<Confirmation, PortalError> {
        let navigated = session.navigate().await;
        self.record_drained(session, ctx, evidence).await;
        if let Err(e) = navigated {
            self.record_best_effort(session, ctx, "navigate_failed", evidence).await;
            return Err(e);
        }
        self.record_best_effort(session, ctx, "landing_page", evidence).await;

        let submitted = session.fill_and_submit(&ctx.fields).await;
        self.record_drained(session, ctx, evidence).await;
        let confirmation = match submitted {
            Ok(confirmation) => confirmation,
            Err(e) => {
                self.record_best_effort(session, ctx, "submit_failed", evidence).await;
                return Err(e);
            }
        };
        *confirmed = Some(confirmation.clone());

        // 没有确认页证据不能进入 Submitted；门户可能已受理，也不能重试
        for try_no in 1..=CONFIRMATION_CAPTURE_TRIES {
            match self.record(session, ctx, "confirmation").await {
                Ok(id) => {
                    evidence.push(id);
                    return Ok(confirmation);
                }
                Err(e) => warn!("{} 确认页截图失败 ({}/{}): {}", ctx, try_no, CONFIRMATION_CAPTURE_TRIES, e),
            }
        }
        Err(missing_confirmation_evidence(&confirmation))
    }

    async fn record(
        &self,
        session: &mut dyn PortalSession,
        ctx: &AttemptCtx,
        step: &str,
    ) -> Result<EvidenceId, String> {
        let snapshot = session.snapshot(step).await.map_err(|e| e.to_string())?;
        self.recorder
            .record(ctx.request_id, ctx.number(), snapshot)
            .await
            .map(|record| record.id)
            .map_err(|e| e.to_string())
    }

    async fn record_best_effort(
        &self,
        session: &mut dyn PortalSession,
        ctx: &AttemptCtx,
        step: &str,
        evidence: &mut Vec<EvidenceId>,
    ) {
        match self.record(session, ctx, step).await {
            Ok(id) => evidence.push(id),
            Err(e) => warn!("{} 证据 {} 保存失败: {}", ctx, step, e),
        }
    }

    /// 保存会话在中间步骤截取的快照
    async fn record_drained(&self, session: &mut dyn PortalSession, ctx: &AttemptCtx, evidence: &mut Vec<EvidenceId>) {
        for snapshot in session.drain_captures() {
            let step = snapshot.step.clone();
            match self.recorder.record(ctx.request_id, ctx.number(), snapshot).await {
                Ok(record) => evidence.push(record.id),
                Err(e) => warn!("{} 证据 {} 保存失败: {}", ctx, step, e),
            }
        }
    }

    /// 持锁结算一次尝试
    pub async fn settle(&self, ctx: &AttemptCtx, result: AttemptResult) -> AppResult<LifecycleState> {
        let guard = self.coordinator.lock(ctx.request_id).await;
        let mut request = self.coordinator.store().load(ctx.request_id).await?;

        if request.state != LifecycleState::Submitting || request.attempt_count != ctx.number() {
            warn!(
                "{} 结算时请求已处于 {} (尝试 {})，丢弃本次结果",
                ctx, request.state, request.attempt_count
            );
            return Ok(request.state);
        }

        let mut attempt = ctx.attempt.clone();
        attempt.evidence = result.evidence;

        match result.outcome {
            Ok(confirmation) => {
                attempt.close(AttemptOutcome::Success, None);
                match &request.external_ref {
                    None => request.external_ref = Some(confirmation.reference.clone()),
                    Some(existing) if *existing != confirmation.reference => warn!(
                        "⚠️ {:?}: {} 门户返回新编号 {}，保留已有编号 {}",
                        FailureKind::ConcurrencyViolation,
                        ctx,
                        confirmation.reference,
                        existing
                    ),
                    Some(_) => {}
                }
                request.submitted_at = Some(Utc::now());
                let reason = format!("confirmed {}", confirmation.reference);
                self.coordinator
                    .commit(&guard, &mut request, LifecycleState::Submitted, reason, Some(&attempt))
                    .await?;
            }
            Err(PortalError::Transient { step, detail }) => {
                let message = format!("{}: {}", step, detail);
                attempt.close(AttemptOutcome::TransientFailure, Some(message.clone()));
                self.coordinator
                    .commit(
                        &guard,
                        &mut request,
                        LifecycleState::FailedRetryable,
                        message.clone(),
                        Some(&attempt),
                    )
                    .await?;
                self.after_transient(&guard, &mut request, ctx, message).await?;
            }
            Err(PortalError::Permanent { step, detail }) => {
                let message = format!("{}: {}", step, detail);
                attempt.close(AttemptOutcome::PermanentFailure, Some(message.clone()));
                if step == CONFIRMATION_EVIDENCE_STEP || step == UNCONFIRMED_STEP {
                    if let Err(e) = self.follow_up.write(&request, &message).await {
                        error!("{} 写入人工跟进失败: {}", ctx, e);
                    }
                }
                request.rejection = Some(RejectionReason::PermanentPortalError(message.clone()));
                self.coordinator
                    .commit(&guard, &mut request, LifecycleState::Rejected, message, Some(&attempt))
                    .await?;
            }
        }
        Ok(request.state)
    }

    /// 暂时性失败之后：放弃 / 次数耗尽 / 退避重排
    async fn after_transient(
        &self,
        guard: &RequestGuard,
        request: &mut Request,
        ctx: &AttemptCtx,
        message: String,
    ) -> AppResult<()> {
        if request.abandon_requested {
            request.rejection = Some(RejectionReason::Abandoned);
            self.coordinator
                .commit(guard, request, LifecycleState::Rejected, "abandoned", None)
                .await?;
            info!("{} 🛑 已放弃，不再重试", ctx);
            return Ok(());
        }

        if request.attempt_count >= self.limits.max_attempts {
            request.rejection = Some(RejectionReason::AttemptsExhausted(message));
            self.coordinator
                .commit(guard, request, LifecycleState::Rejected, "attempts exhausted", None)
                .await?;
            error!("{} ❌ 已用完 {} 次尝试", ctx, self.limits.max_attempts);
            return Ok(());
        }

        let delay = self.backoff.delay(request.attempt_count);
        let wait = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        request.next_attempt_at = Some(Utc::now() + wait);
        self.coordinator
            .commit(
                guard,
                request,
                LifecycleState::Queued,
                format!("retry after {}s", delay.as_secs()),
                None,
            )
            .await?;
        info!("{} 🔁 {} 秒后重试", ctx, delay.as_secs());
        Ok(())
    }

    async fn reject(
        &self,
        guard: &RequestGuard,
        request: &mut Request,
        reason: RejectionReason,
        attempt: Option<&Attempt>,
    ) -> AppResult<ClaimOutcome> {
        let message = reason.to_string();
        request.rejection = Some(reason);
        self.coordinator
            .commit(guard, request, LifecycleState::Rejected, message, attempt)
            .await?;
        Ok(ClaimOutcome::Resolved(LifecycleState::Rejected))
    }
}

fn missing_confirmation_evidence(confirmation: &Confirmation) -> PortalError {
    PortalError::permanent(
        CONFIRMATION_EVIDENCE_STEP,
        format!(
            "门户已返回编号 {} 但确认页证据无法保存，需要人工核实",
            confirmation.reference
        ),
    )
}

/// 提交按钮点击之后的暂时性失败（含整体超时）改为不可重试
fn after_dispatch(
    outcome: Result<Confirmation, PortalError>,
    dispatched: bool,
    confirmed: Option<&Confirmation>,
) -> Result<Confirmation, PortalError> {
    match outcome {
        Err(e) if e.is_transient() => match confirmed {
            Some(confirmation) => Err(missing_confirmation_evidence(confirmation)),
            None if dispatched => Err(PortalError::permanent(
                UNCONFIRMED_STEP,
                format!("提交已发出，结果未知，需要人工核实 ({})", e),
            )),
            None => Err(e),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExternalRef;

    fn confirmation() -> Confirmation {
        Confirmation {
            reference: ExternalRef("PX-77".to_string()),
            message: None,
            page_url: None,
        }
    }

    #[test]
    fn transient_before_click_stays_retriable() {
        let outcome = after_dispatch(Err(PortalError::transient("fill_form", "slow")), false, None);
        assert!(matches!(outcome, Err(PortalError::Transient { .. })));
    }

    #[test]
    fn transient_after_click_needs_follow_up() {
        let outcome = after_dispatch(Err(PortalError::transient("attempt", "超时 (5s)")), true, None);
        match outcome {
            Err(PortalError::Permanent { step, .. }) => assert_eq!(step, UNCONFIRMED_STEP),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn timeout_after_confirmation_keeps_reference() {
        let confirmation = confirmation();
        let outcome = after_dispatch(Err(PortalError::transient("attempt", "超时")), true, Some(&confirmation));
        match outcome {
            Err(PortalError::Permanent { step, detail }) => {
                assert_eq!(step, CONFIRMATION_EVIDENCE_STEP);
                assert!(detail.contains("PX-77"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn permanent_and_success_pass_through() {
        let outcome = after_dispatch(Err(PortalError::permanent("after_submit", "invalid")), true, None);
        assert_eq!(outcome, Err(PortalError::permanent("after_submit", "invalid")));
        assert!(after_dispatch(Ok(confirmation()), true, None).is_ok());
    }
}
