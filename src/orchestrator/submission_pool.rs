//! 提交工作池 - 编排层
//!
//! ## 职责
//!
//! 1. **并发控制**：每个工作者处理前先从协调器拿一个提交槽位（Semaphore）
//! 2. **取任务**：按 (优先级, 入队序号) 从持久化状态取下一个就绪请求
//! 3. **向下委托**：单个请求的认领、执行、结算全部交给 [`SubmissionEngine`]
//! 4. **统计**：汇总每个工作者的处理结果
//!
//! 单个请求出错只记日志，不会让工作者退出。

use chrono::Utc;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::models::LifecycleState;
use crate::services::pacing::{pause, PacingModel, StepKind};
use crate::workflow::SubmissionEngine;

/// 工作者处理统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub processed: usize,
    pub submitted: usize,
    pub rejected: usize,
    pub requeued: usize,
    pub errors: usize,
}

impl PoolStats {
    fn record(&mut self, state: LifecycleState) {
        self.processed += 1;
        match state {
            LifecycleState::Submitted => self.submitted += 1,
            LifecycleState::Rejected => self.rejected += 1,
            LifecycleState::Queued => self.requeued += 1,
            _ => {}
        }
    }
}

impl AddAssign for PoolStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.submitted += other.submitted;
        self.rejected += other.rejected;
        self.requeued += other.requeued;
        self.errors += other.errors;
    }
}

/// 工作者何时退出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopWhen {
    /// 收到关闭信号
    Shutdown,
    /// 队列里没有就绪请求
    Idle,
}

pub struct SubmissionPool {
    engine: Arc<SubmissionEngine>,
    pacing: Arc<dyn PacingModel>,
    workers: usize,
    idle_poll: Duration,
}

impl SubmissionPool {
    pub fn new(engine: Arc<SubmissionEngine>, pacing: Arc<dyn PacingModel>, workers: usize, idle_poll: Duration) -> Self {
        Self {
            engine,
            pacing,
            workers: workers.max(1),
            idle_poll,
        }
    }

    /// 持续处理队列，直到收到关闭信号
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> PoolStats {
        info!("👷 启动 {} 个提交工作者", self.workers);
        let stats = self.spawn_workers(StopWhen::Shutdown, shutdown).await;
        info!(
            "👷 提交工作者已停止: 处理 {} / 受理 {} / 拒绝 {} / 重排 {} / 出错 {}",
            stats.processed, stats.submitted, stats.rejected, stats.requeued, stats.errors
        );
        stats
    }

    /// 处理到队列里没有就绪请求为止
    pub async fn run_until_idle(&self) -> PoolStats {
        let (_tx, rx) = watch::channel(false);
        self.spawn_workers(StopWhen::Idle, rx).await
    }

    async fn spawn_workers(&self, stop: StopWhen, shutdown: watch::Receiver<bool>) -> PoolStats {
        let mut handles = Vec::with_capacity(self.workers);
        for index in 1..=self.workers {
            let worker = Worker {
                index,
                engine: self.engine.clone(),
                pacing: self.pacing.clone(),
                idle_poll: self.idle_poll,
                stop,
                shutdown: shutdown.clone(),
                closed: false,
            };
            handles.push(tokio::spawn(worker.run()));
        }

        let mut total = PoolStats::default();
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(stats) => total += stats,
                Err(e) => {
                    error!("[工作者 {}] 任务执行失败: {}", index + 1, e);
                    total.errors += 1;
                }
            }
        }
        total
    }
}

struct Worker {
    index: usize,
    engine: Arc<SubmissionEngine>,
    pacing: Arc<dyn PacingModel>,
    idle_poll: Duration,
    stop: StopWhen,
    shutdown: watch::Receiver<bool>,
    /// 发送端已丢弃，视同关闭
    closed: bool,
}

impl Worker {
    async fn run(mut self) -> PoolStats {
        let mut stats = PoolStats::default();
        let coordinator = self.engine.coordinator().clone();
        let slots = coordinator.slots();

        loop {
            if self.closed || *self.shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = self.shutdown.changed() => {
                    self.closed = changed.is_err();
                    continue;
                }
            };

            let next = match coordinator.next_ready(Utc::now()).await {
                Ok(next) => next,
                Err(e) => {
                    error!("[工作者 {}] 读取队列失败: {}", self.index, e);
                    stats.errors += 1;
                    drop(permit);
                    self.idle().await;
                    continue;
                }
            };

            let Some(request) = next else {
                drop(permit);
                if self.stop == StopWhen::Idle {
                    break;
                }
                self.idle().await;
                continue;
            };

            let outcome = self.engine.process(request.id).await;
            drop(permit);

            match outcome {
                Ok(state) => {
                    debug!("[工作者 {}] 请求 {} → {}", self.index, request.id, state);
                    stats.record(state);
                    if state == LifecycleState::Queued {
                        // 退避中或未能认领，让出时间片
                        self.idle().await;
                    } else if state == LifecycleState::Submitted {
                        pause(self.pacing.as_ref(), StepKind::BetweenSubmissions).await;
                    }
                }
                Err(e) => {
                    error!("[工作者 {}] ❌ 请求 {} 处理出错: {}", self.index, request.id, e);
                    stats.errors += 1;
                    self.idle().await;
                }
            }
        }

        stats
    }

    async fn idle(&mut self) {
        if self.stop == StopWhen::Idle {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.idle_poll) => {}
            changed = self.shutdown.changed() => self.closed = changed.is_err(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_record_by_final_state() {
        let mut stats = PoolStats::default();
        stats.record(LifecycleState::Submitted);
        stats.record(LifecycleState::Queued);
        stats.record(LifecycleState::Rejected);
        stats.record(LifecycleState::Submitted);

        let mut total = PoolStats::default();
        total += stats;
        total += PoolStats {
            errors: 1,
            ..Default::default()
        };
        assert_eq!(total.processed, 4);
        assert_eq!(total.submitted, 2);
        assert_eq!(total.rejected, 1);
        assert_eq!(total.requeued, 1);
        assert_eq!(total.errors, 1);
    }
}
