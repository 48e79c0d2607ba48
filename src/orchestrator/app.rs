//! 应用 - 编排层
//!
//! ## 职责
//!
//! 1. **应用初始化**：打开浏览器、持久化存储、证据存储，组装引擎和对账器
//! 2. **崩溃恢复**：启动时把中断的请求放回队列
//! 3. **入队**：扫描申请目录，逐个入队后删除文件
//! 4. **运行**：提交工作池和状态对账器并行运行，Ctrl+C 后有序停止
//! 5. **资源管理**：唯一持有 Browser 的模块

use anyhow::{Context, Result};
use chromiumoxide::Browser;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::browser;
use crate::config::Config;
use crate::models::load_all_intake_files;
use crate::orchestrator::coordinator::JobCoordinator;
use crate::orchestrator::reconciler::{PollSchedule, StatusReconciler};
use crate::orchestrator::submission_pool::{PoolStats, SubmissionPool};
use crate::services::portal::phoenix;
use crate::services::{
    EventSink, EvidenceRecorder, EvidenceStore, FanoutSink, FollowUpWriter, FsEvidenceStore, JitterPacing, LogSink,
    PacingModel, PhoenixPortal, PortalDriver, Sanitizer, WebhookSink,
};
use crate::store::FileStore;
use crate::utils::logging::{log_intake_loaded, log_startup, print_final_stats};
use crate::workflow::{BackoffPolicy, SubmissionEngine, SubmissionLimits};

/// 应用主结构
pub struct App {
    config: Config,
    _browser: Option<Arc<Browser>>,
    coordinator: Arc<JobCoordinator>,
    pool: SubmissionPool,
    reconciler: StatusReconciler,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        log_startup(&config);

        let browser = browser::open_browser(&config.browser).await?;
        let pacing: Arc<dyn PacingModel> =
            Arc::new(JitterPacing::new(config.pacing.profiles.clone(), config.pacing.seed));
        let driver = build_driver(&config, browser.clone(), pacing.clone())?;

        Self::assemble(config, driver, pacing, Some(browser)).await
    }

    /// 使用给定的门户驱动组装应用，不打开浏览器
    pub async fn with_driver(config: Config, driver: Arc<dyn PortalDriver>, pacing: Arc<dyn PacingModel>) -> Result<Self> {
        Self::assemble(config, driver, pacing, None).await
    }

    async fn assemble(
        config: Config,
        driver: Arc<dyn PortalDriver>,
        pacing: Arc<dyn PacingModel>,
        browser: Option<Arc<Browser>>,
    ) -> Result<Self> {
        let store = Arc::new(
            FileStore::open(&config.storage.state_dir)
                .await
                .context("无法打开状态目录")?,
        );
        let evidence: Arc<dyn EvidenceStore> = Arc::new(
            FsEvidenceStore::open(&config.evidence.dir)
                .await
                .context("无法打开证据目录")?,
        );

        let mut sinks = FanoutSink::new(vec![Arc::new(LogSink) as Arc<dyn EventSink>]);
        if let Some(url) = &config.events.webhook_url {
            sinks.push(Arc::new(WebhookSink::new(url.clone()).context("无法创建 webhook 客户端")?));
            info!("📣 状态事件将推送到: {}", url);
        }

        let coordinator = Arc::new(JobCoordinator::new(
            store,
            evidence.clone(),
            Arc::new(sinks),
            config.submission.max_concurrent,
        ));
        let follow_up = Arc::new(FollowUpWriter::new(&config.storage.follow_up_file));

        let engine = Arc::new(SubmissionEngine::new(
            coordinator.clone(),
            driver.clone(),
            Sanitizer::new(&config.sanitizer),
            Arc::new(EvidenceRecorder::new(evidence)),
            BackoffPolicy::new(
                Duration::from_millis(config.submission.backoff_base_ms),
                Duration::from_millis(config.submission.backoff_cap_ms),
                config.pacing.seed,
            ),
            follow_up.clone(),
            SubmissionLimits::from(&config.submission),
        ));
        let pool = SubmissionPool::new(
            engine,
            pacing.clone(),
            config.submission.max_concurrent,
            Duration::from_millis(config.submission.idle_poll_ms),
        );
        let reconciler = StatusReconciler::new(
            coordinator.clone(),
            driver,
            pacing,
            PollSchedule::from_config(&config.reconcile),
            Duration::from_secs(config.reconcile.query_timeout_secs),
            follow_up,
            Duration::from_secs(config.reconcile.tick_secs),
        );

        coordinator.recover().await.context("崩溃恢复失败")?;

        Ok(Self {
            config,
            _browser: browser,
            coordinator,
            pool,
            reconciler,
        })
    }

    pub fn coordinator(&self) -> &Arc<JobCoordinator> {
        &self.coordinator
    }

    pub fn reconciler(&self) -> &StatusReconciler {
        &self.reconciler
    }

    /// 运行应用主逻辑，直到 Ctrl+C
    pub async fn run(&self) -> Result<()> {
        self.intake().await?;
        self.purge_evidence().await;

        let (tx, rx) = watch::channel(false);
        let shutdown = async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("监听 Ctrl+C 失败: {}", e);
            }
            info!("🛑 收到停止信号，等待进行中的提交完成...");
            let _ = tx.send(true);
        };

        let (stats, _, _) = tokio::join!(self.pool.run(rx.clone()), self.reconciler.run(rx), shutdown);

        print_final_stats(&stats, &self.config.storage.follow_up_file.display().to_string());
        Ok(())
    }

    /// 入队、处理到队列空闲、再跑一轮对账
    pub async fn run_once(&self) -> Result<PoolStats> {
        self.intake().await?;
        let stats = self.pool.run_until_idle().await;
        let report = self.reconciler.reconcile_once(Utc::now()).await?;
        info!("🔎 对账完成: {}", report);
        Ok(stats)
    }

    /// 扫描申请目录，逐个入队，返回入队数量
    ///
    /// 文件先改名为 `.claimed` 再入队，入队成功后删除。进程在两步之间中断时
    /// 只会留下 `.claimed` 文件等待人工处理，不会在下次启动时重复入队。
    pub async fn intake(&self) -> Result<usize> {
        let folder = &self.config.storage.intake_dir;
        if !folder.exists() {
            warn!("⚠️ 申请目录不存在: {}", folder.display());
            return Ok(0);
        }

        info!("\n📁 正在扫描申请目录...");
        warn_leftover_claims(folder).await;
        let intakes = load_all_intake_files(folder).await?;
        log_intake_loaded(intakes.len(), self.config.submission.max_concurrent);

        let mut enqueued = 0;
        for intake in intakes {
            let claimed = match &intake.file_path {
                Some(path) => {
                    let claimed = claimed_path(path);
                    if let Err(e) = tokio::fs::rename(path, &claimed).await {
                        warn!("跳过 {}: 无法标记为已认领: {}", path.display(), e);
                        continue;
                    }
                    Some((path.clone(), claimed))
                }
                None => None,
            };

            let id = match self.coordinator.enqueue(intake.fields, intake.priority).await {
                Ok(id) => id,
                Err(e) => {
                    if let Some((original, claimed)) = &claimed {
                        if let Err(undo) = tokio::fs::rename(claimed, original).await {
                            error!("无法恢复申请文件 {}: {}", claimed.display(), undo);
                        }
                    }
                    return Err(e).context("入队失败");
                }
            };
            enqueued += 1;

            if let Some((_, claimed)) = claimed {
                if let Err(e) = tokio::fs::remove_file(&claimed).await {
                    warn!("无法删除已入队的文件 {} (请求 {}): {}", claimed.display(), id, e);
                }
            }
        }
        Ok(enqueued)
    }

    /// 清理超过保留期的证据
    async fn purge_evidence(&self) {
        let days = self.config.evidence.retention_days;
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        match self.coordinator.evidence_store().purge_older_than(cutoff).await {
            Ok(0) => {}
            Ok(purged) => info!("🧹 已清理 {} 条超过 {} 天的证据", purged, days),
            Err(e) => warn!("清理证据失败: {}", e),
        }
    }
}

const CLAIMED_SUFFIX: &str = "claimed";

fn claimed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(CLAIMED_SUFFIX);
    PathBuf::from(name)
}

/// 上次运行在入队途中中断留下的文件
async fn warn_leftover_claims(folder: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(folder).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some(CLAIMED_SUFFIX) {
            warn!("⚠️ 发现未完成入队的申请文件，请人工确认是否已入队: {}", path.display());
        }
    }
}

/// 按 `portal.target` 选择门户驱动
fn build_driver(config: &Config, browser: Arc<Browser>, pacing: Arc<dyn PacingModel>) -> Result<Arc<dyn PortalDriver>> {
    match config.portal.target.as_str() {
        phoenix::PORTAL_ID => Ok(Arc::new(PhoenixPortal::new(
            browser,
            config.portal.url.clone(),
            config.portal.status_url.clone(),
            pacing,
        ))),
        other => anyhow::bail!("未知的门户: {}", other),
    }
}
