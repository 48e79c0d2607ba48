#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use records_request_submit::config::SanitizerConfig;
use records_request_submit::error::PortalError;
use records_request_submit::models::{
    ExternalRef, Priority, ReportType, RequestFields, RequestId, Requestor, TransitionEvent,
};
use records_request_submit::orchestrator::{JobCoordinator, PollSchedule, StatusReconciler};
use records_request_submit::services::{
    ChannelSink, Confirmation, EvidenceRecorder, ExternalStatus, FixedPacing, FollowUpWriter,
    MemoryEvidenceStore, PortalDriver, PortalSession, Sanitizer, Snapshot,
};
use records_request_submit::store::{MemoryStore, RequestStore};
use records_request_submit::workflow::{BackoffPolicy, SubmissionEngine, SubmissionLimits};

/// 一次提交的脚本结果
#[derive(Debug, Clone)]
pub enum SubmitStep {
    Confirm(String),
    Transient,
    Permanent,
    Unconfirmed,
    /// 等待一段时间后返回确认
    Slow(Duration, String),
}

/// 一次状态查询的脚本结果
#[derive(Debug, Clone)]
pub enum StatusStep {
    Status(String),
    Fail,
}

#[derive(Default)]
pub struct DriverState {
    submits: Mutex<VecDeque<SubmitStep>>,
    statuses: Mutex<VecDeque<StatusStep>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub submitted: AtomicUsize,
    pub queried: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub fail_snapshots: AtomicBool,
    shots: AtomicUsize,
}

/// 按脚本返回结果的门户驱动
///
/// 脚本用完后：提交返回唯一编号，查询返回 `Pending`
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    pub state: Arc<DriverState>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_submits(steps: impl IntoIterator<Item = SubmitStep>) -> Self {
        let driver = Self::new();
        driver.push_submits(steps);
        driver
    }

    pub fn push_submits(&self, steps: impl IntoIterator<Item = SubmitStep>) {
        self.state.submits.lock().unwrap().extend(steps);
    }

    pub fn push_statuses(&self, steps: impl IntoIterator<Item = StatusStep>) {
        self.state.statuses.lock().unwrap().extend(steps);
    }

    pub fn push_status(&self, raw: &str) {
        self.push_statuses([StatusStep::Status(raw.to_string())]);
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> usize {
        self.state.submitted.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortalDriver for ScriptedDriver {
    fn portal_id(&self) -> &str {
        "scripted"
    }

    async fn open_session(&self) -> Result<Box<dyn PortalSession>, PortalError> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            state: self.state.clone(),
            dispatched: false,
        }))
    }
}

struct ScriptedSession {
    state: Arc<DriverState>,
    /// `Transient` 模拟点击提交之前的失败，其余步骤都视为已点击
    dispatched: bool,
}

#[async_trait]
impl PortalSession for ScriptedSession {
    async fn navigate(&mut self) -> Result<(), PortalError> {
        Ok(())
    }

    async fn fill_and_submit(&mut self, _fields: &RequestFields) -> Result<Confirmation, PortalError> {
        let n = self.state.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);

        let step = self
            .state
            .submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| SubmitStep::Confirm(format!("PX-{:05}", n)));
        self.dispatched = !matches!(step, SubmitStep::Transient);
        let result = match step {
            SubmitStep::Confirm(reference) => Ok(confirmation(reference)),
            SubmitStep::Slow(wait, reference) => {
                tokio::time::sleep(wait).await;
                Ok(confirmation(reference))
            }
            SubmitStep::Transient => Err(PortalError::transient("form", "portal returned 503")),
            SubmitStep::Permanent => Err(PortalError::permanent("after_submit", "invalid case number")),
            SubmitStep::Unconfirmed => Err(PortalError::permanent("unconfirmed", "no confirmation number")),
        };

        self.state.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn query_status(&mut self, _reference: &ExternalRef) -> Result<ExternalStatus, PortalError> {
        self.state.queried.fetch_add(1, Ordering::SeqCst);
        let step = self.state.statuses.lock().unwrap().pop_front();
        match step.unwrap_or_else(|| StatusStep::Status("Pending".to_string())) {
            StatusStep::Status(raw) => Ok(ExternalStatus::from_raw(raw)),
            StatusStep::Fail => Err(PortalError::transient("query_status", "status page timed out")),
        }
    }

    async fn snapshot(&mut self, step: &str) -> Result<Snapshot, PortalError> {
        if self.state.fail_snapshots.load(Ordering::SeqCst) {
            return Err(PortalError::transient("snapshot", "screenshot failed"));
        }
        let n = self.state.shots.fetch_add(1, Ordering::SeqCst);
        Ok(Snapshot {
            step: step.to_string(),
            image: format!("png:{}:{}", step, n).into_bytes(),
            page_url: Some("https://portal.test/request".to_string()),
            page_title: Some("Public Records Request".to_string()),
        })
    }

    fn submit_dispatched(&self) -> bool {
        self.dispatched
    }

    async fn close(self: Box<Self>) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn confirmation(reference: String) -> Confirmation {
    Confirmation {
        reference: ExternalRef(reference),
        message: Some("Your request has been received".to_string()),
        page_url: Some("https://portal.test/confirmation".to_string()),
    }
}

/// 测试环境参数
pub struct Options {
    pub limits: SubmissionLimits,
    pub max_concurrent: usize,
    pub schedule: PollSchedule,
    pub store: Option<Arc<dyn RequestStore>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            limits: SubmissionLimits {
                max_attempts: 3,
                max_open_attempts: 1,
                attempt_timeout: Duration::from_secs(5),
            },
            max_concurrent: 4,
            // 每次都到期
            schedule: PollSchedule::new(Vec::new(), Duration::ZERO, chrono::Duration::days(30)),
            store: None,
        }
    }
}

pub struct Harness {
    pub coordinator: Arc<JobCoordinator>,
    pub engine: Arc<SubmissionEngine>,
    pub reconciler: StatusReconciler,
    pub driver: ScriptedDriver,
    pub events: UnboundedReceiver<TransitionEvent>,
    pub follow_up: Arc<FollowUpWriter>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(driver: ScriptedDriver) -> Self {
        Self::with_options(driver, Options::default())
    }

    pub fn with_options(driver: ScriptedDriver, options: Options) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (sink, events) = ChannelSink::new();
        let store = options
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn RequestStore>);
        let evidence = Arc::new(MemoryEvidenceStore::new());

        let coordinator = Arc::new(JobCoordinator::new(
            store,
            evidence.clone(),
            Arc::new(sink),
            options.max_concurrent,
        ));
        let follow_up = Arc::new(FollowUpWriter::new(dir.path().join("follow_up.txt")));
        let portal: Arc<dyn PortalDriver> = Arc::new(driver.clone());

        let engine = Arc::new(SubmissionEngine::new(
            coordinator.clone(),
            portal.clone(),
            Sanitizer::new(&SanitizerConfig::default()),
            Arc::new(EvidenceRecorder::new(evidence)),
            BackoffPolicy::immediate(),
            follow_up.clone(),
            options.limits,
        ));
        let reconciler = StatusReconciler::new(
            coordinator.clone(),
            portal,
            Arc::new(FixedPacing::zero()),
            options.schedule,
            Duration::from_secs(5),
            follow_up.clone(),
            Duration::from_millis(10),
        );

        Self {
            coordinator,
            engine,
            reconciler,
            driver,
            events,
            follow_up,
            dir,
        }
    }

    pub async fn enqueue(&self) -> RequestId {
        self.coordinator.enqueue(valid_fields(), Priority::Standard).await.unwrap()
    }

    /// 处理到请求离开 `Queued` 为止
    pub async fn drive_to_rest(&self, id: RequestId) -> records_request_submit::LifecycleState {
        for _ in 0..10 {
            let state = self.engine.process(id).await.unwrap();
            if state != records_request_submit::LifecycleState::Queued {
                return state;
            }
        }
        panic!("请求 {} 在 10 轮后仍在队列中", id);
    }

    pub fn follow_up_text(&self) -> String {
        std::fs::read_to_string(self.follow_up.path()).unwrap_or_default()
    }

    pub fn drain_events(&mut self) -> Vec<TransitionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn valid_fields() -> RequestFields {
    let mut fields = RequestFields::new(
        ReportType::Incident,
        Requestor {
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            email: "jane.doe@example.com".to_string(),
            ..Default::default()
        },
    );
    fields.case_number = Some("2024-00123456".to_string());
    fields.description = Some("Copy of the incident report".to_string());
    fields
}
