use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::services::pacing::{PacingProfile, StepKind};

/// 程序配置
///
/// 加载顺序：默认值 → `CONFIG_FILE` 指向的 TOML 文件 → 环境变量覆盖
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub portal: PortalConfig,
    pub browser: BrowserConfig,
    pub submission: SubmissionConfig,
    pub reconcile: ReconcileConfig,
    pub sanitizer: SanitizerConfig,
    pub pacing: PacingConfig,
    pub evidence: EvidenceConfig,
    pub storage: StorageConfig,
    pub events: EventsConfig,
    /// 是否显示详细日志
    pub verbose_logging: bool,
}

/// 目标门户
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// 门户标识，选择具体的驱动实现
    pub target: String,
    /// 申请表单入口
    pub url: String,
    /// 状态查询页面
    pub status_url: String,
}

/// 浏览器
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// 连接已启动浏览器的调试端口；为空时自行启动无头浏览器
    pub debug_port: Option<u16>,
    /// 无头模式下的浏览器可执行文件
    pub executable: Option<PathBuf>,
    pub proxy_url: Option<String>,
    /// 无头模式下单个 CDP 请求的超时
    pub session_timeout_secs: u64,
}

/// 提交
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// 同时进行的提交数量
    pub max_concurrent: usize,
    /// 每个请求的最大尝试次数
    pub max_attempts: u32,
    /// 每个请求同时打开的尝试上限
    pub max_open_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// 单次尝试超时
    pub attempt_timeout_secs: u64,
    /// 队列为空时的轮询间隔
    pub idle_poll_ms: u64,
}

/// 轮询档位：年龄不超过 `max_age_hours` 的请求按 `interval_secs` 轮询
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PollTier {
    pub max_age_hours: u64,
    pub interval_secs: u64,
}

/// 对账
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub tick_secs: u64,
    pub poll_tiers: Vec<PollTier>,
    /// 超过所有档位后的轮询间隔
    pub tail_interval_secs: u64,
    /// 超过此年龄仍无结果则过期
    pub max_request_age_hours: u64,
    pub query_timeout_secs: u64,
}

/// 清洗规则
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// 门户无法处理的字符
    pub blocklist: String,
    pub max_text_len: usize,
    pub max_name_len: usize,
    pub max_case_number_len: usize,
}

/// 节奏模型
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// 固定种子（测试 / 复现）；为空时使用系统熵
    pub seed: Option<u64>,
    pub profiles: BTreeMap<StepKind, PacingProfile>,
}

/// 证据
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub dir: PathBuf,
    /// 合规保留期
    pub retention_days: u64,
}

/// 存储
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 请求状态目录
    pub state_dir: PathBuf,
    /// 待入队 TOML 文件目录
    pub intake_dir: PathBuf,
    /// 需要人工跟进的请求清单
    pub follow_up_file: PathBuf,
}

/// 事件
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// 状态转换事件推送地址
    pub webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            portal: PortalConfig::default(),
            browser: BrowserConfig::default(),
            submission: SubmissionConfig::default(),
            reconcile: ReconcileConfig::default(),
            sanitizer: SanitizerConfig::default(),
            pacing: PacingConfig::default(),
            evidence: EvidenceConfig::default(),
            storage: StorageConfig::default(),
            events: EventsConfig::default(),
            verbose_logging: false,
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            target: "phoenix_pd".to_string(),
            url: "https://phxpublicsafety.phoenix.gov/".to_string(),
            status_url: "https://phxpublicsafety.phoenix.gov/status".to_string(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            debug_port: None,
            executable: None,
            proxy_url: None,
            session_timeout_secs: 300,
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_attempts: 3,
            max_open_attempts: 1,
            backoff_base_ms: 30_000,
            backoff_cap_ms: 15 * 60 * 1000,
            attempt_timeout_secs: 240,
            idle_poll_ms: 5_000,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            poll_tiers: vec![
                PollTier {
                    max_age_hours: 24,
                    interval_secs: 60 * 60,
                },
                PollTier {
                    max_age_hours: 7 * 24,
                    interval_secs: 6 * 60 * 60,
                },
                PollTier {
                    max_age_hours: 30 * 24,
                    interval_secs: 24 * 60 * 60,
                },
            ],
            tail_interval_secs: 3 * 24 * 60 * 60,
            max_request_age_hours: 120 * 24,
            query_timeout_secs: 120,
        }
    }
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            blocklist: "<>&#".to_string(),
            max_text_len: 2000,
            max_name_len: 100,
            max_case_number_len: 40,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            seed: None,
            profiles: StepKind::ALL
                .iter()
                .map(|step| (*step, PacingProfile::default_for(*step)))
                .collect(),
        }
    }
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("evidence"),
            retention_days: 7 * 365,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            intake_dir: PathBuf::from("intake"),
            follow_up_file: PathBuf::from("follow_up.txt"),
        }
    }
}

impl Config {
    /// 从 TOML 文件加载，缺省项使用默认值
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// 加载配置：`CONFIG_FILE` 存在则先读文件，再叠加环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("CONFIG_FILE") {
            Ok(path) => Self::from_toml_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(v) = std::env::var("PORTAL_TARGET") {
            self.portal.target = v;
        }
        if let Ok(v) = std::env::var("PORTAL_URL") {
            self.portal.url = v;
        }
        if let Ok(v) = std::env::var("PORTAL_STATUS_URL") {
            self.portal.status_url = v;
        }
        if let Some(v) = env_parse::<u16>("BROWSER_DEBUG_PORT")? {
            self.browser.debug_port = Some(v);
        }
        if let Ok(v) = std::env::var("BROWSER_EXECUTABLE") {
            self.browser.executable = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("PROXY_URL") {
            self.browser.proxy_url = Some(v);
        }
        if let Some(v) = env_parse("MAX_CONCURRENT_SUBMISSIONS")? {
            self.submission.max_concurrent = v;
        }
        if let Some(v) = env_parse("MAX_ATTEMPTS")? {
            self.submission.max_attempts = v;
        }
        if let Some(v) = env_parse("BACKOFF_BASE_MS")? {
            self.submission.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("BACKOFF_CAP_MS")? {
            self.submission.backoff_cap_ms = v;
        }
        if let Some(v) = env_parse("MAX_REQUEST_AGE_HOURS")? {
            self.reconcile.max_request_age_hours = v;
        }
        if let Ok(v) = std::env::var("SANITIZER_BLOCKLIST") {
            self.sanitizer.blocklist = v;
        }
        if let Some(v) = env_parse("PACING_SEED")? {
            self.pacing.seed = Some(v);
        }
        if let Ok(v) = std::env::var("EVIDENCE_DIR") {
            self.evidence.dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STATE_DIR") {
            self.storage.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("INTAKE_DIR") {
            self.storage.intake_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EVENTS_WEBHOOK_URL") {
            self.events.webhook_url = Some(v);
        }
        if let Some(v) = env_parse("VERBOSE_LOGGING")? {
            self.verbose_logging = v;
        }
        Ok(self)
    }

    /// 检查互相依赖的配置项
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.submission.max_concurrent == 0 {
            return Err(invalid("submission.max_concurrent", "必须大于 0"));
        }
        if self.submission.max_attempts == 0 {
            return Err(invalid("submission.max_attempts", "必须大于 0"));
        }
        if self.submission.max_open_attempts == 0 {
            return Err(invalid("submission.max_open_attempts", "必须大于 0"));
        }
        if self.submission.backoff_base_ms > self.submission.backoff_cap_ms {
            return Err(invalid("submission.backoff_base_ms", "不能大于 backoff_cap_ms"));
        }
        let ages: Vec<u64> = self.reconcile.poll_tiers.iter().map(|t| t.max_age_hours).collect();
        if ages.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("reconcile.poll_tiers", "max_age_hours 必须严格递增"));
        }
        for (step, profile) in &self.pacing.profiles {
            if profile.min_ms > profile.max_ms {
                return Err(invalid(
                    &format!("pacing.profiles.{}", step.as_str()),
                    "min_ms 不能大于 max_ms",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(var_name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: std::any::type_name::<T>().to_string(),
            }),
        Err(_) => Ok(None),
    }
}
