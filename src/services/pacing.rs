//! 节奏模型 - 业务能力层
//!
//! 为每个自动化步骤给出"像人一样"的等待时间。
//!
//! - 每种步骤有独立的均值 / 标准差 / 上下限
//! - 分布为对数正态（右偏，偶尔明显停顿），不是均匀分布
//! - 随机源显式注入：生产用系统熵，测试用固定种子或 [`FixedPacing`]

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// 自动化步骤类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// 打开页面后等待稳定
    PageLoad,
    /// 阅读表单
    ReadForm,
    /// 字段之间的停顿
    FieldGap,
    /// 单次按键
    Keystroke,
    /// 点击提交前的犹豫
    BeforeSubmit,
    /// 提交后等待确认页
    AfterSubmit,
    /// 状态查询前
    StatusCheck,
    /// 两次提交之间
    BetweenSubmissions,
}

impl StepKind {
    pub const ALL: [StepKind; 8] = [
        StepKind::PageLoad,
        StepKind::ReadForm,
        StepKind::FieldGap,
        StepKind::Keystroke,
        StepKind::BeforeSubmit,
        StepKind::AfterSubmit,
        StepKind::StatusCheck,
        StepKind::BetweenSubmissions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::PageLoad => "page_load",
            StepKind::ReadForm => "read_form",
            StepKind::FieldGap => "field_gap",
            StepKind::Keystroke => "keystroke",
            StepKind::BeforeSubmit => "before_submit",
            StepKind::AfterSubmit => "after_submit",
            StepKind::StatusCheck => "status_check",
            StepKind::BetweenSubmissions => "between_submissions",
        }
    }
}

/// 单个步骤的分布参数（毫秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingProfile {
    pub mean_ms: u64,
    pub std_dev_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl PacingProfile {
    /// 默认参数，取自原门户脚本的经验区间
    pub fn default_for(step: StepKind) -> Self {
        let (mean_ms, std_dev_ms, min_ms, max_ms) = match step {
            StepKind::PageLoad => (2_500, 800, 1_000, 6_000),
            StepKind::ReadForm => (1_500, 500, 800, 4_000),
            StepKind::FieldGap => (900, 350, 400, 2_500),
            StepKind::Keystroke => (110, 40, 50, 300),
            StepKind::BeforeSubmit => (1_400, 450, 700, 3_500),
            StepKind::AfterSubmit => (4_000, 900, 3_000, 8_000),
            StepKind::StatusCheck => (8_000, 3_000, 5_000, 15_000),
            StepKind::BetweenSubmissions => (60_000, 20_000, 30_000, 90_000),
        };
        Self {
            mean_ms,
            std_dev_ms,
            min_ms,
            max_ms,
        }
    }

    fn clamp(&self, ms: f64) -> u64 {
        let ms = if ms.is_finite() { ms.max(0.0) } else { 0.0 };
        (ms.round() as u64).clamp(self.min_ms, self.max_ms)
    }
}

/// 节奏模型
///
/// 无副作用：只计算时长，不负责等待
pub trait PacingModel: Send + Sync {
    fn next_delay(&self, step: StepKind) -> Duration;
}

/// 按节奏模型等待
pub async fn pause(pacing: &dyn PacingModel, step: StepKind) {
    let delay = pacing.next_delay(step);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// 带抖动的节奏模型
pub struct JitterPacing {
    profiles: BTreeMap<StepKind, PacingProfile>,
    rng: Mutex<ChaCha8Rng>,
}

impl JitterPacing {
    /// 使用系统熵作为种子
    pub fn from_entropy(profiles: BTreeMap<StepKind, PacingProfile>) -> Self {
        Self {
            profiles,
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    /// 使用固定种子，结果可复现
    pub fn seeded(profiles: BTreeMap<StepKind, PacingProfile>, seed: u64) -> Self {
        Self {
            profiles,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn new(profiles: BTreeMap<StepKind, PacingProfile>, seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(profiles, seed),
            None => Self::from_entropy(profiles),
        }
    }

    fn profile(&self, step: StepKind) -> PacingProfile {
        self.profiles
            .get(&step)
            .copied()
            .unwrap_or_else(|| PacingProfile::default_for(step))
    }
}

impl PacingModel for JitterPacing {
    fn next_delay(&self, step: StepKind) -> Duration {
        let profile = self.profile(step);
        // 锁中毒时沿用内部状态：只是随机数，没有需要保护的不变量
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let ms = sample_log_normal(&mut *rng, profile.mean_ms as f64, profile.std_dev_ms as f64);
        Duration::from_millis(profile.clamp(ms))
    }
}

/// 固定时长（测试用）
#[derive(Debug, Clone, Copy)]
pub struct FixedPacing(pub Duration);

impl FixedPacing {
    pub fn zero() -> Self {
        Self(Duration::ZERO)
    }
}

impl PacingModel for FixedPacing {
    fn next_delay(&self, _step: StepKind) -> Duration {
        self.0
    }
}

/// 按给定均值 / 标准差采样对数正态分布
fn sample_log_normal<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    if mean <= 0.0 {
        return 0.0;
    }
    if std_dev <= 0.0 {
        return mean;
    }
    // 由目标均值和方差反推底层正态分布参数
    let variance_ratio = (std_dev * std_dev) / (mean * mean);
    let sigma2 = (1.0 + variance_ratio).ln();
    let mu = mean.ln() - sigma2 / 2.0;
    let z = standard_normal(rng);
    (mu + sigma2.sqrt() * z).exp()
}

/// Box-Muller
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> BTreeMap<StepKind, PacingProfile> {
        StepKind::ALL
            .iter()
            .map(|s| (*s, PacingProfile::default_for(*s)))
            .collect()
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = JitterPacing::seeded(profiles(), 7);
        let b = JitterPacing::seeded(profiles(), 7);
        let seq_a: Vec<_> = (0..20).map(|_| a.next_delay(StepKind::Keystroke)).collect();
        let seq_b: Vec<_> = (0..20).map(|_| b.next_delay(StepKind::Keystroke)).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn delays_stay_within_bounds_and_vary() {
        let pacing = JitterPacing::seeded(profiles(), 99);
        let profile = PacingProfile::default_for(StepKind::FieldGap);
        let samples: Vec<u64> = (0..500)
            .map(|_| pacing.next_delay(StepKind::FieldGap).as_millis() as u64)
            .collect();

        assert!(samples
            .iter()
            .all(|ms| *ms >= profile.min_ms && *ms <= profile.max_ms));

        let distinct: std::collections::HashSet<_> = samples.iter().collect();
        assert!(distinct.len() > 50, "没有形成固定节奏");

        let mean = samples.iter().sum::<u64>() as f64 / samples.len() as f64;
        assert!((mean - profile.mean_ms as f64).abs() < profile.mean_ms as f64 * 0.2);
    }

    #[test]
    fn missing_profile_falls_back_to_default() {
        let pacing = JitterPacing::seeded(BTreeMap::new(), 1);
        let profile = PacingProfile::default_for(StepKind::PageLoad);
        let ms = pacing.next_delay(StepKind::PageLoad).as_millis() as u64;
        assert!(ms >= profile.min_ms && ms <= profile.max_ms);
    }

    #[test]
    fn fixed_pacing_is_constant() {
        let pacing = FixedPacing(Duration::from_millis(5));
        for step in StepKind::ALL {
            assert_eq!(pacing.next_delay(step), Duration::from_millis(5));
        }
        assert!(FixedPacing::zero().next_delay(StepKind::PageLoad).is_zero());
    }
}
