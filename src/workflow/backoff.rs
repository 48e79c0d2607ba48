//! 重试退避策略
//!
//! 第 n 次失败后的等待上限为 `min(cap, base * 2^(n-1))`，
//! 实际等待在 `[上限/2, 上限]` 之间随机取值。

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Mutex;
use std::time::Duration;

pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    rng: Mutex<ChaCha8Rng>,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            base,
            cap: cap.max(base),
            rng: Mutex::new(rng),
        }
    }

    /// 不等待（测试用）
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Some(0))
    }

    /// 第 `attempt` 次失败后的等待上限
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// 第 `attempt` 次失败后的实际等待
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let floor = ceiling / 2;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Duration::from_millis(rng.gen_range(floor..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(300), Some(1));
        assert_eq!(policy.ceiling(1), Duration::from_secs(30));
        assert_eq!(policy.ceiling(2), Duration::from_secs(60));
        assert_eq!(policy.ceiling(3), Duration::from_secs(120));
        assert_eq!(policy.ceiling(4), Duration::from_secs(240));
        assert_eq!(policy.ceiling(5), Duration::from_secs(300));
        assert_eq!(policy.ceiling(40), Duration::from_secs(300));
    }

    #[test]
    fn delay_stays_within_jitter_window() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(600), Some(42));
        for attempt in 1..8 {
            let ceiling = policy.ceiling(attempt);
            for _ in 0..50 {
                let d = policy.delay(attempt);
                assert!(d <= ceiling && d >= ceiling / 2, "attempt {} delay {:?}", attempt, d);
            }
        }
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = BackoffPolicy::immediate();
        assert!(policy.delay(1).is_zero());
        assert!(policy.delay(10).is_zero());
    }
}
