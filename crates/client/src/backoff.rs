/// 重连退避策略

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 连续失败多少次后停止自动重连
    pub max_attempts: u32,
    /// 最大抖动比例
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: 0.25,
        }
    }
}

impl ReconnectPolicy {
    /// 第 `failures` 次连续失败后的基础等待时间（不含抖动）
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// 加入随机抖动，结果不超过 `max_delay`
    pub fn jittered_delay(&self, failures: u32) -> Duration {
        let delay = self.delay_for(failures);
        let ratio = self.jitter.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(rand::thread_rng().gen_range(0.0..=ratio));
        (delay + extra).min(self.max_delay)
    }
}
