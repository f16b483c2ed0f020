use crate::error::EipError;
use bon::Builder;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 重投策略
///
/// 计数从 1 开始：第 n 次重投前以 n 询问 `should_redeliver`，
/// `maximum_redeliveries` 为负数表示无限重投。延迟单位为毫秒。
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedeliveryPolicy {
    #[builder(default = 0)]
    pub maximum_redeliveries: i32,
    #[builder(default = 1000)]
    pub redelivery_delay: u64,
    #[builder(default = 60_000)]
    pub maximum_redelivery_delay: u64,
    #[builder(default = 2.0)]
    pub back_off_multiplier: f64,
    #[builder(default)]
    pub use_exponential_back_off: bool,
    #[builder(default = 0.15)]
    pub collision_avoidance_factor: f64,
    #[builder(default)]
    pub use_collision_avoidance: bool,
    pub delay_pattern: Option<DelayPattern>,
    #[builder(default = true)]
    pub log_stack_trace: bool,
    #[builder(default = true)]
    pub log_retry_attempted: bool,
    #[builder(default = true)]
    pub log_exhausted: bool,
    #[builder(default = true)]
    pub allow_redelivery_while_stopping: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RedeliveryPolicy {
    pub fn should_redeliver(&self, counter: u32) -> bool {
        self.maximum_redeliveries < 0 || i64::from(counter) <= i64::from(self.maximum_redeliveries)
    }

    /// 计算第 `counter` 次重投前的等待毫秒数；`previous` 为上一次的延迟
    pub fn calculate_redelivery_delay(&self, previous: u64, counter: u32) -> u64 {
        if let Some(pattern) = &self.delay_pattern {
            return pattern.delay_for(counter);
        }

        let mut delay = if previous == 0 {
            self.redelivery_delay
        } else if self.use_exponential_back_off && self.back_off_multiplier > 1.0 {
            (previous as f64 * self.back_off_multiplier).round() as u64
        } else {
            previous
        };

        if self.use_collision_avoidance {
            let mut rng = rand::thread_rng();
            let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            let variance = sign * self.collision_avoidance_factor * rng.r#gen::<f64>();
            delay = (delay as f64 * (1.0 + variance)).max(0.0).round() as u64;
        }

        if self.maximum_redelivery_delay > 0 {
            delay = delay.min(self.maximum_redelivery_delay);
        }
        delay
    }
}

/// 延迟模式：`"阈值:毫秒;阈值:毫秒;..."`
///
/// 取不超过当前计数的最大阈值对应的延迟；低于第一个阈值时为 0。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DelayPattern {
    steps: Vec<(u32, u64)>,
}

impl DelayPattern {
    pub fn delay_for(&self, counter: u32) -> u64 {
        self.steps
            .iter()
            .rev()
            .find(|(threshold, _)| *threshold <= counter)
            .map_or(0, |(_, delay)| *delay)
    }

    pub fn steps(&self) -> &[(u32, u64)] {
        &self.steps
    }
}

impl FromStr for DelayPattern {
    type Err = EipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| EipError::InvalidDelayPattern {
            pattern: s.to_string(),
            reason,
        };

        let mut steps = Vec::new();
        for group in s.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let (threshold, delay) = group
                .split_once(':')
                .ok_or_else(|| invalid(format!("group '{group}' is not 'threshold:delay'")))?;
            let threshold = threshold
                .trim()
                .parse::<u32>()
                .map_err(|e| invalid(format!("threshold '{threshold}': {e}")))?;
            let delay = delay
                .trim()
                .parse::<u64>()
                .map_err(|e| invalid(format!("delay '{delay}': {e}")))?;
            steps.push((threshold, delay));
        }
        if steps.is_empty() {
            return Err(invalid("pattern has no groups".to_string()));
        }
        steps.sort_by_key(|(threshold, _)| *threshold);
        Ok(Self { steps })
    }
}

impl TryFrom<String> for DelayPattern {
    type Error = EipError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DelayPattern> for String {
    fn from(pattern: DelayPattern) -> Self {
        pattern.to_string()
    }
}

impl fmt::Display for DelayPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (threshold, delay)) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{threshold}:{delay}")?;
        }
        Ok(())
    }
}
