use log::warn;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::{Error, Result};

/// 轮询及瞬时错误重试的退避策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次尝试前的等待，例如给节点索引新交易的时间
    pub grace_delay: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
    /// 整个操作的时间上限，包含所有等待
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            grace_delay: Duration::ZERO,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2,
            max_attempts: 5,
            deadline: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    /// 无任何等待，最多尝试 `max_attempts` 次
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            grace_delay: Duration::ZERO,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
            max_attempts,
            deadline: None,
        }
    }

    pub fn receipt(grace_delay: Duration, poll_interval: Duration, deadline: Duration) -> Self {
        Self {
            grace_delay,
            initial_backoff: poll_interval,
            max_backoff: poll_interval * 4,
            multiplier: 2,
            max_attempts: u32::MAX,
            deadline: Some(deadline),
        }
    }

    /// 第 `attempt` 次失败后的等待时间（从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// 重复执行 `op`，直到成功、遇到非瞬时错误、用完 `max_attempts`
/// 或超过策略截止时间（`Error::Timeout`）
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = async {
        if !policy.grace_delay.is_zero() {
            sleep(policy.grace_delay).await;
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        label, attempt, policy.max_attempts, delay, e
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    };
    with_deadline(policy.deadline, label, attempts).await
}

pub async fn with_deadline<Fut, T>(deadline: Option<Duration>, label: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match deadline {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(format!("{} exceeded {:?}", label, limit)))?,
        None => fut.await,
    }
}
