//! 显式重试组合器（指数退避）

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 重试基础延迟
    pub base_delay: Duration,
    /// 延迟上限
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// 第 `attempt` 次失败后的等待时间（从 0 开始）
    fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// 执行 `op`，对可重试错误（见 `TransferError::is_retryable`）按策略重试；
/// 其它错误立即返回
pub async fn with_retry<F, Fut, T>(name: &str, policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!("操作 '{}' 在第 {} 次重试后成功", name, attempt);
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    "操作 '{}' 失败，{:?} 后重试 ({}/{}): {}",
                    name,
                    delay,
                    attempt + 1,
                    max_attempts - 1,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    error!("操作 '{}' 最终失败 (已重试{}次): {}", name, attempt, err);
                }
                return Err(err);
            }
        }
    }
}
