//! 任务编排
//!
//! 一组任务共享同一个重试预算：前面的任务耗尽预算后，后面的任务（写完成标记、
//! 删除本地源数据等）不再执行。

use crate::core::task::Task;
use crate::error::Result;
use crate::storage::TransferClient;
use tracing::{error, info};

/// 依次执行任务，并把剩余重试次数传给下一个任务
///
/// 所有任务执行完且仍有剩余次数时返回 `true`；某个任务耗尽次数时立即返回
/// `false`，不再执行后续任务。
pub async fn execute(
    client: &dyn TransferClient,
    tasks: &mut [Box<dyn Task>],
    mut tries: u32,
) -> Result<bool> {
    for task in tasks.iter_mut() {
        info!("执行任务 {} (剩余重试次数 {})", task, tries);
        tries = task.execute(client, tries).await?;

        if tries == 0 {
            error!("任务 {} 失败: 重试次数已耗尽", task);
            return Ok(false);
        }
    }

    Ok(tries > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use async_trait::async_trait;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// 记录执行次数，并消耗固定的重试次数
    struct Consume {
        cost: u32,
        runs: Arc<AtomicU32>,
    }

    impl fmt::Display for Consume {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Consume({})", self.cost)
        }
    }

    #[async_trait]
    impl Task for Consume {
        async fn execute(&mut self, _client: &dyn TransferClient, tries: u32) -> Result<u32> {
            if tries == 0 {
                return Ok(0);
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(tries.saturating_sub(self.cost))
        }
    }

    fn consume(cost: u32, runs: &Arc<AtomicU32>) -> Box<dyn Task> {
        Box::new(Consume {
            cost,
            runs: runs.clone(),
        })
    }

    fn client() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path(), "file://").unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_budget_is_threaded_through_tasks() {
        let (_dir, client) = client();
        let runs = Arc::new(AtomicU32::new(0));
        let mut tasks = vec![consume(1, &runs), consume(2, &runs), consume(0, &runs)];

        assert!(execute(&client, &mut tasks, 5).await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_skips_remaining_tasks() {
        let (_dir, client) = client();
        let runs = Arc::new(AtomicU32::new(0));
        let mut tasks = vec![consume(3, &runs), consume(0, &runs)];

        assert!(!execute(&client, &mut tasks, 3).await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_task_list() {
        let (_dir, client) = client();
        assert!(execute(&client, &mut [], 5).await.unwrap());
        assert!(!execute(&client, &mut [], 0).await.unwrap());
    }
}
