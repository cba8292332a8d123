//! 本地文件 stat / 哈希
//!
//! 源目录可能挂载在测序仪等慢速或会挂起的存储上，因此所有读盘操作都交给一个
//! 独立的工作线程执行，并在主流程中以超时等待。超时即视为源介质不可用，属于
//! 致命错误，不消耗重试次数。

use crate::core::file_state::{hash_file, FileStats, MatchOptions};
use crate::error::{Result, TransferError};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use walkdir::WalkDir;

/// 默认哈希超时（秒）
pub const DEFAULT_TIMEOUT_SECS: u64 = 10 * 60;

/// 绝对路径 -> 文件身份
pub type StatsMap = BTreeMap<PathBuf, FileStats>;

type Job = Box<dyn FnOnce() + Send>;

/// 单线程哈希工作者
///
/// 线程在发送端被丢弃后退出；若某个任务挂起，线程会被遗弃，进程退出时一并结束。
struct HashWorker {
    jobs: mpsc::Sender<Job>,
    timeout: Duration,
}

impl HashWorker {
    fn spawn(timeout: Duration) -> Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();

        std::thread::Builder::new()
            .name("labsync-hash".to_string())
            .spawn(move || {
                for job in queue {
                    job();
                }
            })?;

        Ok(Self { jobs, timeout })
    }

    async fn run<T, F>(&self, what: String, func: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move || {
                let _ = tx.send(func());
            }))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "hash worker stopped"))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(io::Error::new(io::ErrorKind::Other, "hash worker exited").into()),
            Err(_) => Err(TransferError::Timeout(what)),
        }
    }
}

/// 递归收集目录下所有文件的大小与修改时间；若 `root` 是文件则只返回它自身
pub fn collect_files(root: &Path) -> io::Result<StatsMap> {
    let metadata = std::fs::metadata(root)?;
    if metadata.is_file() {
        let mut result = StatsMap::new();
        result.insert(root.to_path_buf(), FileStats::from_metadata(&metadata));
        return Ok(result);
    }

    let mut result = StatsMap::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            let metadata = entry.metadata().map_err(io::Error::from)?;
            result.insert(entry.into_path(), FileStats::from_metadata(&metadata));
        }
    }

    Ok(result)
}

/// 收集 `root` 下所有文件并计算哈希；大小与修改时间未变的文件复用 `cache` 中的哈希
pub async fn collect_hashes(root: &Path, cache: &StatsMap, timeout: Duration) -> Result<StatsMap> {
    let worker = HashWorker::spawn(timeout)?;

    let owned_root = root.to_path_buf();
    let files = worker
        .run(
            format!("collecting files in '{}'", root.display()),
            move || collect_files(&owned_root),
        )
        .await?;

    let mut result = StatsMap::new();
    for (filepath, stats) in files {
        let stats = hash_with_cache(&worker, &filepath, stats, cache).await?;
        result.insert(filepath, stats);
    }

    Ok(result)
}

/// 对一组明确的文件路径 stat 并计算哈希
pub async fn calculate_hashes(
    filepaths: &[PathBuf],
    cache: &StatsMap,
    timeout: Duration,
) -> Result<StatsMap> {
    let worker = HashWorker::spawn(timeout)?;

    let mut result = StatsMap::new();
    for filepath in filepaths {
        let owned = filepath.clone();
        let stats = worker
            .run(
                format!("stat of '{}'", filepath.display()),
                move || FileStats::from_path(&owned),
            )
            .await?;

        let stats = hash_with_cache(&worker, filepath, stats, cache).await?;
        result.insert(filepath.clone(), stats);
    }

    Ok(result)
}

async fn hash_with_cache(
    worker: &HashWorker,
    filepath: &Path,
    stats: FileStats,
    cache: &StatsMap,
) -> Result<FileStats> {
    // stats 尚无哈希，按大小和修改时间判断缓存是否有效
    if let Some(cached) = cache.get(filepath) {
        if cached.matches(&stats, MatchOptions::OPTIONAL_HASH) {
            if let Some(hash) = cached.hash.as_deref().filter(|h| !h.is_empty()) {
                debug!("复用缓存哈希: {}", filepath.display());
                return Ok(stats.with_hash(hash));
            }
        }
    }

    let owned = filepath.to_path_buf();
    let hash = worker
        .run(
            format!("hashing '{}'", filepath.display()),
            move || hash_file(&owned),
        )
        .await?;

    Ok(stats.with_hash(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file_state::calculate_hash;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_collect_files_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = collect_files(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_collect_files_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let files = collect_files(&path).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[&path].size, Some(3));
    }

    #[tokio::test]
    async fn test_collect_hashes_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"defg").unwrap();

        let hashes = collect_hashes(dir.path(), &StatsMap::new(), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(hashes.len(), 2);
        let b = &hashes[&dir.path().join("sub/b.txt")];
        assert_eq!(b.hash.as_deref(), Some(calculate_hash(b"defg").as_str()));
        assert_eq!(b.size, Some(4));
        assert!(b.mtime.is_some());
    }

    #[tokio::test]
    async fn test_cache_reused_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let mut cache = StatsMap::new();
        cache.insert(
            path.clone(),
            FileStats::from_path(&path).unwrap().with_hash("CACHED"),
        );

        let hashes = calculate_hashes(&[path.clone()], &cache, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(hashes[&path].hash.as_deref(), Some("CACHED"));
    }

    #[tokio::test]
    async fn test_cache_ignored_when_size_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let mut stale = FileStats::from_path(&path).unwrap().with_hash("CACHED");
        stale.size = Some(100);
        let mut cache = StatsMap::new();
        cache.insert(path.clone(), stale);

        let hashes = calculate_hashes(&[path.clone()], &cache, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(hashes[&path].hash, Some(calculate_hash(b"abc")));
    }

    #[tokio::test]
    async fn test_worker_timeout_is_reported() {
        let worker = HashWorker::spawn(Duration::from_millis(20)).unwrap();
        let err = worker
            .run("sleeping".to_string(), || {
                std::thread::sleep(Duration::from_millis(500));
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
    }
}
