//! 可重试的同步任务
//!
//! 每个任务接收剩余重试次数并返回执行后的剩余次数；次数为 0 时任务不做任何事。
//! 校验不一致不是错误，只会消耗重试次数；哈希超时等错误直接向上传播。

use crate::core::file_state::{FileStats, MatchOptions};
use crate::core::hasher::{calculate_hashes, collect_hashes, StatsMap, DEFAULT_TIMEOUT_SECS};
use crate::error::{Result, TransferError};
use crate::storage::{join_url, quote_path, RemoteLookup, TransferClient};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 默认重试次数
pub const TRIES: u32 = 5;

/// 默认哈希超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(DEFAULT_TIMEOUT_SECS);

/// 同步任务
#[async_trait]
pub trait Task: Send + fmt::Display {
    /// 执行任务，返回剩余重试次数
    async fn execute(&mut self, client: &dyn TransferClient, tries: u32) -> Result<u32>;
}

/// `root` 下文件的相对路径，统一用 `/` 分隔
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// 同步目录并逐个比对哈希
pub struct CheckedSync {
    src_dir: PathBuf,
    dst_url: String,
    remove_extraneous: bool,
    timeout: Duration,
    filestats: StatsMap,
}

impl CheckedSync {
    pub fn new(src_dir: impl Into<PathBuf>, dst_url: impl Into<String>) -> Self {
        Self {
            src_dir: src_dir.into(),
            dst_url: dst_url.into(),
            remove_extraneous: false,
            timeout: DEFAULT_TIMEOUT,
            filestats: StatsMap::new(),
        }
    }

    pub fn remove_extraneous(mut self, remove_extraneous: bool) -> Self {
        self.remove_extraneous = remove_extraneous;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 预先提供已知的文件哈希，避免重复计算
    pub fn with_cache(mut self, cache: StatsMap) -> Self {
        self.filestats = cache;
        self
    }

    /// 最近一次校验时的本地文件身份
    pub fn filestats(&self) -> &StatsMap {
        &self.filestats
    }
}

impl fmt::Display for CheckedSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CheckedSync('{}', '{}', {}, {}s)",
            self.src_dir.display(),
            self.dst_url,
            self.remove_extraneous,
            self.timeout.as_secs()
        )
    }
}

#[async_trait]
impl Task for CheckedSync {
    async fn execute(&mut self, client: &dyn TransferClient, mut tries: u32) -> Result<u32> {
        while tries > 0 {
            client
                .sync(&self.src_dir, &self.dst_url, self.remove_extraneous)
                .await?;

            info!("正在计算 '{}' 的本地哈希", self.src_dir.display());
            self.filestats = match collect_hashes(&self.src_dir, &self.filestats, self.timeout).await
            {
                Ok(stats) => stats,
                Err(err) => {
                    if err.is_timeout() {
                        error!("计算 '{}' 的哈希超时", self.src_dir.display());
                    }
                    return Err(err);
                }
            };

            info!("正在获取 {:?} 的远端哈希", self.dst_url);
            let mut remote = client.list_hashes(&self.dst_url).await?;

            let mut verified = true;
            for (filepath, local_stats) in &self.filestats {
                let Some(key) = relative_key(&self.src_dir, filepath) else {
                    continue;
                };

                match remote.remove(&key) {
                    None => {
                        warn!("文件 '{}' 未同步到远端", filepath.display());
                        verified = false;
                    }
                    Some(remote_stats)
                        if !remote_stats.matches(local_stats, MatchOptions::OPTIONAL_MTIME) =>
                    {
                        warn!(
                            "文件 '{}' 校验不一致: 本地 {} != 远端 {}",
                            filepath.display(),
                            local_stats,
                            remote_stats
                        );
                        verified = false;

                        client
                            .remove(&join_url([self.dst_url.as_str(), quote_path(&key).as_str()]))
                            .await?;
                    }
                    Some(_) => {}
                }
            }

            if !verified {
                tries -= 1;
                warn!("{} 校验未通过，剩余重试次数 {}", self, tries);
            } else if self.remove_extraneous && !remote.is_empty() {
                // 多余文件交给下一轮 sync 删除
                for key in remote.keys() {
                    warn!("远端存在多余文件 {:?}", key);
                }
                tries -= 1;
                warn!("{} 远端未清理干净，剩余重试次数 {}", self, tries);
            } else {
                info!("{} 校验通过", self);
                return Ok(tries);
            }
        }

        Ok(0)
    }
}

/// 复制单个文件并比对哈希
pub struct CheckedCopy {
    src_file: PathBuf,
    dst_url: String,
    timeout: Duration,
    filestats: StatsMap,
}

impl CheckedCopy {
    pub fn new(src_file: impl Into<PathBuf>, dst_url: impl Into<String>) -> Self {
        Self {
            src_file: src_file.into(),
            dst_url: dst_url.into(),
            timeout: DEFAULT_TIMEOUT,
            filestats: StatsMap::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 最近一次校验时的本地文件身份
    pub fn filestats(&self) -> Option<&FileStats> {
        self.filestats.get(&self.src_file)
    }
}

impl fmt::Display for CheckedCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CheckedCopy('{}', '{}', {}s)",
            self.src_file.display(),
            self.dst_url,
            self.timeout.as_secs()
        )
    }
}

#[async_trait]
impl Task for CheckedCopy {
    async fn execute(&mut self, client: &dyn TransferClient, mut tries: u32) -> Result<u32> {
        let mut first_loop = true;

        while tries > 0 {
            let collected = collect_hashes(&self.src_file, &self.filestats, self.timeout).await?;
            if collected.len() != 1 {
                error!(
                    "'{}' 应当是单个文件，实际收集到 {} 个文件",
                    self.src_file.display(),
                    collected.len()
                );
                return Ok(0);
            }
            self.filestats = collected;

            let local_stats = self
                .filestats
                .values()
                .next()
                .cloned()
                .unwrap_or_default();

            match client.lookup_hash(&self.dst_url).await? {
                RemoteLookup::Found(remote_stats)
                    if remote_stats.matches(&local_stats, MatchOptions::OPTIONAL_MTIME) =>
                {
                    info!("{} 校验通过", self);
                    break;
                }
                RemoteLookup::Found(remote_stats) => {
                    warn!(
                        "文件 '{}' 校验不一致: 本地 {} != 远端 {}",
                        self.src_file.display(),
                        local_stats,
                        remote_stats
                    );
                    if !first_loop {
                        tries -= 1;
                    }
                }
                RemoteLookup::NotFound if first_loop => {
                    debug!("{:?} 尚未上传", self.dst_url);
                }
                RemoteLookup::NotFound => {
                    error!("{:?} 上传后仍不存在", self.dst_url);
                    return Err(TransferError::FileNotFound(self.dst_url.clone()));
                }
            }

            if tries > 0 {
                client.copy(&self.src_file, &self.dst_url).await?;
            }

            first_loop = false;
        }

        Ok(tries)
    }
}

/// 按显式映射（远端相对路径 -> 本地文件）复制多个文件并比对哈希
pub struct CheckedMultiCopy {
    file_map: BTreeMap<String, PathBuf>,
    dst_url: String,
    timeout: Duration,
    filestats: StatsMap,
}

impl CheckedMultiCopy {
    pub fn new(file_map: BTreeMap<String, PathBuf>, dst_url: impl Into<String>) -> Self {
        Self {
            file_map,
            dst_url: dst_url.into(),
            timeout: DEFAULT_TIMEOUT,
            filestats: StatsMap::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache(mut self, cache: StatsMap) -> Self {
        self.filestats = cache;
        self
    }

    /// 最近一次校验时各本地文件的身份
    pub fn filestats(&self) -> &StatsMap {
        &self.filestats
    }
}

impl fmt::Display for CheckedMultiCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CheckedMultiCopy({} files, '{}', {}s)",
            self.file_map.len(),
            self.dst_url,
            self.timeout.as_secs()
        )
    }
}

#[async_trait]
impl Task for CheckedMultiCopy {
    async fn execute(&mut self, client: &dyn TransferClient, mut tries: u32) -> Result<u32> {
        let mut filepaths: Vec<PathBuf> = self.file_map.values().cloned().collect();
        filepaths.sort();
        filepaths.dedup();

        let mut first_loop = true;
        while tries > 0 {
            self.filestats = calculate_hashes(&filepaths, &self.filestats, self.timeout).await?;
            let remote = client.list_hashes(&self.dst_url).await?;

            let queue: Vec<(&String, &PathBuf)> = self
                .file_map
                .iter()
                .filter(|(key, filepath)| {
                    let local = self.filestats.get(*filepath);
                    match (local, remote.get(*key)) {
                        (Some(local), Some(remote)) => {
                            !remote.matches(local, MatchOptions::OPTIONAL_MTIME)
                        }
                        _ => true,
                    }
                })
                .collect();

            if queue.is_empty() {
                info!("{} 校验通过", self);
                break;
            }

            // 首轮上传是正常流程，不计入重试
            if !first_loop {
                tries -= 1;
                warn!("{} 有 {} 个文件校验未通过，剩余重试次数 {}", self, queue.len(), tries);
            }

            if tries > 0 {
                for (key, filepath) in queue {
                    let dst_url = join_url([self.dst_url.as_str(), quote_path(key).as_str()]);
                    client.copy(filepath, &dst_url).await?;
                }
            }

            first_loop = false;
        }

        Ok(tries)
    }
}

/// 删除本地文件或目录
pub struct RemoveLocal {
    path: PathBuf,
}

impl RemoveLocal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl fmt::Display for RemoveLocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoveLocal('{}')", self.path.display())
    }
}

#[async_trait]
impl Task for RemoveLocal {
    async fn execute(&mut self, _client: &dyn TransferClient, tries: u32) -> Result<u32> {
        if tries > 0 {
            info!("正在删除本地路径 '{}'", self.path.display());
            let metadata = tokio::fs::symlink_metadata(&self.path).await?;
            if metadata.is_dir() {
                tokio::fs::remove_dir_all(&self.path).await?;
            } else {
                tokio::fs::remove_file(&self.path).await?;
            }
        }

        Ok(tries)
    }
}

/// 删除远端对象
pub struct RemoveRemote {
    dst_url: String,
}

impl RemoveRemote {
    pub fn new(dst_url: impl Into<String>) -> Self {
        Self {
            dst_url: dst_url.into(),
        }
    }
}

impl fmt::Display for RemoveRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoveRemote('{}')", self.dst_url)
    }
}

#[async_trait]
impl Task for RemoveRemote {
    async fn execute(&mut self, client: &dyn TransferClient, tries: u32) -> Result<u32> {
        if tries > 0 {
            client.remove(&self.dst_url).await?;
        }

        Ok(tries)
    }
}

/// 把一段数据写为远端对象（例如完成标记）
pub struct Write {
    dst_url: String,
    data: Vec<u8>,
    timeout: Duration,
}

impl Write {
    pub fn new(dst_url: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            dst_url: dst_url.into(),
            data: data.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for Write {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Write('{}', {} bytes)", self.dst_url, self.data.len())
    }
}

#[async_trait]
impl Task for Write {
    async fn execute(&mut self, client: &dyn TransferClient, tries: u32) -> Result<u32> {
        if tries == 0 {
            return Ok(0);
        }

        let mut scratch = tempfile::NamedTempFile::new()?;
        scratch.write_all(&self.data)?;
        scratch.flush()?;

        // scratch 在复制结束前保持存活
        let mut copy = CheckedCopy::new(scratch.path(), self.dst_url.clone()).timeout(self.timeout);
        copy.execute(client, tries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_key() {
        let root = Path::new("/data/run1");
        assert_eq!(
            relative_key(root, Path::new("/data/run1/sub/a.fastq")).as_deref(),
            Some("sub/a.fastq")
        );
        assert_eq!(relative_key(root, Path::new("/other/a")), None);
    }

    #[test]
    fn test_display() {
        let task = CheckedSync::new("/data/run1", "https://x/c/run1")
            .remove_extraneous(true)
            .timeout(Duration::from_secs(60));
        assert_eq!(
            task.to_string(),
            "CheckedSync('/data/run1', 'https://x/c/run1', true, 60s)"
        );
        assert_eq!(
            Write::new("https://x/c/run1.sync", "now").to_string(),
            "Write('https://x/c/run1.sync', 3 bytes)"
        );
    }
}
