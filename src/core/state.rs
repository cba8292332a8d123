//! 跨进程持久化状态
//!
//! 状态文件是两次运行之间唯一的事实来源。保存时先把旧文件硬链接为备份，
//! 再写入临时文件并 fsync，最后原子重命名覆盖；任何时刻崩溃都只会留下完整的
//! 旧版本或新版本。

use crate::core::file_state::FileStats;
use crate::core::hasher::StatsMap;
use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 默认保留的备份数量
pub const DEFAULT_MAX_BACKUPS: usize = 10;

/// 里程碑名称 -> Unix 时间戳
pub type RunRecord = BTreeMap<String, f64>;

const OBSERVED: &str = "observed";

/// 状态文件内容
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateDocument {
    /// 绝对路径 -> 文件身份
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stats: BTreeMap<String, FileStats>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ngs: BTreeMap<String, RunRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub proteomics: BTreeMap<String, RunRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metabolomics: BTreeMap<String, RunRecord>,
    /// 未识别的顶层字段原样保留
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn new_record() -> RunRecord {
    let mut record = RunRecord::new();
    record.insert(OBSERVED.to_string(), now());
    record
}

/// 在文件名后追加 `.<suffix>`
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// 持久化状态存储
///
/// 同一时刻只允许一个进程持有；互斥由调用方（PID 锁）保证。
pub struct PersistentState {
    filepath: PathBuf,
    max_backups: usize,
    data: StateDocument,
    dirty: Cell<bool>,
}

impl PersistentState {
    /// 加载状态文件；文件不存在时从空状态开始
    pub fn open(filepath: impl Into<PathBuf>, max_backups: usize) -> Result<Self> {
        let filepath = filepath.into();

        let data = match fs::read(&filepath) {
            Ok(content) => {
                debug!("加载状态文件: {}", filepath.display());
                serde_json::from_slice(&content)?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("状态文件 {} 不存在，使用空状态", filepath.display());
                StateDocument::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            filepath,
            max_backups,
            data,
            dirty: Cell::new(false),
        })
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    pub fn document(&self) -> &StateDocument {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn get_file_stats(&self, path: &Path) -> Option<FileStats> {
        self.data.stats.get(path.to_string_lossy().as_ref()).cloned()
    }

    pub fn set_file_stats(&mut self, path: &Path, stats: FileStats) {
        let key = path.to_string_lossy().into_owned();
        if self.data.stats.get(&key) != Some(&stats) {
            self.data.stats.insert(key, stats);
            self.dirty.set(true);
        }
    }

    /// 取出一组路径已缓存的文件身份，用作哈希缓存
    pub fn file_stats_for<'p, I>(&self, paths: I) -> StatsMap
    where
        I: IntoIterator<Item = &'p PathBuf>,
    {
        paths
            .into_iter()
            .filter_map(|path| Some((path.clone(), self.get_file_stats(path)?)))
            .collect()
    }

    /// 写回一组已校验的文件身份
    pub fn update_file_stats(&mut self, stats: &StatsMap) {
        for (path, stats) in stats {
            self.set_file_stats(path, stats.clone());
        }
    }

    pub fn get_ngs_run(&mut self, name: &str) -> NgsRun<'_> {
        NgsRun(Self::run(&mut self.data.ngs, &self.dirty, name))
    }

    pub fn get_proteomics_run(&mut self, name: &str) -> ProteomicsRun<'_> {
        ProteomicsRun(Self::run(&mut self.data.proteomics, &self.dirty, name))
    }

    pub fn get_metabolomics_run(&mut self, name: &str) -> RunState<'_> {
        Self::run(&mut self.data.metabolomics, &self.dirty, name)
    }

    /// 遍历所有测序运行记录
    pub fn ngs_runs(&mut self) -> impl Iterator<Item = (&str, NgsRun<'_>)> {
        let dirty = &self.dirty;
        self.data
            .ngs
            .iter_mut()
            .map(move |(name, record)| (name.as_str(), NgsRun(RunState { record, dirty })))
    }

    fn run<'a>(
        table: &'a mut BTreeMap<String, RunRecord>,
        dirty: &'a Cell<bool>,
        name: &str,
    ) -> RunState<'a> {
        let record = table.entry(name.to_string()).or_insert_with(|| {
            dirty.set(true);
            new_record()
        });

        RunState { record, dirty }
    }

    /// 保存状态；未修改且 `force` 为假时跳过。返回是否实际写入
    pub fn save(&mut self, force: bool) -> Result<bool> {
        if !force && !self.dirty.get() {
            debug!("状态未变化，跳过保存");
            return Ok(false);
        }

        info!("保存状态文件: {}", self.filepath.display());
        let content = serde_json::to_vec_pretty(&self.data)?;

        if let Some(parent) = self.filepath.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        self.backup()?;

        let temp_path = with_suffix(
            &self.filepath,
            &format!("{}_new", Utc::now().timestamp_micros()),
        );
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        // 写入或重命名失败时删除临时文件
        let guard = scopeguard::guard(temp_path, |path| {
            if let Err(e) = fs::remove_file(&path) {
                warn!("删除临时状态文件 {} 失败: {}", path.display(), e);
            }
        });

        file.write_all(&content)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&*guard, &self.filepath)?;
        scopeguard::ScopeGuard::into_inner(guard);

        self.prune_backups()?;
        self.dirty.set(false);

        Ok(true)
    }

    /// 把当前状态文件硬链接为带时间戳的备份
    fn backup(&self) -> Result<()> {
        loop {
            let backup = with_suffix(&self.filepath, &Utc::now().timestamp_micros().to_string());
            match fs::hard_link(&self.filepath, &backup) {
                Ok(()) => {
                    debug!("创建状态备份: {}", backup.display());
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 列出已有的备份文件，按时间从旧到新排序
    pub fn backups(&self) -> Result<Vec<PathBuf>> {
        let Some(filename) = self.filepath.file_name().and_then(|n| n.to_str()) else {
            return Ok(Vec::new());
        };
        let parent = match self.filepath.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        let prefix = format!("{}.", filename);

        let mut backups = Vec::new();
        for entry in fs::read_dir(&parent)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(suffix) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
                continue;
            };

            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(stamp) = suffix.parse::<u128>() {
                    backups.push((stamp, entry.path()));
                }
            }
        }

        backups.sort();
        Ok(backups.into_iter().map(|(_, path)| path).collect())
    }

    fn prune_backups(&self) -> Result<()> {
        let backups = self.backups()?;
        let excess = backups.len().saturating_sub(self.max_backups);

        for backup in &backups[..excess] {
            debug!("删除旧的状态备份: {}", backup.display());
            fs::remove_file(backup)?;
        }

        Ok(())
    }
}

/// 一个运行（数据集）的里程碑记录
pub struct RunState<'a> {
    record: &'a mut RunRecord,
    dirty: &'a Cell<bool>,
}

impl RunState<'_> {
    /// 首次发现该运行的时间
    pub fn observed(&self) -> f64 {
        self.get(OBSERVED).unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.record.get(key).copied()
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.record.contains_key(key)
    }

    /// 记录里程碑时间；已记录时不变
    pub fn stamp(&mut self, key: &str) {
        if !self.is_set(key) {
            self.stamp_overwrite(key);
        }
    }

    /// 以当前时间覆盖里程碑
    pub fn stamp_overwrite(&mut self, key: &str) {
        self.record.insert(key.to_string(), now());
        self.dirty.set(true);
    }
}

/// 测序运行：数据、样本表与完成标记
pub struct NgsRun<'a>(RunState<'a>);

impl NgsRun<'_> {
    pub fn observed(&self) -> f64 {
        self.0.observed()
    }

    pub fn is_data_synced(&self) -> bool {
        self.0.is_set("data")
    }

    pub fn set_data_synced(&mut self) {
        self.0.stamp("data");
    }

    pub fn is_sheet_synced(&self) -> bool {
        self.0.is_set("sheet")
    }

    pub fn set_sheet_synced(&mut self) {
        self.0.stamp("sheet");
    }

    pub fn is_flag_synced(&self) -> bool {
        self.0.is_set("flag")
    }

    pub fn set_flag_synced(&mut self) {
        self.0.stamp("flag");
    }

    /// 最近一次告警时间
    pub fn warned(&self) -> Option<f64> {
        self.0.get("warned")
    }

    pub fn set_warned(&mut self) {
        self.0.stamp_overwrite("warned");
    }

    /// 数据、样本表与完成标记均已同步
    pub fn is_synced(&self) -> bool {
        self.is_flag_synced() && self.is_data_synced() && self.is_sheet_synced()
    }
}

/// 蛋白组项目：结果、元数据与完成标记
pub struct ProteomicsRun<'a>(RunState<'a>);

impl ProteomicsRun<'_> {
    pub fn observed(&self) -> f64 {
        self.0.observed()
    }

    pub fn is_flag_synced(&self) -> bool {
        self.0.is_set("flag")
    }

    pub fn set_flag_synced(&mut self) {
        self.0.stamp("flag");
    }

    pub fn is_results_synced(&self) -> bool {
        self.0.is_set("results")
    }

    pub fn set_results_synced(&mut self) {
        self.0.stamp("results");
    }

    pub fn is_metadata_synced(&self) -> bool {
        self.0.is_set("metadata")
    }

    pub fn set_metadata_synced(&mut self) {
        self.0.stamp("metadata");
    }
}
