//! 蛋白组项目目录同步
//!
//! 项目目录中的文件按类型映射到远端布局，只上传相对缓存发生变化的文件。
//! 结果与元数据都已存在且其一有更新时写入 `results.ready`。

use super::common::{absolute, glob_folder, glob_matches, iso_now, login, CommonArgs, PidLock};
use crate::core::file_state::{FileStats, MatchOptions};
use crate::core::state::PersistentState;
use crate::core::task::{CheckedMultiCopy, Task, Write};
use crate::storage::{join_url, quote_path, with_session, TransferClient};
use anyhow::Result;
use clap::Args;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{error, info};

pub const COMMAND: &str = "proteomics";

const READY_MARKER: &str = "results.ready";

#[derive(Debug, Clone, Args)]
pub struct ProteomicsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// 包含项目子目录的主目录
    #[arg(long)]
    pub main_folder: PathBuf,

    /// 选择项目子目录的通配（不区分大小写）
    #[arg(long, default_value = "prot[0-9]*")]
    pub project_glob: String,

    /// 空白样本的通配（不区分大小写）
    #[arg(long, default_value = "blank*.raw")]
    pub blank_glob: String,

    /// 远端目标目录
    #[arg(long, default_value = "/")]
    pub destination: String,

    /// 文件最后修改后至少等待的秒数
    #[arg(long, default_value_t = 24 * 60 * 60)]
    pub min_file_age: u64,
}

/// 文件在远端的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Sample,
    Blank,
    Other,
    Result,
    Metadata,
}

impl FileKind {
    fn folder(self) -> &'static str {
        match self {
            FileKind::Sample => "samples",
            FileKind::Blank => "blanks",
            FileKind::Other => "other",
            FileKind::Result => "results",
            FileKind::Metadata => "",
        }
    }
}

#[derive(Debug, Clone)]
struct LocalFile {
    path: PathBuf,
    stats: FileStats,
    kind: FileKind,
}

fn is_result_file(filename: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Prot.*\.xlsx").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(filename))
}

/// 对文件名分类；无法识别的文件返回 `None`
fn classify(filename: &str, project: &str, blank_glob: &str) -> Option<FileKind> {
    let lower = filename.to_lowercase();
    let extension = Path::new(&lower)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_string();

    match extension.as_str() {
        "raw" if glob_matches(blank_glob, &lower) => Some(FileKind::Blank),
        "raw" => Some(FileKind::Sample),
        "meth" | "sld" => Some(FileKind::Other),
        _ if is_result_file(filename) => Some(FileKind::Result),
        _ if lower == "metadata.xlsx"
            || lower == format!("{}_metadata.xlsx", project.to_lowercase()) =>
        {
            Some(FileKind::Metadata)
        }
        _ => None,
    }
}

/// 远端相对路径；结果与元数据文件名转为小写
fn destination_key(kind: FileKind, filename: &str) -> String {
    let filename = match kind {
        FileKind::Result | FileKind::Metadata => filename.to_lowercase(),
        _ => filename.to_string(),
    };

    join_url([kind.folder(), filename.as_str()])
}

pub async fn run(args: &ProteomicsArgs) -> Result<()> {
    let Some(_lock) = PidLock::acquire(&args.common.pid_file(COMMAND))? else {
        return Ok(());
    };

    let main_folder = absolute(&args.main_folder)?;
    info!("同步 '{}' 中的 *.raw 文件", main_folder.display());

    let client = args.common.create_client()?;
    let mut state = args.common.open_state(COMMAND)?;

    let result = with_session(
        client.as_ref(),
        sync_projects(args, &main_folder, client.as_ref(), &mut state),
    )
    .await;

    let saved = state.save(false);
    result?;
    saved?;

    Ok(())
}

async fn sync_projects(
    args: &ProteomicsArgs,
    main_folder: &Path,
    client: &dyn TransferClient,
    state: &mut PersistentState,
) -> Result<()> {
    login(client, &args.common.retry_policy()).await?;

    for src_dir in glob_folder(main_folder, &args.project_glob)? {
        if !src_dir.is_dir() {
            info!("跳过非项目目录 '{}'", src_dir.display());
            continue;
        }

        sync_project(args, client, state, &src_dir).await?;
    }

    Ok(())
}

async fn sync_project(
    args: &ProteomicsArgs,
    client: &dyn TransferClient,
    state: &mut PersistentState,
    src_dir: &Path,
) -> Result<()> {
    let project = src_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_uppercase())
        .unwrap_or_default();
    let root_url = join_url([
        args.common.destination_url(&args.destination),
        quote_path(&project),
    ]);

    info!("同步 '{}' 到 {:?}", src_dir.display(), root_url);

    // 1. 收集并分类本地文件
    let Some(files) = collect_local_files(src_dir, &project, args)? else {
        return Ok(());
    };

    // 2. 与缓存比较，找出新增或修改的文件
    let updated: BTreeMap<&String, &LocalFile> = files
        .iter()
        .filter(|(_, file)| match state.get_file_stats(&file.path) {
            Some(cached) => !file.stats.matches(&cached, MatchOptions::OPTIONAL_HASH),
            None => true,
        })
        .collect();

    if updated.is_empty() {
        info!("'{}' 中没有更新的文件，跳过", src_dir.display());
        return Ok(());
    }

    info!("发现 {} 个新增或修改的文件（共 {} 个）:", updated.len(), files.len());
    for (idx, key) in updated.keys().enumerate() {
        info!("  {}. {}", idx + 1, key);
    }

    // 3. 上传
    let file_map = updated
        .iter()
        .map(|(key, file)| (key.to_string(), file.path.clone()))
        .collect();
    let mut task = CheckedMultiCopy::new(file_map, root_url.clone()).timeout(args.common.timeout());

    let tries = task.execute(client, args.common.retry_times).await?;
    if tries == 0 {
        error!("任务 {} 失败", task);
        return Ok(());
    }

    state.update_file_stats(task.filestats());

    // 4. 记录结果与元数据的上传
    let results_updated = updated.values().any(|f| f.kind == FileKind::Result);
    let metadata_updated = updated.values().any(|f| f.kind == FileKind::Metadata);
    {
        let mut run = state.get_proteomics_run(&project);
        if results_updated {
            run.set_results_synced();
        }
        if metadata_updated {
            run.set_metadata_synced();
        }
    }

    // 5. 结果与元数据齐全且有更新时写入完成标记
    let has_results = files.values().any(|f| f.kind == FileKind::Result);
    let has_metadata = files.values().any(|f| f.kind == FileKind::Metadata);
    if has_results && has_metadata && (results_updated || metadata_updated) {
        let mut marker = Write::new(join_url([root_url.as_str(), READY_MARKER]), iso_now())
            .timeout(args.common.timeout());

        if marker.execute(client, tries).await? == 0 {
            error!("任务 {} 失败", marker);
            return Ok(());
        }

        state.get_proteomics_run(&project).set_flag_synced();
    }

    info!("'{}' 同步完成", src_dir.display());
    Ok(())
}

/// 收集项目目录中足够旧的文件，映射为远端相对路径
///
/// 两个文件映射到同一路径时记录 ERROR 并返回 `None`。
fn collect_local_files(
    src_dir: &Path,
    project: &str,
    args: &ProteomicsArgs,
) -> Result<Option<BTreeMap<String, LocalFile>>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(src_dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    let min_age = args.min_file_age as f64;
    let mut result: BTreeMap<String, LocalFile> = BTreeMap::new();

    for path in entries {
        if !path.is_file() {
            info!("跳过目录 '{}'", path.display());
            continue;
        }

        let stats = FileStats::from_path(&path)?;
        if stats.age().unwrap_or(0.0) < min_age {
            info!("跳过最近修改的文件 '{}'", path.display());
            continue;
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(kind) = classify(&filename, project, &args.blank_glob) else {
            info!("跳过文件 '{}'", path.display());
            continue;
        };

        let key = destination_key(kind, &filename);
        if let Some(existing) = result.get(&key) {
            error!(
                "'{}' 中有多个文件映射到 '{}': '{}' 和 '{}'",
                src_dir.display(),
                key,
                existing.path.display(),
                path.display()
            );
            return Ok(None);
        }

        result.insert(key, LocalFile { path, stats, kind });
    }

    Ok(Some(result))
}
