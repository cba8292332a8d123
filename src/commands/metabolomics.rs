//! 代谢组数据集同步
//!
//! 主目录下的 `DataProcessingMethod_<name>` 保存数据处理方法，
//! `RawData_<name>/<数字>` 保存各次运行。每次运行连同方法文件一起上传到
//! `<destination>/<name>/<run>`，所有运行共享同一个重试预算。

use super::common::{absolute, login, CommonArgs, PidLock};
use crate::core::file_state::{FileStats, MatchOptions};
use crate::core::state::PersistentState;
use crate::core::task::{CheckedMultiCopy, Task};
use crate::storage::{join_url, quote_path, with_session, TransferClient};
use anyhow::{Context, Result};
use clap::Args;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const COMMAND: &str = "metabolomics";

const PREFIX_RAW_DATA: &str = "RawData";
const PREFIX_METHODS: &str = "DataProcessingMethod";

#[derive(Debug, Clone, Args)]
pub struct MetabolomicsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// 包含数据集目录的主目录
    #[arg(long)]
    pub main_folder: PathBuf,

    /// 远端目标目录
    #[arg(long, default_value = "/")]
    pub destination: String,

    /// 文件最后修改后至少等待的秒数
    #[arg(long, default_value_t = 60 * 60)]
    pub min_file_age: u64,
}

/// 一个数据集：方法目录与若干运行目录
#[derive(Debug, Default)]
struct Dataset {
    methods: Option<PathBuf>,
    runs: Vec<PathBuf>,
}

/// 远端相对路径 -> 本地文件
type FileMap = BTreeMap<String, PathBuf>;

pub async fn run(args: &MetabolomicsArgs) -> Result<()> {
    let Some(_lock) = PidLock::acquire(&args.common.pid_file(COMMAND))? else {
        return Ok(());
    };

    let main_folder = absolute(&args.main_folder)?;
    let client = args.common.create_client()?;
    let mut state = args.common.open_state(COMMAND)?;

    let result = with_session(
        client.as_ref(),
        sync_datasets(args, &main_folder, client.as_ref(), &mut state),
    )
    .await;

    let saved = state.save(false);
    result?;
    saved?;

    Ok(())
}

async fn sync_datasets(
    args: &MetabolomicsArgs,
    main_folder: &Path,
    client: &dyn TransferClient,
    state: &mut PersistentState,
) -> Result<()> {
    login(client, &args.common.retry_policy()).await?;

    let root_url = args.common.destination_url(&args.destination);
    let min_age = args.min_file_age as f64;
    let mut tries = args.common.retry_times;

    info!("在 '{}' 中查找代谢组数据集", main_folder.display());
    let datasets = collect_datasets(state, main_folder)?;

    info!("上传运行与方法文件");
    for (name, dataset) in &datasets {
        let Some(methods) = &dataset.methods else {
            continue;
        };

        // 方法文件由同一数据集的所有运行共享
        let (method_files, method_updated) =
            collect_method_files(state, methods, min_age, "")?;

        for runpath in &dataset.runs {
            let run_name = runpath
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut run_files = collect_run_files(state, runpath, min_age)?;
            if !method_updated && run_files.is_empty() {
                continue;
            }

            info!("上传 '{}/{}' 的文件", name, run_name);
            run_files.extend(method_files.clone());

            let dst_url = join_url([root_url.as_str(), &quote_path(name), &quote_path(&run_name)]);
            let mut task = CheckedMultiCopy::new(run_files, dst_url).timeout(args.common.timeout());

            info!("执行任务 {}", task);
            tries = task.execute(client, tries).await?;
            if tries == 0 {
                error!("任务 {} 失败", task);
                return Ok(());
            }

            state.update_file_stats(task.filestats());
        }
    }

    Ok(())
}

/// 按数据集名称归类主目录下的方法目录与运行目录；缺少任一部分的数据集被跳过
fn collect_datasets(
    state: &mut PersistentState,
    main_folder: &Path,
) -> Result<BTreeMap<String, Dataset>> {
    let mut datasets: BTreeMap<String, Dataset> = BTreeMap::new();

    for entry in fs::read_dir(main_folder)
        .with_context(|| format!("读取主目录失败: {}", main_folder.display()))?
    {
        let src_dir = entry?.path();
        let dirname = src_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !src_dir.is_dir() {
            warn!("主目录中存在非目录条目: {:?}", dirname);
            continue;
        }

        let Some((key, name)) = dirname.split_once('_') else {
            warn!("主目录中存在命名不规范的目录: {:?}", dirname);
            continue;
        };

        let dataset = datasets.entry(name.to_string()).or_default();
        match key {
            PREFIX_METHODS => {
                info!("找到数据集 {:?} 的方法目录", name);
                dataset.methods = Some(src_dir.clone());
            }
            PREFIX_RAW_DATA => {
                info!("找到数据集 {:?} 的原始数据目录", name);
                let mut runs = Vec::new();
                for run in fs::read_dir(&src_dir)? {
                    let path = run?.path();
                    let run_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();

                    if path.is_dir() && !run_name.is_empty() && run_name.bytes().all(|b| b.is_ascii_digit()) {
                        info!("找到 {:?} 的运行目录: {:?}", name, run_name);
                        runs.push(path);
                    } else {
                        warn!("{:?} 中存在意外的条目: {:?}", name, run_name);
                    }
                }
                runs.sort();
                dataset.runs.extend(runs);
            }
            _ => warn!("主目录中存在意外的目录: {:?}", dirname),
        }

        state.get_metabolomics_run(name);
    }

    datasets.retain(|name, dataset| {
        let complete = dataset.methods.is_some() && !dataset.runs.is_empty();
        if !complete {
            warn!("数据集 {:?} 不完整，跳过", name);
        }
        complete
    });

    Ok(datasets)
}

/// 递归收集方法文件，键保留相对布局；同时返回是否有文件更新
fn collect_method_files(
    state: &PersistentState,
    dirpath: &Path,
    min_age: f64,
    prefix: &str,
) -> Result<(FileMap, bool)> {
    let mut files = FileMap::new();
    let mut updated = false;

    for entry in fs::read_dir(dirpath)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = join_url([prefix, name.as_str()]);

        if path.is_file() {
            updated |= is_file_updated(state, &path, min_age)?;
            files.insert(key, path);
        } else if path.is_dir() {
            let (nested, nested_updated) = collect_method_files(state, &path, min_age, &key)?;
            files.extend(nested);
            updated |= nested_updated;
        } else {
            warn!("意外的非文件条目: '{}'", path.display());
        }
    }

    Ok((files, updated))
}

/// 收集运行目录中更新过的文件；含 `.raw` 文件的运行放在 `raw/` 下，否则放在 `mzML/` 下
fn collect_run_files(state: &PersistentState, dirpath: &Path, min_age: f64) -> Result<FileMap> {
    let mut updated_files = Vec::new();
    let mut is_raw_data = false;

    for entry in fs::read_dir(dirpath)? {
        let path = entry?.path();
        if !path.is_file() {
            warn!("意外的非文件条目: '{}'", path.display());
            continue;
        }

        // 原始文件需要在远端进一步处理
        if path.extension().is_some_and(|ext| ext == "raw") {
            is_raw_data = true;
        }

        // 只返回更新过的文件，避免重复计算所有原始文件的哈希
        if is_file_updated(state, &path, min_age)? {
            updated_files.push(path);
        }
    }

    let root = if is_raw_data { "raw" } else { "mzML" };
    Ok(updated_files
        .into_iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (join_url([root, name.as_str()]), path)
        })
        .collect())
}

fn is_file_updated(state: &PersistentState, path: &Path, min_age: f64) -> Result<bool> {
    let current = FileStats::from_path(path)?;
    if let Some(cached) = state.get_file_stats(path) {
        if cached.matches(&current, MatchOptions::OPTIONAL_HASH) {
            return Ok(false);
        }
    }

    if current.age().unwrap_or(0.0) < min_age {
        warn!("跳过最近修改的文件 '{}'", path.display());
        return Ok(false);
    }

    Ok(true)
}
