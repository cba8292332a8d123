//! 测序运行目录同步
//!
//! 主目录下每个子目录是一个运行；运行完成（存在完成标记文件且已静置足够时间）
//! 后整体同步，校验通过后写入远端 `.sync` 标记，可选删除本地源数据。

use super::common::{absolute, iso_now, login, CommonArgs, PidLock};
use crate::core::file_state::FileStats;
use crate::core::state::PersistentState;
use crate::core::task::{CheckedCopy, CheckedSync, RemoveLocal, Task, Write};
use crate::core::engine;
use crate::storage::{join_url, quote_path, with_session, TransferClient};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const COMMAND: &str = "ngs";

const SAMPLESHEET: &str = "SampleSheet.csv";

/// 未完成的运行超过该时长（秒）后告警，之后每隔同样时长重复告警
const STALE_AFTER_SECS: f64 = 48.0 * 60.0 * 60.0;

#[derive(Debug, Clone, Args)]
pub struct NgsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// 主目录；其中每个子目录单独同步
    #[arg(long)]
    pub main_folder: PathBuf,

    /// 样本表目录，包含与运行目录同名的 X.csv
    #[arg(long)]
    pub samplesheet_folder: Option<PathBuf>,

    /// 远端目标目录
    #[arg(long, default_value = "/")]
    pub destination: String,

    /// 只有包含该文件的运行目录才会同步
    #[arg(long)]
    pub completion_flag: PathBuf,

    /// 运行目录最后修改后至少等待的秒数
    #[arg(long, default_value_t = 60 * 60)]
    pub completion_delay: u64,

    /// 同步成功后删除本地运行目录
    #[arg(long)]
    pub remove_source: bool,
}

pub async fn run(args: &NgsArgs) -> Result<()> {
    let Some(_lock) = PidLock::acquire(&args.common.pid_file(COMMAND))? else {
        return Ok(());
    };

    let main_folder = absolute(&args.main_folder)?;
    info!("同步 '{}' 中的运行目录", main_folder.display());

    let client = args.common.create_client()?;
    let mut state = args.common.open_state(COMMAND)?;

    let result = with_session(
        client.as_ref(),
        sync_runs(args, &main_folder, client.as_ref(), &mut state),
    )
    .await;

    if result.is_ok() {
        report_stale_runs(&mut state);
    }

    let saved = state.save(false);
    result?;
    saved?;

    Ok(())
}

async fn sync_runs(
    args: &NgsArgs,
    main_folder: &Path,
    client: &dyn TransferClient,
    state: &mut PersistentState,
) -> Result<()> {
    login(client, &args.common.retry_policy()).await?;

    let samplesheet_folder = args
        .samplesheet_folder
        .as_deref()
        .map(absolute)
        .transpose()?;

    for name in collect_runs(main_folder, samplesheet_folder.as_deref())? {
        if state.get_ngs_run(&name).is_synced() {
            info!("跳过已同步的运行 {:?}", name);
            continue;
        }

        info!("处理运行 {:?}", name);
        let dst_url = join_url([
            args.common.destination_url(&args.destination),
            quote_path(&name),
        ]);

        sync_run(
            args,
            client,
            state,
            &name,
            &main_folder.join(&name),
            samplesheet_folder.as_deref(),
            &dst_url,
        )
        .await?;
    }

    Ok(())
}

/// 收集运行名：主目录下的子目录，以及样本表目录中的 `X.csv`
fn collect_runs(main_folder: &Path, samplesheet_folder: Option<&Path>) -> Result<Vec<String>> {
    let mut runs = BTreeSet::new();

    for entry in fs::read_dir(main_folder)
        .with_context(|| format!("读取主目录失败: {}", main_folder.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            warn!("源目录中存在意外的文件: '{}'", path.display());
            continue;
        }

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            runs.insert(name.to_string());
        }
    }

    if let Some(folder) = samplesheet_folder {
        for entry in fs::read_dir(folder)
            .with_context(|| format!("读取样本表目录失败: {}", folder.display()))?
        {
            let path = entry?.path();
            let is_csv = path.extension().is_some_and(|ext| ext == "csv");
            if !(path.is_file() && is_csv) {
                warn!("样本表目录中存在意外的条目: '{}'", path.display());
                continue;
            }

            if let Some(stem) = path.file_stem().and_then(|n| n.to_str()) {
                runs.insert(stem.to_string());
            }
        }
    }

    Ok(runs.into_iter().collect())
}

#[allow(clippy::too_many_arguments)]
async fn sync_run(
    args: &NgsArgs,
    client: &dyn TransferClient,
    state: &mut PersistentState,
    name: &str,
    src_dir: &Path,
    samplesheet_folder: Option<&Path>,
    dst_url: &str,
) -> Result<()> {
    let (data_synced, sheet_synced, flag_synced) = {
        let run = state.get_ngs_run(name);
        (run.is_data_synced(), run.is_sheet_synced(), run.is_flag_synced())
    };

    let mut tasks: Vec<Box<dyn Task>> = Vec::new();

    let data_scheduled = !data_synced && schedule_data_sync(args, src_dir, dst_url, &mut tasks)?;
    let has_data = data_synced || data_scheduled;

    let has_sheet = sheet_synced
        || schedule_samplesheet(
            args,
            name,
            src_dir,
            samplesheet_folder,
            dst_url,
            data_synced,
            data_scheduled,
            &mut tasks,
        );

    // 远端 .sync 标记表示数据已完整同步
    if has_data && !flag_synced {
        tasks.push(Box::new(
            Write::new(format!("{}.sync", dst_url), iso_now()).timeout(args.common.timeout()),
        ));
    }

    if has_data && args.remove_source && src_dir.exists() {
        tasks.push(Box::new(RemoveLocal::new(src_dir)));
    }

    if tasks.is_empty() {
        debug!("运行 {:?} 没有需要执行的任务", name);
        return Ok(());
    }

    if engine::execute(client, &mut tasks, args.common.retry_times).await? {
        let mut run = state.get_ngs_run(name);
        if has_data {
            run.set_data_synced();
            run.set_flag_synced();
        }
        if has_sheet {
            run.set_sheet_synced();
        }
    }

    Ok(())
}

/// 运行目录包含完成标记且静置足够时间后，安排整体同步
fn schedule_data_sync(
    args: &NgsArgs,
    src_dir: &Path,
    dst_url: &str,
    tasks: &mut Vec<Box<dyn Task>>,
) -> Result<bool> {
    let flag_file = src_dir.join(&args.completion_flag);
    if !flag_file.exists() {
        info!("标记文件 '{}' 不存在", flag_file.display());
        info!("数据目录尚未完成，跳过");
        return Ok(false);
    }

    let min_age = args.completion_delay as f64;
    for entry in fs::read_dir(src_dir)? {
        let path = entry?.path();
        let age = FileStats::from_path(&path)?.age().unwrap_or(0.0);
        if age < min_age {
            info!("数据目录刚刚完成，跳过");
            return Ok(false);
        }
    }

    tasks.push(Box::new(
        CheckedSync::new(src_dir, dst_url).timeout(args.common.timeout()),
    ));
    Ok(true)
}

/// 安排样本表复制，返回本次运行结束后样本表是否会在远端
///
/// 未指定样本表目录时，样本表随数据目录一起同步；数据已同步而样本表缺失时单独补传。
#[allow(clippy::too_many_arguments)]
fn schedule_samplesheet(
    args: &NgsArgs,
    name: &str,
    src_dir: &Path,
    samplesheet_folder: Option<&Path>,
    dst_url: &str,
    data_synced: bool,
    data_scheduled: bool,
    tasks: &mut Vec<Box<dyn Task>>,
) -> bool {
    let samplesheet = match samplesheet_folder {
        Some(folder) => folder.join(format!("{}.csv", name)),
        None if data_scheduled => return src_dir.join(SAMPLESHEET).exists(),
        None if !data_synced => return false,
        None => src_dir.join(SAMPLESHEET),
    };

    if !samplesheet.exists() {
        warn!("找不到样本表 '{}'", samplesheet.display());
        return false;
    }

    tasks.push(Box::new(
        CheckedCopy::new(samplesheet, join_url([dst_url, SAMPLESHEET]))
            .timeout(args.common.timeout()),
    ));
    true
}

/// 对长时间未完成的运行记录 ERROR，并更新告警时间
fn report_stale_runs(state: &mut PersistentState) {
    let incomplete = state.ngs_runs().filter(|(_, run)| !run.is_synced()).count();
    if incomplete == 0 {
        return;
    }

    info!("检查 {} 个未完成的运行是否过期", incomplete);
    let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;

    for (name, mut run) in state.ngs_runs() {
        if run.is_synced() {
            continue;
        }

        let last = run.warned().unwrap_or_else(|| run.observed());
        if now - last <= STALE_AFTER_SECS {
            debug!("运行 {:?} 最近已告警，跳过", name);
            continue;
        }

        if !run.is_data_synced() {
            error!("旧测序运行 {:?} 的数据从未同步", name);
        }
        if !run.is_sheet_synced() {
            error!("旧测序运行 {:?} 的样本表从未同步", name);
        }
        if run.is_data_synced() && run.is_sheet_synced() && !run.is_flag_synced() {
            error!("测序运行 {:?} 尚未标记为完成", name);
        }

        run.set_warned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_runs_merges_samplesheets() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main");
        let sheets = dir.path().join("sheets");
        fs::create_dir_all(main.join("run_b")).unwrap();
        fs::create_dir_all(main.join("run_a")).unwrap();
        fs::write(main.join("stray.txt"), b"x").unwrap();
        fs::create_dir_all(&sheets).unwrap();
        fs::write(sheets.join("run_c.csv"), b"x").unwrap();
        fs::write(sheets.join("run_a.csv"), b"x").unwrap();
        fs::write(sheets.join("notes.txt"), b"x").unwrap();

        assert_eq!(
            collect_runs(&main, Some(&sheets)).unwrap(),
            vec!["run_a", "run_b", "run_c"]
        );
        assert_eq!(collect_runs(&main, None).unwrap(), vec!["run_a", "run_b"]);
    }

    #[test]
    fn test_stale_runs_are_warned_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ngs.db");
        let old = Utc::now().timestamp() as f64 - 3.0 * STALE_AFTER_SECS;
        fs::write(
            &path,
            format!(
                r#"{{"ngs": {{"old": {{"observed": {old}}}, "new": {{"observed": 1e12}}}}}}"#
            ),
        )
        .unwrap();

        let mut state = PersistentState::open(&path, 3).unwrap();
        report_stale_runs(&mut state);

        assert!(state.get_ngs_run("old").warned().is_some());
        assert!(state.get_ngs_run("new").warned().is_none());
    }
}
