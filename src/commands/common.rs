//! 子命令共享的参数、客户端构造与进程锁

use crate::config::{default_path, expand_home, find_executable, read_credentials};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::core::state::{PersistentState, DEFAULT_MAX_BACKUPS};
use crate::core::TRIES;
use crate::storage::command::{EXECUTABLE, LOG_LEVELS};
use crate::storage::{join_url, quote_path, CommandClient, LocalStore, TransferClient};
use anyhow::{Context, Result};
use clap::builder::PossibleValuesParser;
use clap::Args;
use regex::RegexBuilder;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 所有子命令共享的参数
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// 从 JSON 文件读取命令行参数（键名为参数名的 snake_case 形式）
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 最大重试次数
    #[arg(long, default_value_t = TRIES)]
    pub retry_times: u32,

    /// 计算文件哈希的超时时间（秒）
    #[arg(long, default_value_t = 300.0, value_parser = parse_timeout)]
    pub timeout: f64,

    /// PID 文件路径 [默认: ~/.labsync/<command>.pid]
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// 持久化状态文件路径 [默认: ~/.labsync/<command>.db]
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// 保留的状态文件备份数量
    #[arg(long, default_value_t = DEFAULT_MAX_BACKUPS)]
    pub max_backups: usize,

    /// 追加写入日志文件；超过 1MB 时轮转
    #[arg(long, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,

    /// 最低日志级别
    #[arg(
        long,
        default_value = "INFO",
        value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"],
        ignore_case = true,
        help_heading = "Logging"
    )]
    pub log_level: String,

    /// 传输工具日志目录
    #[arg(long, help_heading = "Logging")]
    pub transfer_logs: Option<PathBuf>,

    /// 传输工具的最低日志级别
    #[arg(
        long,
        default_value = "WARNING",
        value_parser = PossibleValuesParser::new(LOG_LEVELS),
        ignore_case = true,
        help_heading = "Logging"
    )]
    pub transfer_log_level: String,

    #[arg(long, help_heading = "Azure")]
    pub tenant_id: String,

    #[arg(long, help_heading = "Azure")]
    pub application_id: String,

    /// 存储账户名
    #[arg(long, help_heading = "Azure")]
    pub storage_account: String,

    #[arg(long, help_heading = "Azure")]
    pub container_name: String,

    /// 保存客户端密钥的明文文件
    #[arg(long, default_value = "credentials.txt", help_heading = "Azure")]
    pub credentials: PathBuf,

    /// 传输工具可执行文件
    #[arg(long, default_value = EXECUTABLE, help_heading = "Azure")]
    pub executable: PathBuf,

    /// 使用本地目录代替云存储（离线演练）
    #[arg(long, help_heading = "Azure")]
    pub local_store: Option<PathBuf>,
}

impl CommonArgs {
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn pid_file(&self, command: &str) -> PathBuf {
        self.pid_file
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| default_path(command, "pid"))
    }

    pub fn state_file(&self, command: &str) -> PathBuf {
        self.state_file
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| default_path(command, "db"))
    }

    /// 容器根 URL
    pub fn container_url(&self) -> String {
        join_url([
            format!("https://{}.blob.core.windows.net", self.storage_account),
            quote_path(&self.container_name),
        ])
    }

    /// 容器下 `destination` 目录的 URL
    pub fn destination_url(&self, destination: &str) -> String {
        join_url([self.container_url(), quote_path(destination)])
    }

    pub fn open_state(&self, command: &str) -> Result<PersistentState> {
        let path = self.state_file(command);
        PersistentState::open(&path, self.max_backups)
            .with_context(|| format!("加载状态文件失败: {}", path.display()))
    }

    /// 登录失败时的重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_times.max(1), Duration::from_secs(5))
    }

    /// 检查运行前提；发现问题时记录 ERROR 并返回 false
    pub fn validate(&self) -> bool {
        let mut ok = true;

        for (name, value) in [
            ("tenant ID", &self.tenant_id),
            ("application ID", &self.application_id),
            ("storage account", &self.storage_account),
            ("container name", &self.container_name),
        ] {
            if value.trim().is_empty() {
                error!("未指定 {}", name);
                ok = false;
            }
        }

        if self.local_store.is_some() {
            return ok;
        }

        if find_executable(&self.executable).is_none() {
            error!("在 PATH 中找不到传输工具 {:?}", self.executable);
            ok = false;
        }

        if !self.credentials.exists() {
            error!("凭据文件不存在: '{}'", self.credentials.display());
            ok = false;
        }

        ok
    }

    /// 创建传输客户端
    pub fn create_client(&self) -> Result<Box<dyn TransferClient>> {
        if let Some(root) = &self.local_store {
            info!("使用本地目录 '{}' 代替云存储", root.display());
            let store = LocalStore::new(expand_home(root), &self.container_url())?;
            return Ok(Box::new(store));
        }

        info!("从 '{}' 读取凭据", self.credentials.display());
        let secret = read_credentials(&self.credentials)?;

        let mut client = CommandClient::new(&self.tenant_id, &self.application_id, &secret)?
            .with_executable(&self.executable);
        client.set_log_level(&self.transfer_log_level)?;

        if let Some(dir) = &self.transfer_logs {
            fs::create_dir_all(dir)
                .with_context(|| format!("创建传输日志目录失败: {}", dir.display()))?;
            client = client.with_log_location(dir);
        }

        Ok(Box::new(client))
    }
}

/// 登录，对临时性失败按策略重试
pub async fn login(client: &dyn TransferClient, policy: &RetryPolicy) -> Result<()> {
    with_retry("login", policy, || client.login()).await?;
    Ok(())
}

/// 基于 PID 文件的进程锁，释放时删除文件
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// 获取锁；已被存活进程持有时返回 `None`
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    debug!("获取进程锁: {}", path.display());
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());

                    match holder {
                        Some(pid) if process_alive(pid) => {
                            warn!("进程已在运行 (pid {}): {}", pid, path.display());
                            return Ok(None);
                        }
                        _ => {
                            warn!("删除过期的进程锁: {}", path.display());
                            fs::remove_file(path)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!("无法获取进程锁: {}", path.display());
        Ok(None)
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("删除进程锁失败 {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// 不区分大小写的文件名通配（`*`、`?` 与 `[...]`）
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    class.push(c);
                }

                if closed {
                    regex.push('[');
                    if let Some(rest) = class.strip_prefix('!') {
                        regex.push('^');
                        regex.push_str(&rest.replace('\\', "\\\\"));
                    } else {
                        regex.push_str(&class.replace('\\', "\\\\"));
                    }
                    regex.push(']');
                } else {
                    regex.push_str(&regex::escape(&format!("[{}", class)));
                }
            }
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');

    RegexBuilder::new(&regex)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

/// 列出目录下名称匹配通配的条目（不递归），按名称排序
pub fn glob_folder(dirpath: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let mut result = Vec::new();
    for entry in fs::read_dir(dirpath)
        .with_context(|| format!("读取目录失败: {}", dirpath.display()))?
    {
        let entry = entry?;
        if glob_matches(pattern, &entry.file_name().to_string_lossy()) {
            result.push(entry.path());
        }
    }

    result.sort();
    Ok(result)
}

/// 相对路径基于当前目录转为绝对路径（状态文件以绝对路径为键）
pub fn absolute(path: &Path) -> Result<PathBuf> {
    let path = expand_home(path);
    if path.is_absolute() {
        return Ok(path);
    }

    Ok(std::env::current_dir()?.join(path))
}

/// 超时秒数必须是可以表示为 `Duration` 的非负有限值
fn parse_timeout(value: &str) -> std::result::Result<f64, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", value))?;

    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("timeout must be a non-negative finite number, got {}", value));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| format!("timeout too large: {}", value))?;

    Ok(secs)
}

/// 当前本地时间的 ISO 8601 字符串（完成标记内容）
pub fn iso_now() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        common: CommonArgs,
    }

    fn parse(extra: &[&str]) -> CommonArgs {
        let mut args = vec![
            "test",
            "--tenant-id",
            "t",
            "--application-id",
            "a",
            "--storage-account",
            "acct",
            "--container-name",
            "my data",
        ];
        args.extend_from_slice(extra);
        TestCli::parse_from(args).common
    }

    #[test]
    fn test_defaults() {
        let common = parse(&[]);
        assert_eq!(common.retry_times, 5);
        assert_eq!(common.timeout(), Duration::from_secs(300));
        assert_eq!(common.transfer_log_level, "WARNING");
        assert_eq!(common.executable, PathBuf::from(EXECUTABLE));
        assert!(common.pid_file("ngs").ends_with(".labsync/ngs.pid"));
        assert!(common.state_file("ngs").ends_with(".labsync/ngs.db"));
    }

    #[test]
    fn test_timeout_rejects_unrepresentable_values() {
        assert_eq!(parse(&["--timeout", "0.5"]).timeout(), Duration::from_millis(500));
        assert_eq!(parse(&["--timeout", "0"]).timeout(), Duration::ZERO);

        for bad in ["inf", "NaN", "-1", "1e30", "soon"] {
            let args = [
                "test",
                "--tenant-id",
                "t",
                "--application-id",
                "a",
                "--storage-account",
                "acct",
                "--container-name",
                "c",
                "--timeout",
                bad,
            ];
            assert!(TestCli::try_parse_from(args).is_err(), "{} accepted", bad);
        }

        // 绕过解析器构造的值也不会崩溃
        let mut common = parse(&[]);
        common.timeout = f64::INFINITY;
        assert_eq!(common.timeout(), Duration::MAX);
        common.timeout = f64::NAN;
        assert_eq!(common.timeout(), Duration::ZERO);
    }

    #[test]
    fn test_urls() {
        let common = parse(&[]);
        assert_eq!(
            common.container_url(),
            "https://acct.blob.core.windows.net/my%20data"
        );
        assert_eq!(common.destination_url("/"), common.container_url());
        assert_eq!(
            common.destination_url("runs/2024"),
            "https://acct.blob.core.windows.net/my%20data/runs/2024"
        );
    }

    #[test]
    fn test_validate_blank_ids() {
        let mut common = parse(&["--local-store", "/tmp/store"]);
        assert!(common.validate());
        common.tenant_id = " ".to_string();
        assert!(!common.validate());
    }

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("prot[0-9]*", "PROT123"));
        assert!(!glob_matches("prot[0-9]*", "protein"));
        assert!(glob_matches("blank*.raw", "Blank_01.RAW"));
        assert!(!glob_matches("blank*.raw", "sample.raw"));
        assert!(glob_matches("a?c", "abc"));
        assert!(glob_matches("[!x]y", "zy"));
    }

    #[test]
    fn test_pid_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks/test.pid");

        let lock = PidLock::acquire(&path).unwrap().unwrap();
        assert!(path.exists());
        assert!(PidLock::acquire(&path).unwrap().is_none());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_lock_replaces_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        fs::write(&path, "not a pid").unwrap();

        assert!(PidLock::acquire(&path).unwrap().is_some());
    }
}
