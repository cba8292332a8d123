//! 外部传输工具适配器
//!
//! 通过子进程调用传输工具，解析其输出中的哈希记录与错误码，并把失败归一化为
//! `TransferError`。

use super::url::normalize_key;
use super::{RemoteListing, RemoteLookup, TransferClient};
use crate::core::file_state::FileStats;
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, info, warn, Level};

/// 默认可执行文件名
pub const EXECUTABLE: &str = "azure-storage-azcopy";

/// 传输工具支持的日志级别
pub const LOG_LEVELS: [&str; 7] = ["NONE", "DEBUG", "INFO", "WARNING", "ERROR", "PANIC", "FATAL"];

/// 登录密钥通过该环境变量传给传输工具
const SECRET_ENV: &str = "AZCOPY_SPA_CLIENT_SECRET";

/// 传输工具日志目录通过该环境变量指定
const LOG_LOCATION_ENV: &str = "AZCOPY_LOG_LOCATION";

/// 哈希记录行前缀：`MD5: <hash>\t<size>\t<path>`
const MD5_PREFIX: &str = "MD5: ";

const BLOB_NOT_FOUND: &str = "BlobNotFound";
const NOT_AUTHENTICATED_MSG: &str =
    "no SAS token or OAuth token is present and the resource is not public";

fn error_code(line: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"X-Ms-Error-Code: \[(\w+)\]").ok())
        .as_ref()?;
    re.captures(line).map(|caps| caps[1].to_string())
}

/// 从工具输出中识别出的诊断信息
#[derive(Debug, Clone, PartialEq, Eq)]
enum Diagnostic {
    NotAuthenticated,
    Code(String),
}

impl Diagnostic {
    fn into_error(self, subject: &str) -> TransferError {
        match self {
            Diagnostic::NotAuthenticated => TransferError::NotAuthenticated,
            Diagnostic::Code(code) if code == BLOB_NOT_FOUND => {
                TransferError::FileNotFound(subject.to_string())
            }
            Diagnostic::Code(code) => TransferError::Remote(code),
        }
    }
}

/// 一次命令调用的解析结果
#[derive(Debug, Default)]
struct CommandOutput {
    /// 带响应前缀的行
    responses: Vec<String>,
    /// 其余输出，写入日志
    log_lines: Vec<String>,
    diagnostic: Option<Diagnostic>,
}

fn parse_output(raw: &[u8], response_prefix: Option<&str>) -> CommandOutput {
    let mut output = CommandOutput::default();

    for line in raw.split(|b| *b == b'\n') {
        // 进度行以 \r 开头，直接丢弃
        if line.starts_with(b"\r") {
            continue;
        }

        let line = String::from_utf8_lossy(line);
        if let Some(code) = error_code(&line) {
            output.diagnostic = Some(Diagnostic::Code(code));
        } else if line.contains(NOT_AUTHENTICATED_MSG) {
            output.diagnostic = Some(Diagnostic::NotAuthenticated);
        }

        let line = line.trim();
        match response_prefix {
            Some(prefix) if line.starts_with(prefix) => output.responses.push(line.to_string()),
            _ if !line.is_empty() => output.log_lines.push(line.to_string()),
            _ => {}
        }
    }

    output
}

/// 解析一行哈希记录；空哈希保留为空字符串而不是通配
fn parse_md5_line(line: &str) -> Result<(String, FileStats)> {
    let body = line.strip_prefix(MD5_PREFIX).unwrap_or(line);
    let mut fields = body.splitn(3, '\t').map(str::trim);

    let (hash, size, filename) = match (fields.next(), fields.next(), fields.next()) {
        (Some(hash), Some(size), Some(filename)) => (hash, size, filename),
        _ => return Err(TransferError::Protocol(format!("malformed hash record {:?}", line))),
    };

    let size = size
        .parse::<u64>()
        .map_err(|_| TransferError::Protocol(format!("invalid size in hash record {:?}", line)))?;

    Ok((
        normalize_key(filename),
        FileStats::remote(hash.to_uppercase(), size),
    ))
}

fn log_line(level: Level, op: &str, line: &str) {
    match level {
        Level::WARN => warn!(op, "{}", line),
        _ => debug!(op, "{}", line),
    }
}

/// 调用外部传输工具的客户端
pub struct CommandClient {
    executable: PathBuf,
    tenant_id: String,
    app_id: String,
    secret: String,
    log_level: Option<String>,
    log_location: Option<PathBuf>,
    logged_in: AtomicBool,
    name: String,
}

impl CommandClient {
    /// 创建客户端；租户、应用 ID 与密钥均不能为空
    pub fn new(tenant_id: &str, app_id: &str, secret: &str) -> Result<Self> {
        fn require(name: &str, value: &str) -> Result<String> {
            let value = value.trim();
            if value.is_empty() {
                return Err(TransferError::InvalidArgument(format!(
                    "no {} specified for transfer session",
                    name
                )));
            }
            Ok(value.to_string())
        }

        let tenant_id = require("tenant ID", tenant_id)?;
        let app_id = require("app ID", app_id)?;
        let secret = require("client secret", secret)?;

        Ok(Self {
            executable: PathBuf::from(EXECUTABLE),
            name: format!("command:{}", EXECUTABLE),
            tenant_id,
            app_id,
            secret,
            log_level: None,
            log_location: None,
            logged_in: AtomicBool::new(false),
        })
    }

    /// 指定传输工具可执行文件
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self.name = format!("command:{}", self.executable.display());
        self
    }

    /// 传输工具自身日志的写入目录
    pub fn with_log_location(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_location = Some(dir.into());
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// 设置传输工具自身的日志级别（copy / remove / sync 生效）
    pub fn set_log_level(&mut self, level: &str) -> Result<()> {
        let level = level.to_uppercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(TransferError::InvalidArgument(format!(
                "invalid transfer log level {:?}",
                level
            )));
        }

        self.log_level = Some(level);
        Ok(())
    }

    /// 构造带可选 `--log-level` 的子命令参数
    fn command<I, S>(&self, subcommand: &str, args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut call: Vec<OsString> = vec![subcommand.into()];
        if let Some(level) = &self.log_level {
            call.push("--log-level".into());
            call.push(level.into());
        }
        call.extend(args.into_iter().map(Into::into));
        call
    }

    async fn run(
        &self,
        op: &str,
        args: Vec<OsString>,
        response_prefix: Option<&str>,
        with_secret: bool,
    ) -> Result<Vec<String>> {
        debug!(op, "running command {:?} {:?}", self.executable, args);

        let mut command = Command::new(&self.executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if with_secret {
            command.env(SECRET_ENV, &self.secret);
        }
        if let Some(dir) = &self.log_location {
            command.env(LOG_LOCATION_ENV, dir);
        }

        let proc = command.output().await?;

        let mut output = parse_output(&proc.stdout, response_prefix);
        let stderr = parse_output(&proc.stderr, None);
        output.log_lines.extend(stderr.log_lines);
        let diagnostic = output.diagnostic.take().or(stderr.diagnostic);

        let success = proc.status.success();
        let level = if !success && diagnostic.is_none() {
            Level::WARN
        } else {
            Level::DEBUG
        };

        log_line(level, op, &format!("finished running command {:?}", args));
        log_line(
            level,
            op,
            &format!("command returned {}", proc.status.code().unwrap_or(-1)),
        );
        for line in &output.log_lines {
            log_line(level, op, line);
        }

        if !success {
            let subject = args
                .last()
                .map(|a| a.to_string_lossy().into_owned())
                .unwrap_or_default();

            return Err(match diagnostic {
                Some(diagnostic) => diagnostic.into_error(&subject),
                None => TransferError::Unknown,
            });
        }

        Ok(output.responses)
    }

    async fn md5s(&self, op: &str, subcommand: &str, dst_url: &str) -> Result<RemoteListing> {
        let lines = self
            .run(
                op,
                vec![subcommand.into(), dst_url.into()],
                Some(MD5_PREFIX),
                false,
            )
            .await?;

        lines.iter().map(|line| parse_md5_line(line)).collect()
    }
}

#[async_trait]
impl TransferClient for CommandClient {
    async fn login(&self) -> Result<()> {
        if self.logged_in.load(Ordering::SeqCst) {
            debug!(op = "login", "skipping login; already logged in");
            return Ok(());
        }

        info!(
            op = "login",
            "logging in as tenant {:?}, app {:?}", self.tenant_id, self.app_id
        );

        let args: Vec<OsString> = vec![
            "login".into(),
            format!("--tenant-id={}", self.tenant_id).into(),
            "--service-principal".into(),
            format!("--application-id={}", self.app_id).into(),
        ];

        match self.run("login", args, None, true).await {
            Ok(_) => {}
            Err(TransferError::NotAuthenticated) => return Err(TransferError::NotAuthenticated),
            Err(TransferError::Io(err)) => return Err(TransferError::Io(err)),
            Err(err) => return Err(TransferError::Login(Box::new(err))),
        }

        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        if !self.logged_in.load(Ordering::SeqCst) {
            debug!(op = "logout", "skipping logout; already logged out");
            return Ok(());
        }

        info!(op = "logout", "logging out of transfer client");
        self.run("logout", vec!["logout".into()], None, false).await?;
        self.logged_in.store(false, Ordering::SeqCst);

        Ok(())
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn copy(&self, src_file: &Path, dst_url: &str) -> Result<()> {
        self.login().await?;
        info!(op = "copy", "copying '{}' to {:?}", src_file.display(), dst_url);

        let args = self.command(
            "copy",
            [
                OsString::from("--put-md5"),
                src_file.as_os_str().to_os_string(),
                dst_url.into(),
            ],
        );
        self.run("copy", args, None, false).await?;
        Ok(())
    }

    async fn remove(&self, dst_url: &str) -> Result<()> {
        self.login().await?;
        info!(op = "remove", "removing {:?}", dst_url);

        let args = self.command("remove", [dst_url]);
        self.run("remove", args, None, false).await?;
        Ok(())
    }

    async fn sync(&self, src_dir: &Path, dst_url: &str, remove_extraneous: bool) -> Result<()> {
        self.login().await?;
        info!(op = "sync", "syncing '{}' to {:?}", src_dir.display(), dst_url);

        let delete = if remove_extraneous { "true" } else { "false" };
        let args = self.command(
            "sync",
            [
                OsString::from("--put-md5"),
                "--delete-destination".into(),
                delete.into(),
                src_dir.as_os_str().to_os_string(),
                dst_url.into(),
            ],
        );
        self.run("sync", args, None, false).await?;
        Ok(())
    }

    async fn list_hashes(&self, dst_url: &str) -> Result<RemoteListing> {
        self.login().await?;
        info!(op = "list_md5s", "listing MD5 hashes for {:?}", dst_url);

        self.md5s("list_md5s", "list_md5s", dst_url).await
    }

    async fn lookup_hash(&self, dst_url: &str) -> Result<RemoteLookup> {
        self.login().await?;
        info!(op = "get_md5", "getting MD5 hash for {:?}", dst_url);

        let records = match self.md5s("get_md5", "get_md5", dst_url).await {
            Ok(records) => records,
            Err(TransferError::FileNotFound(_)) => return Ok(RemoteLookup::NotFound),
            Err(err) => return Err(err),
        };

        if records.len() != 1 {
            return Err(TransferError::Protocol(format!(
                "get_md5 returned {} records for {:?}",
                records.len(),
                dst_url
            )));
        }

        let stats = records.into_values().next().ok_or_else(|| {
            TransferError::Protocol(format!("get_md5 returned no record for {:?}", dst_url))
        })?;

        Ok(RemoteLookup::Found(stats))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_blank_credentials() {
        assert!(matches!(
            CommandClient::new(" ", "app", "secret"),
            Err(TransferError::InvalidArgument(_))
        ));
        assert!(CommandClient::new("tenant", "app", "").is_err());
        assert!(CommandClient::new("tenant", "app", "secret").is_ok());
    }

    #[test]
    fn test_set_log_level() {
        let mut client = CommandClient::new("t", "a", "s").unwrap();
        assert!(client.set_log_level("warning").is_ok());
        assert!(client.set_log_level("LOUD").is_err());

        let args: Vec<String> = client
            .command("remove", ["url"])
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["remove", "--log-level", "WARNING", "url"]);
    }

    #[test]
    fn test_parse_output_drops_progress_lines() {
        let raw = b"first\n\r50% done\nMD5: abc\t3\tx.txt\n\nlast\n";
        let output = parse_output(raw, Some(MD5_PREFIX));

        assert_eq!(output.log_lines, vec!["first", "last"]);
        assert_eq!(output.responses, vec!["MD5: abc\t3\tx.txt"]);
        assert!(output.diagnostic.is_none());
    }

    #[test]
    fn test_parse_output_diagnostics() {
        let found = parse_output(b"   X-Ms-Error-Code: [BlobNotFound]\n", None);
        assert_eq!(found.diagnostic, Some(Diagnostic::Code("BlobNotFound".into())));
        assert!(matches!(
            found.diagnostic.unwrap().into_error("url"),
            TransferError::FileNotFound(url) if url == "url"
        ));

        let other = parse_output(b"X-Ms-Error-Code: [ThisIsAnError]\n", None);
        assert!(matches!(
            other.diagnostic.unwrap().into_error("url"),
            TransferError::Remote(code) if code == "ThisIsAnError"
        ));

        let auth = parse_output(format!("{}\n", NOT_AUTHENTICATED_MSG).as_bytes(), None);
        assert_eq!(auth.diagnostic, Some(Diagnostic::NotAuthenticated));
    }

    #[test]
    fn test_parse_md5_line() {
        let (key, stats) = parse_md5_line("MD5: deadbeef\t100000\trun1/sample.fastq.gz").unwrap();
        assert_eq!(key, "run1/sample.fastq.gz");
        assert_eq!(stats, FileStats::remote("DEADBEEF", 100000));

        let (_, empty) = parse_md5_line("MD5: \t0\tempty.txt").unwrap();
        assert_eq!(empty.hash.as_deref(), Some(""));

        assert!(matches!(
            parse_md5_line("MD5: abc\tlots\tfile"),
            Err(TransferError::Protocol(_))
        ));
        assert!(parse_md5_line("MD5: abc").is_err());
    }
}
