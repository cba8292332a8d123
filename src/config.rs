//! 应用配置模块
//!
//! 命令行参数可以写在 JSON 配置文件中（键名为参数名的 snake_case 形式），
//! 由 `--config` 指定。配置文件中的值插入到子命令之后、命令行参数之前，
//! 因此命令行上的值优先。

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 默认状态目录名（位于用户主目录下）
pub const STATE_DIR: &str = ".labsync";

/// `~/.labsync/<command>.<extension>`
pub fn default_path(command: &str, extension: &str) -> PathBuf {
    crate::dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR)
        .join(format!("{}.{}", command, extension))
}

/// 展开 `~/` 前缀
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), crate::dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// 从命令行参数中找出 `--config` 的值
fn find_config_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let arg = arg.to_string_lossy();
        if arg == "--config" {
            return iter.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

/// 读取 JSON 配置文件，顶层必须是对象
pub fn load_config(path: &Path) -> Result<serde_json::Map<String, Value>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("读取配置文件失败: {}", path.display()))?;

    match serde_json::from_str::<Value>(&content)
        .with_context(|| format!("解析配置文件失败: {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("配置文件顶层必须是 JSON 对象: {}", path.display())),
    }
}

/// 把配置项转换为等价的长参数
pub fn config_to_args(config: &serde_json::Map<String, Value>) -> Result<Vec<OsString>> {
    let mut args = Vec::new();

    for (key, value) in config {
        // 配置文件不能再指定配置文件
        if key == "config" {
            continue;
        }

        let flag = format!("--{}", key.replace('_', "-"));
        match value {
            Value::Null | Value::Bool(false) => {}
            Value::Bool(true) => args.push(flag.into()),
            Value::String(s) => {
                args.push(flag.into());
                args.push(s.into());
            }
            Value::Number(n) => {
                args.push(flag.into());
                args.push(n.to_string().into());
            }
            Value::Array(_) | Value::Object(_) => {
                return Err(anyhow!("配置项 {:?} 的值必须是标量", key));
            }
        }
    }

    Ok(args)
}

/// 合并配置文件与命令行参数
///
/// `args` 包含程序名；配置参数插入在第一个非选项参数（子命令）之后。
pub fn expand_args(args: Vec<OsString>) -> Result<Vec<OsString>> {
    let Some(config_path) = find_config_arg(&args) else {
        return Ok(args);
    };

    let config = load_config(&expand_home(&config_path))?;
    let extra = config_to_args(&config)?;
    debug!("从 {} 读取了 {} 个配置参数", config_path.display(), extra.len());

    let position = args
        .iter()
        .skip(1)
        .position(|arg| !arg.to_string_lossy().starts_with('-'))
        .map(|i| i + 2)
        .unwrap_or(args.len());

    let mut expanded = args;
    expanded.splice(position..position, extra);
    Ok(expanded)
}

/// 读取明文密钥文件
pub fn read_credentials(path: &Path) -> Result<String> {
    let secret = fs::read_to_string(path)
        .with_context(|| format!("读取凭据文件失败: {}", path.display()))?;
    Ok(secret.trim().to_string())
}

/// 在 PATH 中查找可执行文件；包含路径分隔符时直接检查该路径
pub fn find_executable(name: &Path) -> Option<PathBuf> {
    if name.components().count() > 1 {
        return name.is_file().then(|| name.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
