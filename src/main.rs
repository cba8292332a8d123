use clap::Parser;
use labsync_lib::commands::Command;
use labsync_lib::config;
use labsync_lib::logging::{LevelTracker, LogConfig, SizeRotatingWriter, LOG_MAX_FILES, LOG_MAX_SIZE};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

/// SIGINT 中断时的退出码
const EXIT_INTERRUPTED: u8 = 130;

/// 将仪器输出目录校验后同步到云存储
#[derive(Debug, Parser)]
#[command(version, about, args_override_self = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// 初始化日志系统，返回记录最高日志级别的跟踪器
fn init_logging(config: &LogConfig) -> LevelTracker {
    let tracker = LevelTracker::new();

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = config.file.as_ref().and_then(|path| {
        match SizeRotatingWriter::new(path, config.max_size, config.max_files) {
            Ok(writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false),
            ),
            Err(e) => {
                eprintln!("无法打开日志文件 '{}': {}", path.display(), e);
                None
            }
        }
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .with(tracker.clone());

    let _ = tracing::subscriber::set_global_default(subscriber);
    tracker
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match config::expand_args(std::env::args_os().collect()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("错误: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let cli = Cli::parse_from(args);
    let common = cli.command.common();

    let tracker = init_logging(&LogConfig {
        level: common.log_level.clone(),
        file: common.log_file.as_deref().map(config::expand_home),
        max_size: LOG_MAX_SIZE,
        max_files: LOG_MAX_FILES,
    });

    info!("运行 {} 命令", cli.command.name());

    if !common.validate() {
        error!("命令未执行");
        return ExitCode::from(1);
    }

    let interrupted = tokio::select! {
        result = cli.command.run() => {
            if let Err(e) = result {
                error!("{} 命令失败: {:#}", cli.command.name(), e);
            }
            false
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("收到中断信号，退出且不保存状态");
            true
        }
    };

    ExitCode::from(exit_status(interrupted, tracker.saw_error()))
}

/// 被 SIGINT 中断时按惯例返回 128 + 2；否则记录过错误日志即失败
fn exit_status(interrupted: bool, saw_error: bool) -> u8 {
    if interrupted {
        EXIT_INTERRUPTED
    } else if saw_error {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_is_never_success() {
        assert_eq!(exit_status(true, false), 130);
        assert_eq!(exit_status(true, true), 130);
        assert_eq!(exit_status(false, true), 1);
        assert_eq!(exit_status(false, false), 0);
    }
}
