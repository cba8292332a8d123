//! 日志模块 - 控制台 / 轮转文件日志，以及最高日志级别跟踪

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// 单个日志文件的最大大小
pub const LOG_MAX_SIZE: u64 = 1024 * 1024;

/// 保留的轮转日志数量
pub const LOG_MAX_FILES: usize = 5;

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别: "DEBUG", "INFO", "WARNING", "ERROR"
    pub level: String,
    /// 追加写入的日志文件；为空时只输出到控制台
    pub file: Option<PathBuf>,
    pub max_size: u64,
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: None,
            max_size: LOG_MAX_SIZE,
            max_files: LOG_MAX_FILES,
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" | "warning" => Level::WARN,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        }
    }
}

/// 带大小限制的日志写入器
///
/// 超过 `max_size` 时把 `x.log` 依次轮转为 `x.log.1` .. `x.log.N`，最旧的被删除。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    max_files: usize,
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl SizeRotatingWriter {
    pub fn new(file_path: &Path, max_size: u64, max_files: usize) -> io::Result<Self> {
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let writer = Self::open_file(file_path, max_size, max_files)?;

        Ok(Self {
            file_path: file_path.to_path_buf(),
            max_size,
            max_files,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    fn open_file(file_path: &Path, max_size: u64, max_files: usize) -> io::Result<BufWriter<File>> {
        // 检查现有文件大小，如果超过限制则轮转
        if let Ok(metadata) = fs::metadata(file_path) {
            if metadata.len() > max_size {
                Self::rotate_log(file_path, max_files)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(BufWriter::new(file))
    }

    fn numbered(file_path: &Path, n: usize) -> PathBuf {
        let mut name = file_path.as_os_str().to_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path, max_files: usize) -> io::Result<()> {
        if max_files == 0 {
            return fs::remove_file(file_path);
        }

        let oldest = Self::numbered(file_path, max_files);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for n in (1..max_files).rev() {
            let from = Self::numbered(file_path, n);
            if from.exists() {
                fs::rename(&from, Self::numbered(file_path, n + 1))?;
            }
        }

        fs::rename(file_path, Self::numbered(file_path, 1))
    }
}

impl Clone for SizeRotatingWriter {
    fn clone(&self) -> Self {
        Self {
            file_path: self.file_path.clone(),
            max_size: self.max_size,
            max_files: self.max_files,
            writer: self.writer.clone(),
        }
    }
}

/// 日志写入器包装
pub struct LogWriter {
    inner: Arc<Mutex<Option<BufWriter<File>>>>,
    file_path: PathBuf,
    max_size: u64,
    max_files: usize,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;

        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "Writer not available"));
        };

        let written = writer.write(buf)?;
        writer.flush()?;

        let oversized = fs::metadata(&self.file_path)
            .map(|m| m.len() > self.max_size)
            .unwrap_or(false);
        if oversized {
            if let Some(mut old) = guard.take() {
                let _ = old.flush();
            }

            let _ = SizeRotatingWriter::rotate_log(&self.file_path, self.max_files);
            if let Ok(new_writer) =
                SizeRotatingWriter::open_file(&self.file_path, self.max_size, self.max_files)
            {
                *guard = Some(new_writer);
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        match guard.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
            max_files: self.max_files,
        }
    }
}

/// 记录运行期间出现过的最高日志级别
///
/// 克隆共享同一个计数，一份交给 subscriber，一份留给 main 判断退出码。
#[derive(Debug, Clone, Default)]
pub struct LevelTracker {
    max_level: Arc<AtomicU8>,
}

fn severity(level: &Level) -> u8 {
    match *level {
        Level::TRACE => 1,
        Level::DEBUG => 2,
        Level::INFO => 3,
        Level::WARN => 4,
        Level::ERROR => 5,
    }
}

impl LevelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, level: &Level) {
        self.max_level.fetch_max(severity(level), Ordering::SeqCst);
    }

    /// 是否记录过 ERROR
    pub fn saw_error(&self) -> bool {
        self.max_level.load(Ordering::SeqCst) >= severity(&Level::ERROR)
    }

    pub fn max_level(&self) -> Option<Level> {
        match self.max_level.load(Ordering::SeqCst) {
            1 => Some(Level::TRACE),
            2 => Some(Level::DEBUG),
            3 => Some(Level::INFO),
            4 => Some(Level::WARN),
            5 => Some(Level::ERROR),
            _ => None,
        }
    }
}

impl<S: Subscriber> Layer<S> for LevelTracker {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.record(event.metadata().level());
    }
}
