//! 文件身份（大小 / 修改时间 / 内容哈希）

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, Metadata};
use std::io::{self, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// 哈希时每次读取的块大小
const HASH_BLOCK_SIZE: usize = 256 * 1024;

/// 文件在某一时刻的身份；缺失的字段在比较时可作为通配
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileStats {
    pub hash: Option<String>,
    pub size: Option<u64>,
    /// Unix 时间戳（秒）
    pub mtime: Option<f64>,
}

/// `FileStats::matches` 的通配选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    pub optional_hash: bool,
    pub optional_size: bool,
    pub optional_mtime: bool,
}

impl MatchOptions {
    /// 所有字段必须相等
    pub const EXACT: MatchOptions = MatchOptions {
        optional_hash: false,
        optional_size: false,
        optional_mtime: false,
    };

    /// 只比较大小与修改时间（本地缓存命中判断）
    pub const OPTIONAL_HASH: MatchOptions = MatchOptions {
        optional_hash: true,
        optional_size: false,
        optional_mtime: false,
    };

    /// 只比较哈希与大小（本地与远端对比，远端不保留修改时间）
    pub const OPTIONAL_MTIME: MatchOptions = MatchOptions {
        optional_hash: false,
        optional_size: false,
        optional_mtime: true,
    };
}

impl FileStats {
    pub fn new(hash: Option<String>, size: Option<u64>, mtime: Option<f64>) -> Self {
        Self { hash, size, mtime }
    }

    /// 远端记录：只有哈希与大小
    pub fn remote(hash: impl Into<String>, size: u64) -> Self {
        Self {
            hash: Some(hash.into()),
            size: Some(size),
            mtime: None,
        }
    }

    /// stat 文件，得到不含哈希的身份
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            hash: None,
            size: Some(metadata.len()),
            mtime: modified_secs(metadata),
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// 距离最后修改的秒数
    pub fn age(&self) -> Option<f64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
        self.mtime.map(|mtime| now - mtime)
    }

    /// 比较两个身份；若某字段对应的通配选项开启，且任一侧缺失该字段，则视为匹配
    pub fn matches(&self, other: &FileStats, options: MatchOptions) -> bool {
        field_matches(&self.hash, &other.hash, options.optional_hash)
            && field_matches(&self.size, &other.size, options.optional_size)
            && field_matches(&self.mtime, &other.mtime, options.optional_mtime)
    }
}

fn field_matches<T: PartialEq>(lhs: &Option<T>, rhs: &Option<T>, optional: bool) -> bool {
    lhs == rhs || (optional && (lhs.is_none() || rhs.is_none()))
}

impl PartialEq for FileStats {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other, MatchOptions::EXACT)
    }
}

impl fmt::Display for FileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_star<T: fmt::Debug>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map_or_else(|| "*".to_string(), |v| format!("{:?}", v))
        }

        write!(
            f,
            "FileStats({}, {}, {})",
            or_star(&self.hash),
            or_star(&self.size),
            or_star(&self.mtime)
        )
    }
}

fn modified_secs(metadata: &Metadata) -> Option<f64> {
    metadata
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}

/// 计算数据的 MD5（大写十六进制），与传输工具 `--put-md5` 记录的格式一致
pub fn calculate_hash(data: &[u8]) -> String {
    hex::encode_upper(Md5::digest(data))
}

/// 分块计算文件的 MD5
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut block = vec![0u8; HASH_BLOCK_SIZE];

    loop {
        let read = file.read(&mut block)?;
        if read == 0 {
            break;
        }
        hasher.update(&block[..read]);
    }

    Ok(hex::encode_upper(hasher.finalize()))
}
