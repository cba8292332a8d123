pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::core::{
    execute, CheckedCopy, CheckedMultiCopy, CheckedSync, FileStats, MatchOptions,
    PersistentState, RemoveLocal, RemoveRemote, Task, Write, TRIES,
};
pub use error::{Result, TransferError};
pub use storage::{with_session, CommandClient, LocalStore, RemoteLookup, TransferClient};

/// 创建调用外部传输工具的客户端
pub fn new_client(tenant_id: &str, app_id: &str, secret: &str) -> Result<CommandClient> {
    CommandClient::new(tenant_id, app_id, secret)
}

// 避免为几个目录函数引入 dirs 依赖
pub mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("USERPROFILE").ok().map(PathBuf::from)
        } else {
            std::env::var("HOME").ok().map(PathBuf::from)
        }
    }
}
