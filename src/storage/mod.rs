pub mod command;
pub mod local;
pub mod url;

use crate::core::file_state::FileStats;
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use tracing::warn;

pub use command::CommandClient;
pub use local::LocalStore;
pub use url::{join_url, normalize_key, quote_path};

/// 远端相对路径（`/` 分隔）-> 远端记录的大小与哈希
pub type RemoteListing = BTreeMap<String, FileStats>;

/// 单个远端对象的查询结果
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteLookup {
    Found(FileStats),
    NotFound,
}

/// 传输客户端接口
///
/// 所有操作在首次使用时自动登录；重复登录是空操作。
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// 登录；已登录时直接返回
    async fn login(&self) -> Result<()>;

    /// 登出；仅在已登录时生效
    async fn logout(&self) -> Result<()>;

    fn is_logged_in(&self) -> bool;

    /// 上传单个文件（附带校验和）
    async fn copy(&self, src_file: &Path, dst_url: &str) -> Result<()>;

    /// 删除单个远端对象
    async fn remove(&self, dst_url: &str) -> Result<()>;

    /// 同步目录；`remove_extraneous` 为真时删除远端多余文件
    async fn sync(&self, src_dir: &Path, dst_url: &str, remove_extraneous: bool) -> Result<()>;

    /// 列出前缀下所有对象的大小与哈希
    async fn list_hashes(&self, dst_url: &str) -> Result<RemoteListing>;

    /// 查询单个对象
    async fn lookup_hash(&self, dst_url: &str) -> Result<RemoteLookup>;

    /// 获取单个对象的哈希；对象不存在时返回 `FileNotFound`
    async fn get_hash(&self, dst_url: &str) -> Result<FileStats> {
        match self.lookup_hash(dst_url).await? {
            RemoteLookup::Found(stats) => Ok(stats),
            RemoteLookup::NotFound => Err(TransferError::FileNotFound(dst_url.to_string())),
        }
    }

    /// 获取客户端名称（用于日志）
    fn name(&self) -> &str;
}

/// 会话失败原因是否是登录失败
pub trait SessionFailure {
    fn is_login_failure(&self) -> bool;
}

impl SessionFailure for TransferError {
    fn is_login_failure(&self) -> bool {
        self.is_login_error()
    }
}

impl SessionFailure for anyhow::Error {
    fn is_login_failure(&self) -> bool {
        self.downcast_ref::<TransferError>()
            .is_some_and(TransferError::is_login_error)
    }
}

/// 在客户端会话内执行 `body`，结束后自动登出
///
/// 若 `body` 因登录失败而结束则不登出，避免用一次注定失败的登出掩盖原始错误。
/// 登出本身失败时，其错误优先返回。
pub async fn with_session<C, Fut, T, E>(client: &C, body: Fut) -> std::result::Result<T, E>
where
    C: TransferClient + ?Sized,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: SessionFailure + From<TransferError> + std::fmt::Display,
{
    let result = body.await;

    if let Err(err) = &result {
        if err.is_login_failure() {
            return result;
        }
    }

    if let Err(logout_err) = client.logout().await {
        if let Err(err) = &result {
            warn!("登出失败，原始错误: {}", err);
        }
        return Err(logout_err.into());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// 只记录登出次数的客户端
    #[derive(Default)]
    struct SessionClient {
        logged_in: AtomicBool,
        logouts: AtomicUsize,
        fail_logout: bool,
    }

    impl SessionClient {
        fn logged_in() -> Self {
            Self {
                logged_in: AtomicBool::new(true),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TransferClient for SessionClient {
        async fn login(&self) -> Result<()> {
            self.logged_in.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn logout(&self) -> Result<()> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            if self.fail_logout {
                return Err(TransferError::Remote("LogoutFailed".to_string()));
            }
            self.logged_in.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_logged_in(&self) -> bool {
            self.logged_in.load(Ordering::SeqCst)
        }

        async fn copy(&self, _src_file: &Path, _dst_url: &str) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _dst_url: &str) -> Result<()> {
            Ok(())
        }

        async fn sync(&self, _src_dir: &Path, _dst_url: &str, _remove_extraneous: bool) -> Result<()> {
            Ok(())
        }

        async fn list_hashes(&self, _dst_url: &str) -> Result<RemoteListing> {
            Ok(RemoteListing::new())
        }

        async fn lookup_hash(&self, _dst_url: &str) -> Result<RemoteLookup> {
            Ok(RemoteLookup::NotFound)
        }

        fn name(&self) -> &str {
            "session"
        }
    }

    #[tokio::test]
    async fn test_session_logs_out_after_success() {
        let client = SessionClient::logged_in();
        let value = with_session(&client, async { Ok::<_, TransferError>(7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(client.logouts.load(Ordering::SeqCst), 1);
        assert!(!client.is_logged_in());
    }

    #[tokio::test]
    async fn test_session_skips_logout_after_login_failure() {
        let client = SessionClient::logged_in();
        let err = with_session(&client, async {
            Err::<(), _>(TransferError::Login(Box::new(TransferError::Unknown)))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Login(_)));

        let err = with_session(&client, async {
            Err::<(), _>(anyhow::Error::from(TransferError::NotAuthenticated))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::NotAuthenticated)
        ));

        assert_eq!(client.logouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_session_logs_out_after_other_errors() {
        let client = SessionClient::logged_in();
        let err = with_session(&client, async {
            Err::<(), _>(TransferError::FileNotFound("a.txt".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::FileNotFound(ref key) if key == "a.txt"));
        assert_eq!(client.logouts.load(Ordering::SeqCst), 1);
        assert!(!client.is_logged_in());
    }

    #[tokio::test]
    async fn test_session_logout_failure_takes_priority() {
        let client = SessionClient {
            fail_logout: true,
            ..SessionClient::logged_in()
        };

        let err = with_session(&client, async { Ok::<_, TransferError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Remote(ref code) if code == "LogoutFailed"));

        let err = with_session(&client, async {
            Err::<(), _>(anyhow::anyhow!("body failed"))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("LogoutFailed"));
        assert_eq!(client.logouts.load(Ordering::SeqCst), 2);
    }
}
