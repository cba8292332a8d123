//! 错误类型

use thiserror::Error;

/// 传输与校验相关操作的结果类型
pub type Result<T> = std::result::Result<T, TransferError>;

/// 传输客户端、哈希层与状态存储的统一错误
#[derive(Error, Debug)]
pub enum TransferError {
    /// 登录失败；保留传输工具报告的原因
    #[error("login failed: {0}")]
    Login(#[source] Box<TransferError>),

    #[error(
        "NotAuthenticated: no SAS token or OAuth token is present and the resource is not \
         public. Try running 'keyctl session' before labsync if the client authenticated \
         successfully prior to this failure"
    )]
    NotAuthenticated,

    #[error("remote file not found: {0}")]
    FileNotFound(String),

    #[error("UnknownError")]
    Unknown,

    /// 传输工具报告了可识别但没有专门类型的错误码
    #[error("remote error: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("state error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// 登录失败（含未认证）时会话结束不再尝试登出
    pub fn is_login_error(&self) -> bool {
        matches!(self, TransferError::Login(_) | TransferError::NotAuthenticated)
    }

    /// 是否值得在调用点重试；登录失败看其原因
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Unknown | TransferError::Io(_) => true,
            TransferError::Login(cause) => cause.is_retryable(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout(_))
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::State(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TransferError::NotAuthenticated.is_login_error());
        assert!(TransferError::Login(Box::new(TransferError::Unknown)).is_login_error());
        assert!(!TransferError::Unknown.is_login_error());

        assert!(TransferError::Unknown.is_retryable());
        assert!(!TransferError::FileNotFound("a".into()).is_retryable());
        assert!(!TransferError::Timeout("hash".into()).is_retryable());
        assert!(TransferError::Timeout("hash".into()).is_timeout());
    }

    #[test]
    fn test_login_retryable_follows_cause() {
        let transient = TransferError::Login(Box::new(TransferError::Unknown));
        assert!(transient.is_retryable());
        assert_eq!(transient.to_string(), "login failed: UnknownError");

        let rejected = TransferError::Login(Box::new(TransferError::Remote("AuthFailed".into())));
        assert!(!rejected.is_retryable());
    }
}
