//! 用假的传输工具脚本驱动 CommandClient
#![cfg(unix)]

use labsync_lib::commands::common::login;
use labsync_lib::core::RetryPolicy;
use labsync_lib::storage::{with_session, CommandClient, RemoteLookup, TransferClient};
use labsync_lib::{FileStats, TransferError};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const URL: &str = "https://acct.blob.core.windows.net/container";

fn fake_tool(dir: &Path) -> (PathBuf, PathBuf) {
    let log = dir.join("calls.log");
    let glitched = dir.join("glitched");
    let script = dir.join("fake-azcopy");
    let body = format!(
        r#"#!/bin/sh
echo "$@" >> '{log}'
case "$1" in
  login)
    if [ "$AZCOPY_SPA_CLIENT_SECRET" = "flaky" ] && [ ! -f '{glitched}' ]; then
      touch '{glitched}'
      echo "connection reset"
      exit 1
    fi
    if [ "$AZCOPY_SPA_CLIENT_SECRET" = "denied" ]; then
      echo "RESPONSE ERROR X-Ms-Error-Code: [AuthorizationFailure]"
      exit 1
    fi
    if [ "$AZCOPY_SPA_CLIENT_SECRET" = "flaky" ]; then
      exit 0
    fi
    if [ "$AZCOPY_SPA_CLIENT_SECRET" != "s3cret" ]; then
      echo "failed to perform login command: no SAS token or OAuth token is present and the resource is not public"
      exit 1
    fi
    ;;
  list_md5s)
    printf '\rscanning 50%%\n'
    printf 'INFO: listing %s\n' "$2"
    printf 'MD5: abcd\t5\trun1/a.txt\n'
    printf 'MD5: \t0\trun1/empty\n'
    ;;
  get_md5)
    case "$2" in
      *missing*)
        echo "RESPONSE ERROR X-Ms-Error-Code: [BlobNotFound]" >&2
        exit 1
        ;;
    esac
    printf 'MD5: ff\t3\tb.txt\n'
    ;;
  remove)
    case "$*" in
      *fail*) echo "something went wrong"; exit 1 ;;
    esac
    ;;
esac
exit 0
"#,
        log = log.display(),
        glitched = glitched.display()
    );

    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    (script, log)
}

fn calls(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_command_client_against_fake_tool() {
    let dir = tempfile::tempdir().unwrap();
    let (script, log) = fake_tool(dir.path());

    // 错误的密钥：登录失败为未认证
    let client = CommandClient::new("tenant", "app", "wrong")
        .unwrap()
        .with_executable(&script);
    let err = client.login().await.unwrap_err();
    assert!(matches!(err, TransferError::NotAuthenticated));
    assert!(!client.is_logged_in());

    let mut client = CommandClient::new("tenant", "app", "s3cret")
        .unwrap()
        .with_executable(&script);
    client.set_log_level("error").unwrap();

    let listing = with_session(&client, async {
        let listing = client.list_hashes(&format!("{}/run1", URL)).await?;
        assert!(client.is_logged_in());

        assert_eq!(
            client.lookup_hash(&format!("{}/missing", URL)).await?,
            RemoteLookup::NotFound
        );
        let err = client.get_hash(&format!("{}/missing", URL)).await.unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));
        assert_eq!(
            client.get_hash(&format!("{}/b.txt", URL)).await?,
            FileStats::remote("FF", 3)
        );

        let src = dir.path().join("a.txt");
        fs::write(&src, b"hello").unwrap();
        client.copy(&src, &format!("{}/a.txt", URL)).await?;

        let err = client.remove(&format!("{}/fail", URL)).await.unwrap_err();
        assert!(matches!(err, TransferError::Unknown));
        assert!(err.is_retryable());

        Ok::<_, TransferError>(listing)
    })
    .await
    .unwrap();

    assert_eq!(listing.len(), 2);
    assert_eq!(listing["run1/a.txt"], FileStats::remote("ABCD", 5));
    // 空哈希不是通配
    assert_eq!(listing["run1/empty"].hash.as_deref(), Some(""));
    assert!(!client.is_logged_in());

    let recorded = calls(&log);
    let src = dir.path().join("a.txt");
    assert_eq!(
        recorded,
        vec![
            "login --tenant-id=tenant --service-principal --application-id=app".to_string(),
            "login --tenant-id=tenant --service-principal --application-id=app".to_string(),
            format!("list_md5s {}/run1", URL),
            format!("get_md5 {}/missing", URL),
            format!("get_md5 {}/missing", URL),
            format!("get_md5 {}/b.txt", URL),
            format!("copy --log-level ERROR --put-md5 {} {}/a.txt", src.display(), URL),
            format!("remove --log-level ERROR {}/fail", URL),
            "logout".to_string(),
        ]
    );

    // 登录失败但没有诊断信息：按策略重试后成功
    let policy = RetryPolicy::new(5, Duration::from_millis(1));
    let before = recorded.len();
    let client = CommandClient::new("tenant", "app", "flaky")
        .unwrap()
        .with_executable(&script);
    login(&client, &policy).await.unwrap();
    assert!(client.is_logged_in());
    let logins = calls(&log).len() - before;
    assert_eq!(logins, 2);

    // 工具明确拒绝的登录不重试
    let before = before + logins;
    let client = CommandClient::new("tenant", "app", "denied")
        .unwrap()
        .with_executable(&script);
    let err = login(&client, &policy).await.unwrap_err();
    assert!(err.to_string().contains("AuthorizationFailure"));
    assert!(!client.is_logged_in());
    assert_eq!(calls(&log).len() - before, 1);
}
