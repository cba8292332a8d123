use super::url::normalize_key;
use super::{RemoteListing, RemoteLookup, TransferClient};
use crate::core::file_state::{hash_file, FileStats};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tracing::{debug, info};
use walkdir::WalkDir;

/// 以本地目录充当远端存储
///
/// URL 去掉 `base_url` 前缀后按段解码，映射到 `root` 下的路径。用于离线演练和测试。
pub struct LocalStore {
    root: PathBuf,
    base_url: String,
    logged_in: AtomicBool,
    name: String,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        let name = format!("local:{}", root.display());
        Ok(Self {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
            logged_in: AtomicBool::new(false),
            name,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 把远端 URL 映射为本地路径
    fn resolve_path(&self, url: &str) -> Result<PathBuf> {
        let rest = url
            .strip_prefix(self.base_url.as_str())
            .or_else(|| url.strip_prefix("file://"))
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!(
                    "URL {:?} is outside of store {:?}",
                    url, self.base_url
                ))
            })?;

        let mut path = self.root.clone();
        for segment in normalize_key(rest).split('/').filter(|s| !s.is_empty()) {
            let segment = urlencoding::decode(segment).map_err(|_| {
                TransferError::InvalidArgument(format!("invalid escape in URL {:?}", url))
            })?;
            if segment == ".." {
                return Err(TransferError::InvalidArgument(format!(
                    "URL {:?} escapes the store",
                    url
                )));
            }
            path.push(segment.as_ref());
        }

        Ok(path)
    }

    /// 写入临时文件后重命名
    async fn put(src_file: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut temp_name = target.as_os_str().to_os_string();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        fs::copy(src_file, &temp_path).await?;
        fs::rename(&temp_path, target).await?;
        Ok(())
    }

    fn walk(root: &Path) -> Vec<(String, PathBuf)> {
        WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(root).ok()?.to_str()?.to_string();
                Some((normalize_key(&relative), entry.into_path()))
            })
            .collect()
    }
}

/// 目标缺失、大小不同或源较新时需要复制
fn needs_copy(src: &std::fs::Metadata, dst: Option<&std::fs::Metadata>) -> bool {
    let Some(dst) = dst else {
        return true;
    };

    if src.len() != dst.len() {
        return true;
    }

    match (src.modified(), dst.modified()) {
        (Ok(src_time), Ok(dst_time)) => src_time > dst_time,
        _ => true,
    }
}

#[async_trait]
impl TransferClient for LocalStore {
    async fn login(&self) -> Result<()> {
        if !self.logged_in.swap(true, Ordering::SeqCst) {
            debug!(op = "login", "opened local store '{}'", self.root.display());
        }
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn copy(&self, src_file: &Path, dst_url: &str) -> Result<()> {
        self.login().await?;
        info!(op = "copy", "copying '{}' to {:?}", src_file.display(), dst_url);

        let target = self.resolve_path(dst_url)?;
        Self::put(src_file, &target).await
    }

    async fn remove(&self, dst_url: &str) -> Result<()> {
        self.login().await?;
        info!(op = "remove", "removing {:?}", dst_url);

        let target = self.resolve_path(dst_url)?;
        let result = match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&target).await,
            Ok(_) => fs::remove_file(&target).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TransferError::FileNotFound(dst_url.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn sync(&self, src_dir: &Path, dst_url: &str, remove_extraneous: bool) -> Result<()> {
        self.login().await?;
        info!(op = "sync", "syncing '{}' to {:?}", src_dir.display(), dst_url);

        let target_root = self.resolve_path(dst_url)?;
        let src_root = src_dir.to_path_buf();
        let walk_root = target_root.clone();
        let (sources, targets) = tokio::task::spawn_blocking(move || {
            (Self::walk(&src_root), Self::walk(&walk_root))
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let mut copied = 0usize;
        for (key, src_path) in &sources {
            let target = target_root.join(key);
            let src_meta = fs::metadata(src_path).await?;
            let dst_meta = fs::metadata(&target).await.ok();

            if needs_copy(&src_meta, dst_meta.as_ref()) {
                Self::put(src_path, &target).await?;
                copied += 1;
            }
        }

        let mut removed = 0usize;
        if remove_extraneous {
            for (key, target) in &targets {
                if !sources.iter().any(|(src_key, _)| src_key == key) {
                    fs::remove_file(target).await?;
                    removed += 1;
                }
            }
        }

        debug!(op = "sync", "copied {} files, removed {} files", copied, removed);
        Ok(())
    }

    async fn list_hashes(&self, dst_url: &str) -> Result<RemoteListing> {
        self.login().await?;
        info!(op = "list_md5s", "listing MD5 hashes for {:?}", dst_url);

        let target_root = self.resolve_path(dst_url)?;
        if !target_root.exists() {
            return Ok(RemoteListing::new());
        }

        let listing = tokio::task::spawn_blocking(move || -> std::io::Result<RemoteListing> {
            let mut listing = RemoteListing::new();
            for (key, path) in Self::walk(&target_root) {
                let size = std::fs::metadata(&path)?.len();
                listing.insert(key, FileStats::remote(hash_file(&path)?, size));
            }
            Ok(listing)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        Ok(listing)
    }

    async fn lookup_hash(&self, dst_url: &str) -> Result<RemoteLookup> {
        self.login().await?;
        info!(op = "get_md5", "getting MD5 hash for {:?}", dst_url);

        let target = self.resolve_path(dst_url)?;
        let metadata = match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(RemoteLookup::NotFound),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RemoteLookup::NotFound)
            }
            Err(e) => return Err(e.into()),
        };

        let hash = tokio::task::spawn_blocking(move || hash_file(&target))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        Ok(RemoteLookup::Found(FileStats::remote(hash, metadata.len())))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file_state::calculate_hash;

    const BASE: &str = "https://acct.blob.core.windows.net/container";

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("remote"), BASE).unwrap();
        (dir, store)
    }

    #[test]
    fn test_resolve_path() {
        let (_dir, store) = store();
        assert_eq!(
            store.resolve_path(&format!("{}/run%201/a.txt", BASE)).unwrap(),
            store.root().join("run 1").join("a.txt")
        );
        assert!(store.resolve_path("https://elsewhere/a.txt").is_err());
        assert!(store.resolve_path(&format!("{}/../x", BASE)).is_err());
    }

    #[tokio::test]
    async fn test_copy_and_lookup() {
        let (dir, store) = store();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"payload").unwrap();

        let url = format!("{}/run1/a.txt", BASE);
        assert_eq!(store.lookup_hash(&url).await.unwrap(), RemoteLookup::NotFound);

        store.copy(&src, &url).await.unwrap();
        assert!(store.is_logged_in());
        assert_eq!(
            store.get_hash(&url).await.unwrap(),
            FileStats::remote(calculate_hash(b"payload"), 7)
        );
    }

    #[tokio::test]
    async fn test_remove_missing_is_file_not_found() {
        let (_dir, store) = store();
        let err = store
            .remove(&format!("{}/missing.txt", BASE))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_sync_removes_extraneous() {
        let (dir, store) = store();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a.txt"), b"a").unwrap();
        std::fs::write(src.join("sub/b.txt"), b"bb").unwrap();

        let url = format!("{}/run1", BASE);
        std::fs::create_dir_all(store.root().join("run1")).unwrap();
        std::fs::write(store.root().join("run1/stale.txt"), b"old").unwrap();

        store.sync(&src, &url, false).await.unwrap();
        let listing = store.list_hashes(&url).await.unwrap();
        assert_eq!(listing.len(), 3);
        assert_eq!(listing["sub/b.txt"], FileStats::remote(calculate_hash(b"bb"), 2));

        store.sync(&src, &url, true).await.unwrap();
        let listing = store.list_hashes(&url).await.unwrap();
        assert_eq!(
            listing.keys().cloned().collect::<Vec<_>>(),
            vec!["a.txt".to_string(), "sub/b.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let (_dir, store) = store();
        let listing = store.list_hashes(&format!("{}/nothing", BASE)).await.unwrap();
        assert!(listing.is_empty());
    }
}
