//! 本地会话目录（驱动持久化的登录态）
//!
//! 目录内容对本 crate 不透明，这里只负责：初始化前清理上次崩溃残留的锁文件；硬失效或锁冲突时整目录删除。
//! 删除失败只记录日志，不阻塞后续初始化。

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// 浏览器进程锁文件名
const LOCK_FILE_NAMES: &[&str] = &[
    "SingletonLock",
    "SingletonCookie",
    "SingletonSocket",
    "lockfile",
];

#[derive(Debug, Clone)]
pub struct SessionProfile {
    dir: PathBuf,
}

impl SessionProfile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.exists()
    }

    /// 删除残留锁文件，返回删除数量
    pub async fn remove_stale_locks(&self) -> usize {
        let dir = self.dir.clone();
        let result = tokio::task::spawn_blocking(move || remove_locks_blocking(&dir)).await;
        match result {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!("Removed {} stale lock file(s) from session profile", removed);
                }
                removed
            }
            Err(e) => {
                tracing::warn!("Lock cleanup task failed: {}", e);
                0
            }
        }
    }

    /// 删除整个会话目录；返回是否删除成功（目录不存在视为成功）
    pub async fn wipe(&self) -> bool {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                tracing::warn!("Session profile wiped: {}", self.dir.display());
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::error!(
                    "Failed to wipe session profile {}: {}",
                    self.dir.display(),
                    e
                );
                false
            }
        }
    }
}

fn remove_locks_blocking(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    let mut removed = 0;
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let name = entry.file_name().to_string_lossy();
        if !LOCK_FILE_NAMES.contains(&name.as_ref()) {
            continue;
        }
        // SingletonLock 通常是悬空符号链接，file_type 取自链接本身
        if entry.file_type().is_dir() {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Failed to remove {}: {}", entry.path().display(), e),
        }
    }
    removed
}
