//! Remote file store collaborator: read/write/list with backup-on-write.
//!
//! The scheduler core only depends on the [`FileTransport`] trait. The
//! shipped implementation manages a local directory tree; the wire
//! protocol to an actual remote host is deliberately out of scope.

use std::future::Future;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::{AppError, Result};

/// What a path resolves to on the remote tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Nothing at this path.
    NotFound,
}

/// One entry returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RemoteEntry {
    /// Path relative to the tree root.
    pub path: String,
    /// Entry kind.
    pub kind: PathKind,
}

/// Narrow contract to the remote file tree.
///
/// `write` must create a timestamped backup of the prior content before
/// overwriting, unless no prior content existed; the returned reference
/// feeds `restore` during rollback.
pub trait FileTransport: Send + Sync {
    /// Read a file's content.
    fn read<'a>(&'a self, path: &'a str)
        -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Write content, returning the backup reference for the prior content.
    fn write<'a>(
        &'a self,
        path: &'a str,
        content: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    /// Restore a file from a backup reference produced by `write`.
    fn restore<'a>(
        &'a self,
        path: &'a str,
        backup_ref: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// List entries under a path.
    fn list<'a>(
        &'a self,
        path: &'a str,
        recursive: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RemoteEntry>>> + Send + 'a>>;

    /// Classify a path.
    fn path_type<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PathKind>> + Send + 'a>>;
}

/// Transport over a local directory tree with a parallel backups directory.
pub struct LocalFsTransport {
    root: PathBuf,
    backups_dir: PathBuf,
}

impl LocalFsTransport {
    /// Construct a transport rooted at `root`, staging backups in
    /// `backups_dir`.
    #[must_use]
    pub fn new(root: PathBuf, backups_dir: PathBuf) -> Self {
        Self { root, backups_dir }
    }

    /// Validate a tree-relative path and resolve it under the root.
    ///
    /// Absolute paths and any `..` component are rejected so a task can
    /// never escape the managed tree.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Err(AppError::Transport("empty path".into()));
        }
        let rel = Path::new(path);
        if rel.is_absolute() {
            return Err(AppError::Transport(format!("absolute path rejected: {path}")));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(AppError::Transport(format!(
                        "path escapes the managed tree: {path}"
                    )))
                }
            }
        }
        Ok(self.root.join(rel))
    }

    fn backup_current(&self, path: &str, target: &Path) -> Result<Option<String>> {
        if !target.exists() {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.backups_dir)
            .map_err(|err| AppError::Transport(format!("failed to create backups dir: {err}")))?;
        let sanitized: String = path
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let backup_name = format!("{sanitized}.{stamp}.bak");
        let backup_path = self.backups_dir.join(&backup_name);
        std::fs::copy(target, &backup_path)
            .map_err(|err| AppError::Transport(format!("backup of {path} failed: {err}")))?;
        Ok(Some(backup_name))
    }

    /// Write content atomically: temp file in the target directory, then
    /// rename. Prevents partial writes on crash.
    fn write_atomic(target: &Path, content: &str) -> Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                AppError::Transport(format!(
                    "failed to create parent directories for {}: {err}",
                    target.display()
                ))
            })?;
        }
        let parent = target
            .parent()
            .ok_or_else(|| AppError::Transport("file path has no parent directory".into()))?;
        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|err| AppError::Transport(format!("failed to create temporary file: {err}")))?;
        tmp.write_all(content.as_bytes())
            .map_err(|err| AppError::Transport(format!("failed to write temporary file: {err}")))?;
        tmp.persist(target).map_err(|err| {
            AppError::Transport(format!("failed to persist file to {}: {err}", target.display()))
        })?;
        Ok(())
    }

    fn list_dir(&self, dir: &Path, recursive: bool, out: &mut Vec<RemoteEntry>) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .map_err(|err| AppError::Transport(format!("list of {} failed: {err}", dir.display())))?;
        for entry in entries {
            let entry =
                entry.map_err(|err| AppError::Transport(format!("list entry failed: {err}")))?;
            let entry_path = entry.path();
            let rel = entry_path
                .strip_prefix(&self.root)
                .unwrap_or(&entry_path)
                .to_string_lossy()
                .replace('\\', "/");
            if entry_path.is_dir() {
                out.push(RemoteEntry {
                    path: rel,
                    kind: PathKind::Directory,
                });
                if recursive {
                    self.list_dir(&entry_path, true, out)?;
                }
            } else {
                out.push(RemoteEntry {
                    path: rel,
                    kind: PathKind::File,
                });
            }
        }
        Ok(())
    }
}

impl FileTransport for LocalFsTransport {
    fn read<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let target = self.resolve(path)?;
            std::fs::read_to_string(&target)
                .map_err(|err| AppError::Transport(format!("read of {path} failed: {err}")))
        })
    }

    fn write<'a>(
        &'a self,
        path: &'a str,
        content: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let target = self.resolve(path)?;
            let backup = self.backup_current(path, &target)?;
            Self::write_atomic(&target, content)?;
            tracing::debug!(path, backup = backup.as_deref().unwrap_or("none"), "file written");
            Ok(backup)
        })
    }

    fn restore<'a>(
        &'a self,
        path: &'a str,
        backup_ref: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let target = self.resolve(path)?;
            // Backup references are single file names produced by write().
            if backup_ref.contains('/') || backup_ref.contains('\\') {
                return Err(AppError::Transport(format!(
                    "invalid backup reference: {backup_ref}"
                )));
            }
            let backup_path = self.backups_dir.join(backup_ref);
            let content = std::fs::read_to_string(&backup_path).map_err(|err| {
                AppError::Transport(format!("backup {backup_ref} unreadable: {err}"))
            })?;
            Self::write_atomic(&target, &content)?;
            tracing::info!(path, backup_ref, "file restored from backup");
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        path: &'a str,
        recursive: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RemoteEntry>>> + Send + 'a>> {
        Box::pin(async move {
            let target = self.resolve(path)?;
            let mut out = Vec::new();
            self.list_dir(&target, recursive, &mut out)?;
            out.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(out)
        })
    }

    fn path_type<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PathKind>> + Send + 'a>> {
        Box::pin(async move {
            let target = self.resolve(path)?;
            let kind = match std::fs::metadata(&target) {
                Ok(meta) if meta.is_dir() => PathKind::Directory,
                Ok(_) => PathKind::File,
                Err(_) => PathKind::NotFound,
            };
            Ok(kind)
        })
    }
}

/// Suggested request timeout for transports doing network I/O.
///
/// The shipped local transport is synchronous and ignores it; kept on the
/// module so callers configure network transports uniformly.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);
