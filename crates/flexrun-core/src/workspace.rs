//! Ephemeral source files handed to the interpreter.

use crate::config::ExecutionConfig;
use crate::errors::BrokerError;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;

/// Directory holding one source file per live execution.
#[derive(Debug, Clone)]
pub struct SourceWorkspace {
    dir: PathBuf,
    prefix: String,
    extension: String,
    retention: Duration,
}

impl SourceWorkspace {
    pub fn new(config: &ExecutionConfig) -> Self {
        // The interpreter may run in another working directory
        let dir = if config.temp_dir.is_absolute() {
            config.temp_dir.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&config.temp_dir))
                .unwrap_or_else(|_| config.temp_dir.clone())
        };

        Self {
            dir,
            prefix: config.source_prefix.clone(),
            extension: config.source_extension.trim_start_matches('.').to_string(),
            retention: config.temp_retention(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, execution_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.{}", self.prefix, execution_id, self.extension))
    }

    pub async fn ensure_dir(&self) -> Result<(), BrokerError> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            BrokerError::IoError(format!(
                "Failed to create temp directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    /// Write `code` to the execution's source file.
    pub async fn persist(&self, execution_id: &str, code: &str) -> Result<PathBuf, BrokerError> {
        self.ensure_dir().await?;
        let path = self.path_for(execution_id);
        fs::write(&path, code).await.map_err(|e| {
            BrokerError::IoError(format!("Failed to write {}: {}", path.display(), e))
        })?;
        log::debug!("Wrote {} bytes of source to {}", code.len(), path.display());
        Ok(path)
    }

    /// Delete a source file. Returns whether a file was actually removed.
    pub async fn remove(&self, path: &Path) -> bool {
        match fs::remove_file(path).await {
            Ok(()) => {
                log::debug!("Deleted source file {}", path.display());
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                log::warn!("Failed to delete source file {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Delete source files older than the retention window.
    ///
    /// Best-effort: failures are logged and skipped. Returns the number of files removed.
    pub async fn sweep_stale(&self) -> usize {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to scan {} for stale files: {}", self.dir.display(), e);
                }
                return 0;
            }
        };

        let suffix = format!(".{}", self.extension);
        let now = SystemTime::now();
        let mut removed = 0;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read entry in {}: {}", self.dir.display(), e);
                    break;
                }
            };

            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(&self.prefix) || !name.ends_with(&suffix) {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    log::warn!("Failed to stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            let age = now.duration_since(modified).unwrap_or_default();
            if age >= self.retention && self.remove(&entry.path()).await {
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("Swept {} stale source files from {}", removed, self.dir.display());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(dir: &Path, retention_secs: u64) -> SourceWorkspace {
        let config = ExecutionConfig {
            temp_dir: dir.to_path_buf(),
            temp_retention_secs: retention_secs,
            ..ExecutionConfig::default()
        };
        SourceWorkspace::new(&config)
    }

    #[tokio::test]
    async fn test_persist_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(&dir.path().join("nested"), 3600);

        let path = workspace.persist("abc", "print(\"hi\")").await.unwrap();
        assert_eq!(path.file_name().unwrap(), "code_abc.lx");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "print(\"hi\")");

        assert!(workspace.remove(&path).await);
        assert!(!workspace.remove(&path).await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_sweep_only_touches_expired_source_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("code_old.lx"), "x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();
        std::fs::write(dir.path().join("code_other.py"), "keep").unwrap();

        let keep_all = workspace(dir.path(), 3600);
        assert_eq!(keep_all.sweep_stale().await, 0);
        assert!(dir.path().join("code_old.lx").exists());

        let sweep_all = workspace(dir.path(), 0);
        assert_eq!(sweep_all.sweep_stale().await, 1);
        assert!(!dir.path().join("code_old.lx").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("code_other.py").exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(&dir.path().join("absent"), 0);
        assert_eq!(workspace.sweep_stale().await, 0);
    }
}
