//! TaskScratch - タスク単位の一時ファイルを必ず消すスコープガード
//!
//! 成功・タイムアウト・途中の `?` による早期 return のどれでも、
//! ガードが drop された時点で登録済みのファイルを削除する。

use std::io;
use std::path::PathBuf;

use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct TaskScratch {
    files: Vec<PathBuf>,
}

impl TaskScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file for removal. It does not need to exist yet.
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.files.push(path.into());
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl Extend<PathBuf> for TaskScratch {
    fn extend<T: IntoIterator<Item = PathBuf>>(&mut self, iter: T) {
        self.files.extend(iter);
    }
}

impl Drop for TaskScratch {
    fn drop(&mut self) {
        for path in self.files.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed task file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove task file"),
            }
        }
    }
}
