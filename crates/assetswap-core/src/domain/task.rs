use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::RunId;

/// One replacement to perform: push `asset` so that it lands at `target`.
///
/// `asset` は assets ディレクトリからの相対パス（通常はファイル名のみ）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceTask {
    pub asset: PathBuf,
    pub target: String,
    #[serde(default)]
    pub force_restart: bool,
}

impl ReplaceTask {
    pub fn new(asset: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            target: target.into(),
            force_restart: false,
        }
    }

    pub fn with_force_restart(mut self, force_restart: bool) -> Self {
        self.force_restart = force_restart;
        self
    }

    /// File name the asset is served and uploaded under.
    pub fn asset_name(&self) -> Option<&str> {
        self.asset.file_name().and_then(|n| n.to_str())
    }
}

/// Everything a single task needs, handed down the pipeline by value.
///
/// 実行中の共有グローバル状態は持たない。サーバ・クラフタ・コントローラは
/// すべてこの値だけを見る。
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub asset_name: String,
    /// Copy of the source asset inside the served working directory.
    pub staged_asset: PathBuf,
    pub target: String,
    pub force_restart: bool,
}

impl TaskContext {
    pub fn new(task: &ReplaceTask, asset_name: String, workdir: &Path) -> Self {
        Self {
            run_id: RunId::generate(),
            staged_asset: workdir.join(&asset_name),
            asset_name,
            target: task.target.clone(),
            force_restart: task.force_restart,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_deserialize_with_default_force_restart() {
        let tasks: Vec<ReplaceTask> = serde_json::from_value(serde_json::json!([
            {"asset": "a.m4a", "target": "/var/mobile/a.m4a"},
            {"asset": "b.caf", "target": "/var/mobile/b.caf", "force_restart": true},
        ]))
        .unwrap();

        assert!(!tasks[0].force_restart);
        assert!(tasks[1].force_restart);
        assert_eq!(tasks[1].asset_name(), Some("b.caf"));
    }

    #[test]
    fn context_stages_asset_inside_workdir() {
        let task = ReplaceTask::new("sounds/tone.m4a", "/var/mobile/tone.m4a");
        let ctx = TaskContext::new(&task, "tone.m4a".to_string(), Path::new("/tmp/work"));
        assert_eq!(ctx.staged_asset, Path::new("/tmp/work/tone.m4a"));
        assert_eq!(ctx.target, "/var/mobile/tone.m4a");
        assert!(!ctx.force_restart);
    }
}
