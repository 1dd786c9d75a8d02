//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # 設計原則
//! - 起動時検証（Fail-fast 設計）: デバイスに触る前に設定の矛盾を落とす
//! - 明確なエラーメッセージ: どのタスク・どのタイムアウトが悪いかを返す

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::pipeline::{Pipeline, PlannedTask};
use super::settings::Settings;
use crate::domain::{DeviceSerial, ReplaceTask};
use crate::ports::DeviceConnector;

/// PipelineBuilder は Pipeline を構築
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::new(connector, settings)
///     .tasks(default_tasks())
///     .build()?;
/// let report = pipeline.run().await?;
/// ```
pub struct PipelineBuilder {
    connector: Arc<dyn DeviceConnector>,
    settings: Settings,
    tasks: Vec<ReplaceTask>,
    serial: Option<DeviceSerial>,
}

/// BuildError はパイプライン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no tasks configured")]
    NoTasks,

    #[error("invalid tasks: {0:?}")]
    InvalidTasks(Vec<String>),

    #[error("timeout `{0}` must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("working directory must differ from the assets directory: {0}")]
    WorkdirIsAssetsDir(String),
}

impl PipelineBuilder {
    pub fn new(connector: Arc<dyn DeviceConnector>, settings: Settings) -> Self {
        Self {
            connector,
            settings,
            tasks: Vec::new(),
            serial: None,
        }
    }

    pub fn tasks(mut self, tasks: Vec<ReplaceTask>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Pin the device instead of picking from the attached list.
    pub fn device(mut self, serial: Option<DeviceSerial>) -> Self {
        self.serial = serial;
        self
    }

    /// # 検証
    /// - タスクが 1 つ以上ある
    /// - 各タスクの asset にファイル名があり、マニフェスト用の名前やキャッシュファイルと
    ///   衝突せず、target が絶対パス
    /// - 待ち時間・間隔がすべて正
    /// - 作業ディレクトリが assets ディレクトリと別（後片付けで素材を消さない）
    pub fn build(self) -> Result<Pipeline, BuildError> {
        if self.tasks.is_empty() {
            return Err(BuildError::NoTasks);
        }

        let reserved = self.settings.layout().reserved_names();
        let mut planned = Vec::with_capacity(self.tasks.len());
        let mut invalid = Vec::new();
        for task in &self.tasks {
            let shown = task.asset.display();
            let Some(name) = task.asset_name() else {
                invalid.push(format!("{shown}: asset has no file name"));
                continue;
            };
            if reserved.iter().any(|r| r == name) {
                invalid.push(format!("{shown}: name clashes with a manifest file"));
            } else if self.settings.workdir.join(name) == self.settings.cache_file {
                invalid.push(format!("{shown}: staged copy would overwrite the id cache"));
            } else if !task.target.starts_with('/') {
                invalid.push(format!("{shown}: target must be absolute"));
            } else {
                planned.push(PlannedTask {
                    task: task.clone(),
                    asset_name: name.to_string(),
                });
            }
        }
        if !invalid.is_empty() {
            return Err(BuildError::InvalidTasks(invalid));
        }

        let timeouts = &self.settings.timeouts;
        let checks: [(&'static str, Duration); 5] = [
            ("identifier_scan", timeouts.identifier_scan),
            ("handoff", timeouts.handoff),
            ("tunnel", timeouts.tunnel),
            ("confirmation", timeouts.controller.confirmation),
            ("poll", timeouts.controller.poll),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, d)| d.is_zero()) {
            return Err(BuildError::ZeroTimeout(*name));
        }

        if same_dir(&self.settings.assets_dir, &self.settings.workdir) {
            return Err(BuildError::WorkdirIsAssetsDir(
                self.settings.workdir.display().to_string(),
            ));
        }

        Ok(Pipeline::new(
            self.connector,
            self.settings,
            planned,
            self.serial,
        ))
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::settings::default_tasks;
    use crate::impls::memory::InMemoryDevice;

    fn builder(settings: Settings) -> PipelineBuilder {
        PipelineBuilder::new(Arc::new(InMemoryDevice::new("16.5")), settings)
    }

    #[test]
    fn test_build_success() {
        let pipeline = builder(Settings::new("/data/Sounds", "/data"))
            .tasks(default_tasks())
            .build();
        assert!(pipeline.is_ok());
    }

    #[test]
    fn test_build_without_tasks() {
        let result = builder(Settings::new("/data/Sounds", "/data")).build();
        assert!(matches!(result, Err(BuildError::NoTasks)));
    }

    #[test]
    fn test_build_reports_every_invalid_task() {
        let result = builder(Settings::new("/data/Sounds", "/data"))
            .tasks(vec![
                ReplaceTask::new("..", "/var/mobile/a"),
                ReplaceTask::new("ok.m4a", "/var/mobile/ok.m4a"),
                ReplaceTask::new("b.caf", "relative/b.caf"),
            ])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::InvalidTasks(invalid)) if invalid.len() == 2
        ));
    }

    #[test]
    fn test_build_rejects_asset_named_like_a_template() {
        let result = builder(Settings::new("/data/Sounds", "/data"))
            .tasks(vec![ReplaceTask::new("BLDatabaseManager.sqlite", "/var/mobile/x")])
            .build();
        assert!(matches!(result, Err(BuildError::InvalidTasks(_))));
    }

    #[test]
    fn test_build_rejects_asset_staged_over_the_id_cache() {
        let result = builder(Settings::new("/data/Sounds", "/data"))
            .tasks(vec![ReplaceTask::new("uuid.txt", "/var/mobile/x")])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::InvalidTasks(invalid)) if invalid[0].contains("id cache")
        ));

        let mut settings = Settings::new("/data/Sounds", "/data");
        settings.cache_file = "/state/uuid.txt".into();
        let result = builder(settings)
            .tasks(vec![ReplaceTask::new("uuid.txt", "/var/mobile/x")])
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_build_rejects_zero_poll() {
        let mut settings = Settings::new("/data/Sounds", "/data");
        settings.timeouts.controller.poll = Duration::ZERO;
        let result = builder(settings).tasks(default_tasks()).build();
        assert!(matches!(result, Err(BuildError::ZeroTimeout("poll"))));
    }

    #[test]
    fn test_build_rejects_workdir_equal_to_assets_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = builder(Settings::new(dir.path(), dir.path().join(".")))
            .tasks(default_tasks())
            .build();
        assert!(matches!(result, Err(BuildError::WorkdirIsAssetsDir(_))));
    }
}
