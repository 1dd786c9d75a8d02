//! Pipeline - 置き換えタスクを宣言順に 1 つずつ実行する
//!
//! # フロー
//! 1. デバイスを選ぶ（無ければ実行全体を中止）
//! 2. assets ディレクトリを確認（無ければ実行全体を中止）
//! 3. テンプレートを用意
//! 4. タスクごとに:
//!    - 素材が無ければスキップ（デバイスには触らない）
//!    - 素材を作業ディレクトリへ配置
//!    - セッションとコンテナ ID を用意（初回のみ。失敗はそのタスクだけ失敗）
//!    - 配信サーバ起動 → マニフェスト作成 → デバイス操作 → サーバ停止
//!    - 一時ファイルはスコープガードで必ず削除
//!
//! # 設計原則
//! - セッションとコンテナ ID は最初に必要になったタスクで取得し、以降は再利用する
//! - タスクの失敗は `TaskOutcome::Failed` として報告し、次のタスクへ進む

use std::path::Path;
use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span, warn};

use super::scratch::TaskScratch;
use super::settings::Settings;
use crate::controller::DeviceController;
use crate::domain::{
    ContainerId, DeviceSerial, ReplaceTask, RunError, RunReport, TaskContext, TaskError,
    TaskOutcome, TaskReport, TaskState, WaitOutcome,
};
use crate::manifest::{CraftedManifests, ManifestCrafter, Redirect};
use crate::ports::{DeviceConnector, DeviceSession};
use crate::resolver::ContainerResolver;
use crate::server::{self, CompletionSignals, ServeConfig, ServedBinding};
use crate::session::{EstablishedSession, SessionEstablisher, select_device};

/// A task that passed build-time validation, with its served file name.
#[derive(Debug, Clone)]
pub(crate) struct PlannedTask {
    pub(crate) task: ReplaceTask,
    pub(crate) asset_name: String,
}

pub struct Pipeline {
    connector: Arc<dyn DeviceConnector>,
    settings: Settings,
    tasks: Vec<PlannedTask>,
    serial: Option<DeviceSerial>,
}

/// Session and identifier shared by the tasks of one run.
#[derive(Default)]
struct DeviceLink {
    session: Option<EstablishedSession>,
    container: Option<ContainerId>,
}

impl DeviceLink {
    async fn session(
        &mut self,
        establisher: &SessionEstablisher,
        serial: &DeviceSerial,
    ) -> Result<Arc<dyn DeviceSession>, TaskError> {
        if let Some(session) = &self.session {
            return Ok(session.device());
        }
        let session = establisher.establish(serial).await?;
        let device = session.device();
        self.session = Some(session);
        Ok(device)
    }

    async fn container(
        &mut self,
        resolver: &ContainerResolver,
        device: &dyn DeviceSession,
    ) -> Result<ContainerId, TaskError> {
        if let Some(id) = &self.container {
            return Ok(id.clone());
        }
        let id = resolver.resolve(device).await?;
        self.container = Some(id.clone());
        Ok(id)
    }
}

impl Pipeline {
    pub(crate) fn new(
        connector: Arc<dyn DeviceConnector>,
        settings: Settings,
        tasks: Vec<PlannedTask>,
        serial: Option<DeviceSerial>,
    ) -> Self {
        Self {
            connector,
            settings,
            tasks,
            serial,
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub async fn run(&self) -> Result<RunReport, RunError> {
        let serial = self.pick_device().await?;
        info!(%serial, "using device");

        if !self.settings.assets_dir.is_dir() {
            return Err(RunError::AssetsDirMissing(self.settings.assets_dir.clone()));
        }

        let crafter = ManifestCrafter::new(self.settings.layout());
        match tokio::task::spawn_blocking(move || crafter.ensure_templates()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to prepare manifest templates"),
            Err(err) => warn!(error = %err, "template preparation aborted"),
        }

        let establisher =
            SessionEstablisher::new(Arc::clone(&self.connector), self.settings.timeouts.tunnel);
        let resolver = ContainerResolver::new(
            &self.settings.cache_file,
            self.settings.scan.clone(),
            self.settings.timeouts.identifier_scan,
        );
        let mut link = DeviceLink::default();
        let mut report = RunReport::default();

        for planned in &self.tasks {
            let entry = self
                .run_task(planned, &serial, &establisher, &resolver, &mut link)
                .await;
            info!(asset = %entry.asset, outcome = %entry.outcome, "task finished");
            report.push(entry);
        }

        info!(
            confirmed = report.confirmed(),
            total = report.tasks.len(),
            "run finished"
        );
        Ok(report)
    }

    async fn pick_device(&self) -> Result<DeviceSerial, RunError> {
        if let Some(serial) = &self.serial {
            return Ok(serial.clone());
        }
        let devices = self
            .connector
            .list_devices()
            .await
            .map_err(RunError::DeviceQuery)?;
        select_device(devices)
            .map(|d| d.serial)
            .ok_or(RunError::NoDevice)
    }

    async fn run_task(
        &self,
        planned: &PlannedTask,
        serial: &DeviceSerial,
        establisher: &SessionEstablisher,
        resolver: &ContainerResolver,
        link: &mut DeviceLink,
    ) -> TaskReport {
        let task = &planned.task;
        let asset = task.asset.display().to_string();
        let source = self.settings.assets_dir.join(&task.asset);

        if !source.is_file() {
            warn!(source = %source.display(), "asset not found; skipping");
            return TaskReport {
                run_id: None,
                asset,
                outcome: TaskOutcome::Skipped(TaskError::SourceMissing(source).to_string()),
            };
        }

        let ctx = TaskContext::new(task, planned.asset_name.clone(), &self.settings.workdir);
        let span = info_span!(
            "task",
            run = %ctx.run_id,
            asset = %ctx.asset_name,
            force_restart = ctx.force_restart
        );
        let outcome = async {
            info!(target_path = %ctx.target, "task started");
            match self
                .process(&ctx, &source, serial, establisher, resolver, link)
                .await
            {
                Ok(wait) => TaskOutcome::from(wait),
                Err(err) => {
                    error!(error = %err, "task failed");
                    TaskOutcome::Failed(err.to_string())
                }
            }
        }
        .instrument(span)
        .await;

        TaskReport {
            run_id: Some(ctx.run_id),
            asset,
            outcome,
        }
    }

    async fn process(
        &self,
        ctx: &TaskContext,
        source: &Path,
        serial: &DeviceSerial,
        establisher: &SessionEstablisher,
        resolver: &ContainerResolver,
        link: &mut DeviceLink,
    ) -> Result<WaitOutcome, TaskError> {
        let layout = self.settings.layout();
        let mut scratch = TaskScratch::new();
        scratch.track(ctx.staged_asset.clone());
        scratch.extend(layout.scratch_files());

        tokio::fs::copy(source, &ctx.staged_asset)
            .await
            .map_err(|err| TaskError::Io {
                path: source.to_path_buf(),
                source: err,
            })?;
        debug!(state = %TaskState::Staged, "task state");

        let device = link.session(establisher, serial).await?;
        let container = link.container(resolver, device.as_ref()).await?;
        debug!(state = %TaskState::Connected, container = %container, "task state");

        let signals = CompletionSignals::new();
        let config = ServeConfig {
            root: self.settings.workdir.clone(),
            target_name: ctx.asset_name.clone(),
            extra: layout.servable_names(),
            advertise_host: self.settings.advertise_host,
            listen: self.settings.listen,
        };
        let server = server::spawn(config, signals.clone())
            .ready(self.settings.timeouts.handoff)
            .await?;
        let binding = server.binding();
        info!(url = %binding.url_for(&ctx.asset_name), "asset server running");
        debug!(state = %TaskState::Serving, "task state");

        let crafted = self.craft(ctx, container, binding).await?;
        debug!(state = %TaskState::Crafted, "task state");

        let controller = DeviceController::new(
            device.as_ref(),
            &self.settings.profile,
            self.settings.timeouts.controller,
        );
        let outcome = controller.run(ctx, &crafted, &signals).await;

        server.stop().await;
        Ok(outcome)
    }

    async fn craft(
        &self,
        ctx: &TaskContext,
        container: ContainerId,
        binding: ServedBinding,
    ) -> Result<CraftedManifests, TaskError> {
        let crafter = ManifestCrafter::new(self.settings.layout());
        let target = ctx.target.clone();
        let asset_name = ctx.asset_name.clone();
        let crafted = tokio::task::spawn_blocking(move || {
            crafter.craft(&Redirect {
                target_path: &target,
                asset_name: &asset_name,
                container: &container,
                binding,
            })
        })
        .await??;
        Ok(crafted)
    }
}
