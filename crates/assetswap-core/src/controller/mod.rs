//! Device-side controller - アップロードとプロセス操作でマニフェストを再読込させる
//!
//! # フロー（1 タスク分）
//! 1. プロセス一覧を取得
//! 2. 取得デーモンを停止シグナル、アプリを kill
//! 3. 素材と download-list（＋補助ファイル）をアップロード
//! 4. 再読込を誘発するデーモンを kill
//! 5. 少し待つ
//! 6. 一覧を取り直し、デーモンとアプリを kill → アプリを起動
//! 7. 本体 GET を待つ（確認 or タイムアウト）
//! 8. アップロードした素材がまだあれば削除
//! 9. force-restart なら shell/UI プロセスを kill
//!
//! デバイス呼び出しはすべて best-effort。失敗はログに出すだけで手順は止めない。
//! ローカルの一時ファイル削除（手順 10）はパイプライン側のスコープガードが持つ。

pub mod wait;

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::{BestEffort, TaskContext, TaskState, WaitOutcome};
use crate::manifest::{AUX_SUFFIXES, CraftedManifests};
use crate::ports::{DeviceSession, ProcessTable};
use crate::server::CompletionSignals;

pub use self::wait::wait_for_confirmation;

/// Names of the on-device actors involved in the reload sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Background daemon that performs the asset fetch.
    pub fetch_daemon: String,
    /// Foreground application process name.
    pub app_process: String,
    pub app_bundle_id: String,
    /// Daemon whose restart makes the fetch daemon re-read its manifest.
    pub reload_daemon: String,
    /// Shell/UI process terminated for a forced restart.
    pub shell_process: String,
    pub suspend_signal: i32,
    /// Upload destination of the crafted download-list, relative to the media root.
    pub remote_download_list: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            fetch_daemon: "bookassetd".to_string(),
            app_process: "Books".to_string(),
            app_bundle_id: "com.apple.iBooks".to_string(),
            reload_daemon: "itunesstored".to_string(),
            shell_process: "SpringBoard".to_string(),
            suspend_signal: 19,
            remote_download_list: "Downloads/downloads.28.sqlitedb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerTiming {
    pub settle: Duration,
    pub confirmation: Duration,
    pub poll: Duration,
}

impl Default for ControllerTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            confirmation: Duration::from_secs(45),
            poll: Duration::from_millis(100),
        }
    }
}

pub struct DeviceController<'a> {
    device: &'a dyn DeviceSession,
    profile: &'a DeviceProfile,
    timing: ControllerTiming,
}

impl<'a> DeviceController<'a> {
    pub fn new(
        device: &'a dyn DeviceSession,
        profile: &'a DeviceProfile,
        timing: ControllerTiming,
    ) -> Self {
        Self {
            device,
            profile,
            timing,
        }
    }

    /// Run steps 1–9 for one task and report how the wait ended.
    pub async fn run(
        &self,
        ctx: &TaskContext,
        crafted: &CraftedManifests,
        signals: &CompletionSignals,
    ) -> WaitOutcome {
        let procs = self.snapshot().await;
        self.signal_named(&procs, &self.profile.fetch_daemon, self.profile.suspend_signal)
            .await;
        self.kill_named(&procs, &self.profile.app_process).await;

        self.upload(ctx, crafted).await;
        debug!(state = %TaskState::Uploaded, "task state");

        self.kill_named(&procs, &self.profile.reload_daemon).await;
        tokio::time::sleep(self.timing.settle).await;

        debug!(state = %TaskState::Reloading, "task state");
        let procs = self.snapshot().await;
        self.kill_named(&procs, &self.profile.fetch_daemon).await;
        self.kill_named(&procs, &self.profile.app_process).await;
        BestEffort::from_result(self.device.launch(&self.profile.app_bundle_id).await)
            .log("launch app");

        debug!(state = %TaskState::Waiting, "task state");
        info!("waiting for the device to download the asset");
        let outcome = wait_for_confirmation(
            signals.body(),
            self.timing.confirmation,
            self.timing.poll,
        )
        .await;
        match outcome {
            WaitOutcome::Confirmed => info!("asset fetched by the device; file replaced"),
            WaitOutcome::TimedOut => warn!(
                limit = ?self.timing.confirmation,
                header_seen = signals.header().is_set(),
                "timed out waiting for the device; check it is on the same network"
            ),
        }

        debug!(state = %TaskState::Cleaning, "task state");
        self.remove_uploaded(&ctx.asset_name).await;

        if ctx.force_restart {
            info!(process = %self.profile.shell_process, "restarting the device shell");
            self.kill_named(&procs, &self.profile.shell_process).await;
        }

        outcome
    }

    async fn snapshot(&self) -> ProcessTable {
        match self.device.list_processes().await {
            Ok(table) => {
                debug!(processes = table.len(), "process list");
                table
            }
            Err(err) => {
                warn!(error = %err, "process listing failed; continuing without pids");
                ProcessTable::default()
            }
        }
    }

    async fn signal_named(&self, procs: &ProcessTable, name: &str, signal: i32) -> BestEffort {
        let action = format!("signal {signal} to {name}");
        let outcome = match procs.find_pid(name) {
            Some(pid) => BestEffort::from_result(self.device.send_signal(pid, signal).await),
            None => BestEffort::skipped("not running"),
        };
        outcome.log(&action)
    }

    async fn kill_named(&self, procs: &ProcessTable, name: &str) -> BestEffort {
        let action = format!("kill {name}");
        let outcome = match procs.find_pid(name) {
            Some(pid) => BestEffort::from_result(self.device.kill(pid).await),
            None => BestEffort::skipped("not running"),
        };
        outcome.log(&action)
    }

    async fn push(&self, local: &Path, remote: &str) -> BestEffort {
        let outcome = BestEffort::from_result(self.device.push_file(local, remote).await);
        if let BestEffort::Failed(err) = &outcome {
            warn!(local = %local.display(), remote, error = %err, "upload failed");
        }
        outcome
    }

    async fn upload(&self, ctx: &TaskContext, crafted: &CraftedManifests) {
        info!(asset = %ctx.asset_name, "uploading asset");
        self.push(&ctx.staged_asset, &ctx.asset_name).await;
        self.push(&crafted.download_list, &self.profile.remote_download_list)
            .await;

        for (local, suffix) in crafted.download_list_aux.iter().zip(AUX_SUFFIXES) {
            if !local.exists() {
                debug!(local = %local.display(), "no auxiliary file to upload");
                continue;
            }
            let remote = format!("{}{suffix}", self.profile.remote_download_list);
            self.push(local, &remote).await;
        }
    }

    async fn remove_uploaded(&self, remote: &str) -> BestEffort {
        let outcome = match self.device.file_exists(remote).await {
            Ok(true) => BestEffort::from_result(self.device.remove_file(remote).await),
            Ok(false) => BestEffort::skipped("already gone"),
            Err(err) => BestEffort::Failed(err),
        };
        outcome.log("remove uploaded asset")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReplaceTask;
    use crate::impls::memory::{DeviceCall, InMemoryDevice};

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: TaskContext,
        crafted: CraftedManifests,
    }

    fn fixture(force_restart: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let task = ReplaceTask::new("tone.m4a", "/var/mobile/tone.m4a").with_force_restart(force_restart);
        let ctx = TaskContext::new(&task, "tone.m4a".to_string(), dir.path());
        std::fs::write(&ctx.staged_asset, b"audio").unwrap();
        let download_list = dir.path().join("working_DL.sqlitedb");
        std::fs::write(&download_list, b"db").unwrap();
        let crafted = CraftedManifests {
            asset_info: dir.path().join("working_BL.sqlite"),
            download_list,
            download_list_aux: [
                dir.path().join("working_DL.sqlitedb-shm"),
                dir.path().join("working_DL.sqlitedb-wal"),
            ],
        };
        Fixture {
            _dir: dir,
            ctx,
            crafted,
        }
    }

    fn tables() -> Vec<ProcessTable> {
        vec![
            [(10, "bookassetd"), (20, "Books"), (30, "itunesstored"), (1, "SpringBoard")]
                .into_iter()
                .collect(),
            [(11, "bookassetd"), (21, "Books"), (1, "SpringBoard")]
                .into_iter()
                .collect(),
        ]
    }

    fn confirming(device: InMemoryDevice, signals: &CompletionSignals) -> InMemoryDevice {
        let signals = signals.clone();
        device.on_launch(move |_| {
            signals.body().set();
        })
    }

    #[tokio::test(start_paused = true)]
    async fn runs_the_reload_sequence_in_order() {
        let fx = fixture(false);
        let signals = CompletionSignals::new();
        let device = confirming(InMemoryDevice::new("16.5").with_process_tables(tables()), &signals);
        let profile = DeviceProfile::default();

        let outcome = DeviceController::new(&device, &profile, ControllerTiming::default())
            .run(&fx.ctx, &fx.crafted, &signals)
            .await;

        assert_eq!(outcome, WaitOutcome::Confirmed);
        assert_eq!(
            device.calls(),
            vec![
                DeviceCall::ListProcesses,
                DeviceCall::Signal { pid: 10, signal: 19 },
                DeviceCall::Kill { pid: 20 },
                DeviceCall::Push {
                    local: fx.ctx.staged_asset.clone(),
                    remote: "tone.m4a".into()
                },
                DeviceCall::Push {
                    local: fx.crafted.download_list.clone(),
                    remote: "Downloads/downloads.28.sqlitedb".into()
                },
                DeviceCall::Kill { pid: 30 },
                DeviceCall::ListProcesses,
                DeviceCall::Kill { pid: 11 },
                DeviceCall::Kill { pid: 21 },
                DeviceCall::Launch {
                    bundle_id: "com.apple.iBooks".into()
                },
                DeviceCall::Exists {
                    remote: "tone.m4a".into()
                },
                DeviceCall::Remove {
                    remote: "tone.m4a".into()
                },
            ]
        );
        assert!(!device.has_file("tone.m4a"));
    }

    #[tokio::test(start_paused = true)]
    async fn auxiliary_files_are_pushed_when_present() {
        let fx = fixture(false);
        std::fs::write(&fx.crafted.download_list_aux[1], b"wal").unwrap();
        let signals = CompletionSignals::new();
        let device = confirming(InMemoryDevice::new("16.5"), &signals);
        let profile = DeviceProfile::default();

        DeviceController::new(&device, &profile, ControllerTiming::default())
            .run(&fx.ctx, &fx.crafted, &signals)
            .await;

        let remotes: Vec<String> = device
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Push { remote, .. } => Some(remote),
                _ => None,
            })
            .collect();
        assert_eq!(
            remotes,
            [
                "tone.m4a",
                "Downloads/downloads.28.sqlitedb",
                "Downloads/downloads.28.sqlitedb-wal"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_uploads_do_not_stop_the_sequence() {
        let fx = fixture(false);
        let signals = CompletionSignals::new();
        let device = InMemoryDevice::new("16.5")
            .with_process_tables(tables())
            .with_failing_pushes();
        let profile = DeviceProfile::default();

        let outcome = DeviceController::new(&device, &profile, ControllerTiming::default())
            .run(&fx.ctx, &fx.crafted, &signals)
            .await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        let calls = device.calls();
        assert!(calls.contains(&DeviceCall::Kill { pid: 30 }));
        assert!(calls.contains(&DeviceCall::Launch {
            bundle_id: "com.apple.iBooks".into()
        }));
        assert!(!calls.iter().any(|c| matches!(c, DeviceCall::Remove { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn force_restart_kills_the_shell_after_waiting() {
        let fx = fixture(true);
        let signals = CompletionSignals::new();
        let device = confirming(InMemoryDevice::new("16.5").with_process_tables(tables()), &signals);
        let profile = DeviceProfile::default();

        DeviceController::new(&device, &profile, ControllerTiming::default())
            .run(&fx.ctx, &fx.crafted, &signals)
            .await;

        let calls = device.calls();
        assert_eq!(calls.last(), Some(&DeviceCall::Kill { pid: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn absent_processes_are_skipped() {
        let fx = fixture(true);
        let signals = CompletionSignals::new();
        let device = confirming(InMemoryDevice::new("16.5"), &signals);
        let profile = DeviceProfile::default();

        let outcome = DeviceController::new(&device, &profile, ControllerTiming::default())
            .run(&fx.ctx, &fx.crafted, &signals)
            .await;

        assert_eq!(outcome, WaitOutcome::Confirmed);
        assert!(device.killed().is_empty());
    }
}
