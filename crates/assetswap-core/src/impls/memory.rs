//! InMemoryDevice - 開発・テスト用のデバイス実装
//!
//! 実機の代わりに呼び出しを記録し、ログやプロセス一覧をスクリプトどおりに返す。
//!
//! # 実装詳細
//! - 状態は `Arc<Mutex<State>>` で共有し、`Clone` したものをセッションとして返す
//! - push されたファイルは「デバイス上のファイル」として集合で管理する
//! - launch 時に任意のフックを呼べる（デバイスがマニフェストを読みに来る動作の再現用）

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{DeviceError, DeviceSerial};
use crate::ports::{
    ConnectionKind, DeviceConnector, DeviceDescriptor, DeviceSession, LogRecord, LogStream,
    ProcessTable, TunnelCommand, TunnelEndpoint,
};

/// A call made against the in-memory device, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    TailLog,
    ListProcesses,
    Signal { pid: u32, signal: i32 },
    Kill { pid: u32 },
    Launch { bundle_id: String },
    Push { local: PathBuf, remote: String },
    Remove { remote: String },
    Exists { remote: String },
}

/// One scripted log-stream item, emitted after `delay`.
#[derive(Debug, Clone)]
pub enum ScriptedLog {
    Record { delay: Duration, record: LogRecord },
    Error { delay: Duration, message: String },
}

impl ScriptedLog {
    pub fn record(process_name: &str, message: &str) -> Self {
        Self::Record {
            delay: Duration::ZERO,
            record: LogRecord {
                process_name: process_name.to_string(),
                message: message.to_string(),
            },
        }
    }

    pub fn after(self, delay: Duration) -> Self {
        match self {
            Self::Record { record, .. } => Self::Record { delay, record },
            Self::Error { message, .. } => Self::Error { delay, message },
        }
    }
}

type LaunchHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct State {
    calls: Vec<DeviceCall>,
    files: HashSet<String>,
    pushed: BTreeMap<String, Vec<u8>>,
    tunneled: Vec<TunnelEndpoint>,
    process_tables: Vec<ProcessTable>,
    failing_pushes: bool,
}

#[derive(Clone)]
pub struct InMemoryDevice {
    version: String,
    devices: Vec<DeviceDescriptor>,
    tunnel: TunnelCommand,
    logs: Vec<ScriptedLog>,
    hold_log_open: bool,
    on_launch: Option<LaunchHook>,
    state: Arc<Mutex<State>>,
}

impl InMemoryDevice {
    pub const SERIAL: &'static str = "00008030-INMEMORY";

    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            devices: vec![DeviceDescriptor {
                serial: DeviceSerial::new(Self::SERIAL),
                connection: ConnectionKind::Usb,
            }],
            tunnel: TunnelCommand {
                program: "false".into(),
                args: Vec::new(),
                elevate: false,
            },
            logs: Vec::new(),
            hold_log_open: false,
            on_launch: None,
            state: Arc::default(),
        }
    }

    pub fn with_devices(mut self, devices: Vec<DeviceDescriptor>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_tunnel_command(mut self, tunnel: TunnelCommand) -> Self {
        self.tunnel = tunnel;
        self
    }

    /// Items emitted by every `tail_log`. With `hold_open` the stream stays
    /// open after the last item instead of ending.
    pub fn with_logs(mut self, logs: Vec<ScriptedLog>, hold_open: bool) -> Self {
        self.logs = logs;
        self.hold_log_open = hold_open;
        self
    }

    /// Tables returned by successive `list_processes`; the last one repeats.
    pub fn with_process_tables(self, tables: Vec<ProcessTable>) -> Self {
        self.state().process_tables = tables;
        self
    }

    pub fn with_failing_pushes(self) -> Self {
        self.state().failing_pushes = true;
        self
    }

    pub fn on_launch(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_launch = Some(Arc::new(hook));
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: DeviceCall) {
        self.state().calls.push(call);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state().calls.clone()
    }

    pub fn tail_log_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, DeviceCall::TailLog))
            .count()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Kill { pid } => Some(*pid),
                _ => None,
            })
            .collect()
    }

    pub fn has_file(&self, remote: &str) -> bool {
        self.state().files.contains(remote)
    }

    /// Bytes of `remote` as they were when pushed.
    pub fn pushed_contents(&self, remote: &str) -> Option<Vec<u8>> {
        self.state().pushed.get(remote).cloned()
    }

    pub fn tunneled_endpoints(&self) -> Vec<TunnelEndpoint> {
        self.state().tunneled.clone()
    }
}

#[async_trait]
impl DeviceConnector for InMemoryDevice {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        Ok(self.devices.clone())
    }

    async fn product_version(&self, _serial: &DeviceSerial) -> Result<String, DeviceError> {
        Ok(self.version.clone())
    }

    async fn open_direct(
        &self,
        _serial: &DeviceSerial,
    ) -> Result<Arc<dyn DeviceSession>, DeviceError> {
        Ok(Arc::new(self.clone()))
    }

    fn tunnel_command(&self, _serial: &DeviceSerial) -> TunnelCommand {
        self.tunnel.clone()
    }

    async fn open_tunneled(
        &self,
        _serial: &DeviceSerial,
        endpoint: &TunnelEndpoint,
    ) -> Result<Arc<dyn DeviceSession>, DeviceError> {
        self.state().tunneled.push(endpoint.clone());
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl DeviceSession for InMemoryDevice {
    async fn tail_log(&self) -> Result<LogStream, DeviceError> {
        self.record(DeviceCall::TailLog);
        let (tx, rx) = mpsc::channel(16);
        let logs = self.logs.clone();
        let hold_open = self.hold_log_open;

        tokio::spawn(async move {
            for item in logs {
                let (delay, sent) = match item {
                    ScriptedLog::Record { delay, record } => (delay, Ok(record)),
                    ScriptedLog::Error { delay, message } => {
                        (delay, Err(DeviceError::Parse(message)))
                    }
                };
                tokio::time::sleep(delay).await;
                if tx.send(sent).await.is_err() {
                    return;
                }
            }
            if hold_open {
                tx.closed().await;
            }
        });

        Ok(rx)
    }

    async fn list_processes(&self) -> Result<ProcessTable, DeviceError> {
        let mut state = self.state();
        state.calls.push(DeviceCall::ListProcesses);
        let table = if state.process_tables.len() > 1 {
            state.process_tables.remove(0)
        } else {
            state.process_tables.first().cloned().unwrap_or_default()
        };
        Ok(table)
    }

    async fn send_signal(&self, pid: u32, signal: i32) -> Result<(), DeviceError> {
        self.record(DeviceCall::Signal { pid, signal });
        Ok(())
    }

    async fn kill(&self, pid: u32) -> Result<(), DeviceError> {
        self.record(DeviceCall::Kill { pid });
        Ok(())
    }

    async fn launch(&self, bundle_id: &str) -> Result<(), DeviceError> {
        self.record(DeviceCall::Launch {
            bundle_id: bundle_id.to_string(),
        });
        if let Some(hook) = &self.on_launch {
            hook(bundle_id);
        }
        Ok(())
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        self.record(DeviceCall::Push {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        if self.state().failing_pushes {
            return Err(DeviceError::CommandFailed {
                command: format!("push {}", local.display()),
                status: "exit status: 1".to_string(),
                stderr: "afc: connection reset".to_string(),
            });
        }
        let bytes = tokio::fs::read(local).await?;
        let mut state = self.state();
        state.files.insert(remote.to_string());
        state.pushed.insert(remote.to_string(), bytes);
        Ok(())
    }

    async fn remove_file(&self, remote: &str) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.calls.push(DeviceCall::Remove {
            remote: remote.to_string(),
        });
        state.files.remove(remote);
        Ok(())
    }

    async fn file_exists(&self, remote: &str) -> Result<bool, DeviceError> {
        let mut state = self.state();
        state.calls.push(DeviceCall::Exists {
            remote: remote.to_string(),
        });
        Ok(state.files.contains(remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_exists_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("tone.m4a");
        std::fs::write(&local, b"audio").unwrap();

        let device = InMemoryDevice::new("16.5");
        device.push_file(&local, "tone.m4a").await.unwrap();
        assert!(device.file_exists("tone.m4a").await.unwrap());
        assert_eq!(device.pushed_contents("tone.m4a").unwrap(), b"audio");

        device.remove_file("tone.m4a").await.unwrap();
        assert!(!device.has_file("tone.m4a"));
    }

    #[tokio::test]
    async fn process_tables_advance_then_repeat() {
        let device = InMemoryDevice::new("16.5").with_process_tables(vec![
            [(1, "Books")].into_iter().collect(),
            [(2, "Books")].into_iter().collect(),
        ]);
        assert_eq!(device.list_processes().await.unwrap().find_pid("Books"), Some(1));
        assert_eq!(device.list_processes().await.unwrap().find_pid("Books"), Some(2));
        assert_eq!(device.list_processes().await.unwrap().find_pid("Books"), Some(2));
    }

    #[tokio::test]
    async fn scripted_log_ends_unless_held() {
        let device = InMemoryDevice::new("16.5")
            .with_logs(vec![ScriptedLog::record("bookassetd", "hello")], false);
        let mut stream = device.tail_log().await.unwrap();
        assert_eq!(stream.recv().await.unwrap().unwrap().message, "hello");
        assert!(stream.recv().await.is_none());
    }
}
