//! Device ports - デバイス通信の抽象化
//!
//! 実機との通信スタック（usbmux / lockdown / DVT / AFC / トンネル）は外部の
//! 協力者として扱い、ここでは呼び出し面だけを trait で定義します。
//!
//! # 実装
//! - `impls::pymobiledevice`: `pymobiledevice3` CLI を子プロセスで叩く本番用
//! - `impls::memory`: 呼び出しを記録するテスト用

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{DeviceError, DeviceSerial};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    Usb,
    Network,
}

/// One entry of the attached-device listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub serial: DeviceSerial,
    pub connection: ConnectionKind,
}

/// One line of the device's unified log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Executable name of the emitting process (basename only).
    pub process_name: String,
    pub message: String,
}

/// Live log tail. Dropping the receiver stops the tail.
pub type LogStream = mpsc::Receiver<Result<LogRecord, DeviceError>>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessInfo {
    #[serde(rename = "ProcessName")]
    pub name: String,
}

/// Snapshot of running processes keyed by pid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessTable(BTreeMap<u32, ProcessInfo>);

impl ProcessTable {
    pub fn new(entries: BTreeMap<u32, ProcessInfo>) -> Self {
        Self(entries)
    }

    /// Lowest pid whose name matches exactly.
    pub fn find_pid(&self, name: &str) -> Option<u32> {
        self.0
            .iter()
            .find(|(_, info)| info.name == name)
            .map(|(pid, _)| *pid)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u32, &'static str)> for ProcessTable {
    fn from_iter<T: IntoIterator<Item = (u32, &'static str)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(pid, name)| {
                    (
                        pid,
                        ProcessInfo {
                            name: name.to_string(),
                        },
                    )
                })
                .collect(),
        )
    }
}

/// Address of the negotiated secure tunnel (`<address> <port>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for TunnelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.host, self.port)
    }
}

/// Process that negotiates a tunnel and prints its endpoint on stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Run through `sudo` (tunnel creation needs root on most hosts).
    pub elevate: bool,
}

/// Entry point to the device: discovery and session opening.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    /// Raw `ProductVersion` string, e.g. `"17.1"`.
    async fn product_version(&self, serial: &DeviceSerial) -> Result<String, DeviceError>;

    async fn open_direct(&self, serial: &DeviceSerial)
    -> Result<Arc<dyn DeviceSession>, DeviceError>;

    fn tunnel_command(&self, serial: &DeviceSerial) -> TunnelCommand;

    async fn open_tunneled(
        &self,
        serial: &DeviceSerial,
        endpoint: &TunnelEndpoint,
    ) -> Result<Arc<dyn DeviceSession>, DeviceError>;
}

/// Control session against one device.
///
/// # 設計原則
/// - 呼び出しはすべて独立（前の失敗が次の呼び出しに影響しない）
/// - best-effort かどうかは呼び出し側が決める
#[async_trait]
pub trait DeviceSession: Send + Sync {
    async fn tail_log(&self) -> Result<LogStream, DeviceError>;

    async fn list_processes(&self) -> Result<ProcessTable, DeviceError>;

    async fn send_signal(&self, pid: u32, signal: i32) -> Result<(), DeviceError>;

    async fn kill(&self, pid: u32) -> Result<(), DeviceError>;

    async fn launch(&self, bundle_id: &str) -> Result<(), DeviceError>;

    /// `remote` is relative to the media root of the device.
    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), DeviceError>;

    async fn remove_file(&self, remote: &str) -> Result<(), DeviceError>;

    async fn file_exists(&self, remote: &str) -> Result<bool, DeviceError>;
}
