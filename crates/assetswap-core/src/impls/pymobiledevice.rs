//! PyMobileDevice - `pymobiledevice3` CLI を子プロセスで叩くデバイス実装
//!
//! # 対応するサブコマンド
//! - 検出: `usbmux list` (JSON)
//! - バージョン: `lockdown info` (JSON の `ProductVersion`)
//! - トンネル: `lockdown start-tunnel --script-mode`（`<host> <port>` を 1 行出力）
//! - ログ: `syslog live`（1 行 1 レコード）
//! - プロセス: `processes ps` (JSON), `developer dvt signal|kill|launch`
//! - ファイル: `afc push|rm|ls`
//!
//! デバイスの指定は直結なら `--udid <serial>`、トンネル経由なら `--rsd <host> <port>`。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::domain::{DeviceError, DeviceSerial};
use crate::ports::{
    ConnectionKind, DeviceConnector, DeviceDescriptor, DeviceSession, LogRecord, LogStream,
    ProcessInfo, ProcessTable, TunnelCommand, TunnelEndpoint,
};

pub const DEFAULT_PROGRAM: &str = "pymobiledevice3";

#[derive(Debug, Clone)]
pub struct PyMobileDevice {
    program: PathBuf,
    elevate_tunnel: bool,
}

impl PyMobileDevice {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            elevate_tunnel: false,
        }
    }

    /// Run the tunnel command through `sudo`.
    pub fn with_elevated_tunnel(mut self, elevate: bool) -> Self {
        self.elevate_tunnel = elevate;
        self
    }

    fn session(&self, target: Vec<String>) -> Arc<dyn DeviceSession> {
        Arc::new(PyMobileDeviceSession {
            program: self.program.clone(),
            target,
        })
    }
}

impl Default for PyMobileDevice {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Run to completion and return stdout; non-zero exit is an error.
async fn run(program: &Path, args: &[String]) -> Result<String, DeviceError> {
    trace!(program = %program.display(), ?args, "running device command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DeviceError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(DeviceError::CommandFailed {
            command: format!("{} {}", program.display(), args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Deserialize)]
struct UsbmuxEntry {
    #[serde(rename = "UniqueDeviceID", alias = "Identifier")]
    udid: String,
    #[serde(rename = "ConnectionType", default)]
    connection: String,
}

pub fn parse_device_list(json: &str) -> Result<Vec<DeviceDescriptor>, DeviceError> {
    let entries: Vec<UsbmuxEntry> =
        serde_json::from_str(json).map_err(|e| DeviceError::Parse(format!("usbmux list: {e}")))?;
    Ok(entries
        .into_iter()
        .map(|entry| DeviceDescriptor {
            serial: DeviceSerial::new(entry.udid),
            connection: if entry.connection.eq_ignore_ascii_case("usb") {
                ConnectionKind::Usb
            } else {
                ConnectionKind::Network
            },
        })
        .collect())
}

pub fn parse_product_version(json: &str) -> Result<String, DeviceError> {
    #[derive(Deserialize)]
    struct Info {
        #[serde(rename = "ProductVersion")]
        product_version: String,
    }
    serde_json::from_str::<Info>(json)
        .map(|info| info.product_version)
        .map_err(|e| DeviceError::Parse(format!("lockdown info: {e}")))
}

pub fn parse_process_table(json: &str) -> Result<ProcessTable, DeviceError> {
    let raw: BTreeMap<String, ProcessInfo> =
        serde_json::from_str(json).map_err(|e| DeviceError::Parse(format!("processes ps: {e}")))?;
    let mut entries = BTreeMap::new();
    for (pid, info) in raw {
        let pid = pid
            .parse::<u32>()
            .map_err(|_| DeviceError::Parse(format!("processes ps: bad pid {pid:?}")))?;
        entries.insert(pid, info);
    }
    Ok(ProcessTable::new(entries))
}

/// `<date> <time> <process>{<image>}[<pid>] <<Level>>: <message>`
///
/// 形式に合わない行は `None`。
pub fn parse_syslog_line(line: &str) -> Option<LogRecord> {
    let pid_end = line.find("] <")?;
    let head = &line[..pid_end];
    let who = &head[..head.rfind('[')?];
    let who = who.rsplit(' ').next()?;
    let executable = who.split('{').next()?;
    let process_name = executable.rsplit('/').next()?;
    if process_name.is_empty() {
        return None;
    }
    let (_, message) = line[pid_end + 3..].split_once(">: ")?;
    Some(LogRecord {
        process_name: process_name.to_string(),
        message: message.to_string(),
    })
}

fn afc_path(remote: &str) -> String {
    if remote.starts_with('/') {
        remote.to_string()
    } else {
        format!("/{remote}")
    }
}

/// Whether an `afc ls` listing of the parent contains `name`.
fn listing_contains(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .map(str::trim)
        .any(|entry| entry.rsplit('/').next() == Some(name))
}

#[async_trait]
impl DeviceConnector for PyMobileDevice {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let out = run(&self.program, &strings(["usbmux", "list"])).await?;
        parse_device_list(&out)
    }

    async fn product_version(&self, serial: &DeviceSerial) -> Result<String, DeviceError> {
        let out = run(
            &self.program,
            &strings(["lockdown", "info", "--udid", serial.as_str()]),
        )
        .await?;
        parse_product_version(&out)
    }

    async fn open_direct(&self, serial: &DeviceSerial) -> Result<Arc<dyn DeviceSession>, DeviceError> {
        Ok(self.session(strings(["--udid", serial.as_str()])))
    }

    fn tunnel_command(&self, serial: &DeviceSerial) -> TunnelCommand {
        TunnelCommand {
            program: self.program.clone(),
            args: strings(["lockdown", "start-tunnel", "--script-mode", "--udid", serial.as_str()]),
            elevate: self.elevate_tunnel,
        }
    }

    async fn open_tunneled(
        &self,
        _serial: &DeviceSerial,
        endpoint: &TunnelEndpoint,
    ) -> Result<Arc<dyn DeviceSession>, DeviceError> {
        Ok(self.session(vec![
            "--rsd".to_string(),
            endpoint.host.clone(),
            endpoint.port.to_string(),
        ]))
    }
}

pub struct PyMobileDeviceSession {
    program: PathBuf,
    /// Device addressing appended to every subcommand.
    target: Vec<String>,
}

impl PyMobileDeviceSession {
    async fn call<const N: usize>(&self, command: [&str; N]) -> Result<String, DeviceError> {
        let mut args = strings(command);
        args.extend(self.target.iter().cloned());
        run(&self.program, &args).await
    }
}

#[async_trait]
impl DeviceSession for PyMobileDeviceSession {
    async fn tail_log(&self) -> Result<LogStream, DeviceError> {
        let mut args = strings(["syslog", "live"]);
        args.extend(self.target.iter().cloned());
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeviceError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or(DeviceError::StreamClosed)?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            // child は tail が終わるまでこのタスクが持つ（drop で kill）
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(record) = parse_syslog_line(&line) {
                                if tx.send(Ok(record)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = tx.send(Err(DeviceError::Io(err))).await;
                            break;
                        }
                    },
                }
            }
            debug!("syslog tail finished");
        });
        Ok(rx)
    }

    async fn list_processes(&self) -> Result<ProcessTable, DeviceError> {
        let out = self.call(["processes", "ps"]).await?;
        parse_process_table(&out)
    }

    async fn send_signal(&self, pid: u32, signal: i32) -> Result<(), DeviceError> {
        let (pid, signal) = (pid.to_string(), signal.to_string());
        self.call(["developer", "dvt", "signal", pid.as_str(), signal.as_str()])
            .await
            .map(drop)
    }

    async fn kill(&self, pid: u32) -> Result<(), DeviceError> {
        let pid = pid.to_string();
        self.call(["developer", "dvt", "kill", pid.as_str()]).await.map(drop)
    }

    async fn launch(&self, bundle_id: &str) -> Result<(), DeviceError> {
        self.call(["developer", "dvt", "launch", bundle_id])
            .await
            .map(drop)
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        let local = local.display().to_string();
        let remote = afc_path(remote);
        self.call(["afc", "push", local.as_str(), remote.as_str()]).await.map(drop)
    }

    async fn remove_file(&self, remote: &str) -> Result<(), DeviceError> {
        let remote = afc_path(remote);
        self.call(["afc", "rm", remote.as_str()]).await.map(drop)
    }

    async fn file_exists(&self, remote: &str) -> Result<bool, DeviceError> {
        let remote = afc_path(remote);
        let (parent, name) = match remote.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((parent, name)) => (parent, name),
            None => ("/", remote.as_str()),
        };
        let listing = self.call(["afc", "ls", parent]).await?;
        Ok(listing_contains(&listing, name))
    }
}
