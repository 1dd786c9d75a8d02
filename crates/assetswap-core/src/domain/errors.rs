//! Errors - エラー型と分類
//!
//! 失敗の重さで型を分ける:
//! - `RunError`: 実行全体を中止する（デバイス無し、assets ディレクトリ無し）
//! - `TaskError`: そのタスクだけを打ち切り、次のタスクへ進む
//! - `DeviceError`: デバイス呼び出し 1 回分の失敗。best-effort 呼び出しでは
//!   `BestEffort::Failed` に包まれてログに出るだけ
//!
//! 確認待ちのタイムアウトはエラーではなく `WaitOutcome::TimedOut` で表す。

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::version::VersionParseError;

/// Failure of a single call against the device surface.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected device output: {0}")]
    Parse(String),

    #[error("log stream ended")]
    StreamClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure while crafting the manifest copies.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("sqlite error on {path}: {source}")]
    Sqlite {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to copy {from} -> {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal to the current task; the run continues with the next one.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("source asset not found: {0}")]
    SourceMissing(PathBuf),

    #[error("session establishment failed: {0}")]
    SessionEstablishment(#[source] DeviceError),

    #[error("unsupported OS version: {0}")]
    Version(#[from] VersionParseError),

    #[error("tunnel establishment failed: {0}")]
    TunnelEstablishment(String),

    #[error("container identifier not found: {0}")]
    IdentifierNotFound(String),

    #[error("asset server did not report its binding within {0:?}")]
    ServerStart(Duration),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("background job failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Fatal to the whole run; no task is attempted.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no device found; check the cable and trust this computer on the device")]
    NoDevice,

    #[error("device listing failed: {0}")]
    DeviceQuery(#[source] DeviceError),

    #[error("assets directory not found: {0}")]
    AssetsDirMissing(PathBuf),
}
