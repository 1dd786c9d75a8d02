//! Container identifier resolution.
//!
//! キャッシュファイルに 10 文字を超える値があればそれを使い、なければ
//! デバイスのライブログを読んで取得デーモンが出力するパスから抜き出す。
//! 見つけたら即座に打ち切り、キャッシュへ書き戻す。

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{ContainerId, TaskError};
use crate::ports::{DeviceSession, LogRecord};

/// Cached values must be strictly longer than this.
pub const CACHE_MIN_LEN: usize = 10;

/// What to look for in the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPattern {
    /// Only records from this process qualify.
    pub process_name: String,
    /// Path prefix that precedes the identifier.
    pub shared_marker: String,
    /// Path component that follows the identifier in download paths.
    pub secondary_marker: String,
    /// Candidates starting with this are system groups, not the app's.
    pub excluded_prefix: String,
    pub min_len: usize,
}

impl Default for ScanPattern {
    fn default() -> Self {
        Self {
            process_name: "bookassetd".to_string(),
            shared_marker: "/var/containers/Shared/SystemGroup/".to_string(),
            secondary_marker: "/Documents/BLDownloads".to_string(),
            excluded_prefix: "systemgroup.com.apple".to_string(),
            min_len: 10,
        }
    }
}

impl ScanPattern {
    /// Identifier carried by `record`, if any.
    pub fn extract(&self, record: &LogRecord) -> Option<ContainerId> {
        if record.process_name != self.process_name {
            return None;
        }
        let (_, tail) = record.message.split_once(self.shared_marker.as_str())?;

        let up_to_separator = tail.split('/').next();
        let up_to_secondary = tail
            .split_once(self.secondary_marker.as_str())
            .map(|(head, _)| head);

        [up_to_separator, up_to_secondary]
            .into_iter()
            .flatten()
            .find(|candidate| self.accepts(candidate))
            .and_then(ContainerId::parse)
    }

    fn accepts(&self, candidate: &str) -> bool {
        candidate.len() >= self.min_len && !candidate.starts_with(self.excluded_prefix.as_str())
    }
}

pub struct ContainerResolver {
    cache_file: PathBuf,
    pattern: ScanPattern,
    deadline: Duration,
}

impl ContainerResolver {
    pub fn new(cache_file: impl Into<PathBuf>, pattern: ScanPattern, deadline: Duration) -> Self {
        Self {
            cache_file: cache_file.into(),
            pattern,
            deadline,
        }
    }

    /// Cached identifier, if the cache holds a usable one.
    pub async fn cached(&self) -> Option<ContainerId> {
        let content = tokio::fs::read_to_string(&self.cache_file).await.ok()?;
        let trimmed = content.trim();
        if trimmed.len() > CACHE_MIN_LEN {
            ContainerId::parse(trimmed)
        } else {
            None
        }
    }

    pub async fn resolve(&self, device: &dyn DeviceSession) -> Result<ContainerId, TaskError> {
        if let Some(id) = self.cached().await {
            debug!(container = %id, cache = %self.cache_file.display(), "using cached container id");
            return Ok(id);
        }

        let id = self.scan(device).await?;
        match tokio::fs::write(&self.cache_file, id.as_str()).await {
            Ok(()) => info!(container = %id, cache = %self.cache_file.display(), "container id saved"),
            Err(err) => warn!(
                container = %id,
                cache = %self.cache_file.display(),
                error = %err,
                "failed to persist container id"
            ),
        }
        Ok(id)
    }

    async fn scan(&self, device: &dyn DeviceSession) -> Result<ContainerId, TaskError> {
        info!(
            process = %self.pattern.process_name,
            "searching log for container id; open the Books app and start a download (or open any book)"
        );

        let mut stream = device
            .tail_log()
            .await
            .map_err(|err| TaskError::IdentifierNotFound(format!("log stream: {err}")))?;
        let started = Instant::now();

        // 締め切りはレコード到着ごとに確認する（タイマーでは起こさない）
        while let Some(item) = stream.recv().await {
            if started.elapsed() > self.deadline {
                return Err(TaskError::IdentifierNotFound(format!(
                    "no match within {:?}",
                    self.deadline
                )));
            }
            let record = item
                .map_err(|err| TaskError::IdentifierNotFound(format!("log stream: {err}")))?;
            if let Some(id) = self.pattern.extract(&record) {
                info!(container = %id, "container id found");
                return Ok(id);
            }
        }

        Err(TaskError::IdentifierNotFound("log stream ended".to_string()))
    }
}
