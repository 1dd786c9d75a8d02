//! State - タスクの進行状態
//!
//! ログとテストで「どこまで進んだか」を表すために使う。

use std::fmt;

/// Where a task currently is in its pipeline.
///
/// # 状態遷移
/// - staged: 素材をワークディレクトリへコピー済み
/// - connected: セッションとコンテナ ID を確保済み
/// - serving: アセットサーバ起動済み
/// - crafted: マニフェスト作成済み
/// - uploaded: デバイスへ転送済み
/// - reloading: プロセス操作でマニフェスト再読込を誘発中
/// - waiting: 本体 GET の到着待ち
/// - cleaning: 後片付け
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Staged,
    Connected,
    Serving,
    Crafted,
    Uploaded,
    Reloading,
    Waiting,
    Cleaning,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Staged => "staged",
            Self::Connected => "connected",
            Self::Serving => "serving",
            Self::Crafted => "crafted",
            Self::Uploaded => "uploaded",
            Self::Reloading => "reloading",
            Self::Waiting => "waiting",
            Self::Cleaning => "cleaning",
        };
        f.write_str(s)
    }
}
