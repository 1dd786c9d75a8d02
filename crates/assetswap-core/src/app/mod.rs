//! App - アプリケーション層
//!
//! ports と各コンポーネントを組み合わせて、置き換えタスクの実行全体を組み立てる。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder**: 設定とタスクの検証、Pipeline の構築
//! - **Pipeline**: タスクを順に実行し、RunReport を返す
//! - **TaskScratch**: タスク単位の一時ファイルの後片付け
//! - **Settings**: 実行全体の設定値と組み込みタスク

pub mod builder;
pub mod pipeline;
pub mod scratch;
pub mod settings;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, PipelineBuilder};
pub use self::pipeline::Pipeline;
pub use self::scratch::TaskScratch;
pub use self::settings::{Settings, Timeouts, default_tasks};
