//! assetswap-core
//!
//! Redirects the Books asset fetcher on an owned iOS device so that it
//! downloads an operator-supplied file to an arbitrary device path.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, version, task, outcome, state, errors）
//! - **ports**: デバイス通信の抽象化（DeviceConnector, DeviceSession）
//! - **session**: OS バージョンに応じた直結 / トンネル経由のセッション確立
//! - **resolver**: ログからのコンテナ ID 抽出とキャッシュ
//! - **server**: タスク単位の HTTP 配信サーバと完了シグナル
//! - **manifest**: ダウンロード用マニフェストの作業コピー作成
//! - **controller**: アップロードとプロセス操作、確認待ち
//! - **app**: 設定・構築・パイプライン
//! - **impls**: ports の実装（pymobiledevice3 CLI, インメモリ）

pub mod app;
pub mod controller;
pub mod domain;
pub mod impls;
pub mod manifest;
pub mod ports;
pub mod resolver;
pub mod server;
pub mod session;
