//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **PyMobileDevice**: `pymobiledevice3` CLI を叩く本番用
//! - **InMemoryDevice**: 呼び出しを記録し、ログやプロセス一覧を再生するテスト用

pub mod memory;
pub mod pymobiledevice;

// 主要な型を再エクスポート
pub use self::memory::InMemoryDevice;
pub use self::pymobiledevice::PyMobileDevice;
