//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。デバイスへの呼び出し面だけを trait で
//! 定義し、実装（CLI 経由の実機 / インメモリ）は `impls` に置きます。

pub mod device;

pub use self::device::{
    ConnectionKind, DeviceConnector, DeviceDescriptor, DeviceSession, LogRecord, LogStream,
    ProcessInfo, ProcessTable, TunnelCommand, TunnelEndpoint,
};
