//! Session establishment - デバイスとの制御セッションを開く
//!
//! # フロー
//! 1. `ProductVersion` を取得して `OsVersion` にパース
//! 2. 17.0 以上ならトンネルを交渉し、その endpoint 経由で開く
//! 3. それ未満なら直接開く
//!
//! 1 回の実行で 1 セッション。パイプラインが最初に必要になった時点で開き、
//! 以降のタスクで使い回す。

pub mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::domain::{DeviceSerial, OsVersion, TaskError};
use crate::ports::{
    ConnectionKind, DeviceConnector, DeviceDescriptor, DeviceSession, TunnelEndpoint,
};

pub use self::tunnel::{Tunnel, parse_endpoint_line};

/// First version whose control services require the tunnel.
pub const TUNNEL_MIN_VERSION: OsVersion = OsVersion::new(17, 0, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPlan {
    Direct,
    Tunnel,
}

impl TransportPlan {
    pub fn for_version(version: &OsVersion) -> Self {
        if *version >= TUNNEL_MIN_VERSION {
            Self::Tunnel
        } else {
            Self::Direct
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Direct,
    Tunnel(TunnelEndpoint),
}

/// The run's single control session.
pub struct EstablishedSession {
    pub serial: DeviceSerial,
    pub version: OsVersion,
    pub transport: Transport,
    session: Arc<dyn DeviceSession>,
    _tunnel: Option<Tunnel>,
}

impl EstablishedSession {
    pub fn device(&self) -> Arc<dyn DeviceSession> {
        Arc::clone(&self.session)
    }
}

/// Prefer a USB-attached device, otherwise the first one listed.
pub fn select_device(devices: Vec<DeviceDescriptor>) -> Option<DeviceDescriptor> {
    let usb = devices
        .iter()
        .position(|d| d.connection == ConnectionKind::Usb);
    match usb {
        Some(index) => devices.into_iter().nth(index),
        None => devices.into_iter().next(),
    }
}

pub struct SessionEstablisher {
    connector: Arc<dyn DeviceConnector>,
    tunnel_timeout: Duration,
}

impl SessionEstablisher {
    pub fn new(connector: Arc<dyn DeviceConnector>, tunnel_timeout: Duration) -> Self {
        Self {
            connector,
            tunnel_timeout,
        }
    }

    pub async fn establish(&self, serial: &DeviceSerial) -> Result<EstablishedSession, TaskError> {
        let raw = self
            .connector
            .product_version(serial)
            .await
            .map_err(TaskError::SessionEstablishment)?;
        let version: OsVersion = raw.parse()?;
        let plan = TransportPlan::for_version(&version);
        info!(%serial, %version, ?plan, "opening session");

        match plan {
            TransportPlan::Direct => {
                let session = self
                    .connector
                    .open_direct(serial)
                    .await
                    .map_err(TaskError::SessionEstablishment)?;
                Ok(EstablishedSession {
                    serial: serial.clone(),
                    version,
                    transport: Transport::Direct,
                    session,
                    _tunnel: None,
                })
            }
            TransportPlan::Tunnel => {
                let command = self.connector.tunnel_command(serial);
                let tunnel = tunnel::negotiate(&command, self.tunnel_timeout).await?;
                let session = self
                    .connector
                    .open_tunneled(serial, &tunnel.endpoint)
                    .await
                    .map_err(TaskError::SessionEstablishment)?;
                Ok(EstablishedSession {
                    serial: serial.clone(),
                    version,
                    transport: Transport::Tunnel(tunnel.endpoint.clone()),
                    session,
                    _tunnel: Some(tunnel),
                })
            }
        }
    }
}
