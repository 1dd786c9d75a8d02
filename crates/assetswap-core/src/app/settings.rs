//! Settings - 実行全体の設定値
//!
//! 既定値は実機での手順に合わせてある。テストでは待ち時間だけ短くする。

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::controller::{ControllerTiming, DeviceProfile};
use crate::domain::ReplaceTask;
use crate::manifest::ManifestLayout;
use crate::resolver::ScanPattern;
use crate::server::DEFAULT_LISTEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Wall-clock limit of the log scan for the container id.
    pub identifier_scan: Duration,
    /// Limit for the asset server to report its binding.
    pub handoff: Duration,
    /// Limit for the tunnel process to print its endpoint.
    pub tunnel: Duration,
    pub controller: ControllerTiming,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            identifier_scan: Duration::from_secs(120),
            handoff: Duration::from_secs(5),
            tunnel: Duration::from_secs(60),
            controller: ControllerTiming::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the replacement assets.
    pub assets_dir: PathBuf,
    /// Served directory: templates, staged asset and crafted manifests.
    pub workdir: PathBuf,
    pub cache_file: PathBuf,
    /// Address advertised to the device; LAN address when `None`.
    pub advertise_host: Option<IpAddr>,
    /// Local address each task's asset server binds.
    pub listen: SocketAddr,
    pub profile: DeviceProfile,
    pub scan: ScanPattern,
    pub timeouts: Timeouts,
}

impl Settings {
    pub fn new(assets_dir: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        Self {
            assets_dir: assets_dir.into(),
            cache_file: workdir.join("uuid.txt"),
            workdir,
            advertise_host: None,
            listen: DEFAULT_LISTEN,
            profile: DeviceProfile::default(),
            scan: ScanPattern::default(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn layout(&self) -> ManifestLayout {
        ManifestLayout::new(&self.workdir)
    }
}

/// Built-in task list: the two call-recording disclosure tones.
pub fn default_tasks() -> Vec<ReplaceTask> {
    const GREETINGS: &str = "/var/mobile/Library/CallServices/Greetings/default";
    vec![
        ReplaceTask::new(
            "StartDisclosureWithTone.m4a",
            format!("{GREETINGS}/StartDisclosureWithTone.m4a"),
        ),
        ReplaceTask::new("StopDisclosure.caf", format!("{GREETINGS}/StopDisclosure.caf"))
            .with_force_restart(true),
    ]
}
