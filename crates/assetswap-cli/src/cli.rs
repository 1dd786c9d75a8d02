use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Replace a file on an owned iOS device through the Books asset downloader.
#[derive(Debug, Parser)]
#[command(name = "assetswap", version, about)]
pub struct Cli {
    /// Device to use; defaults to the first USB-attached device.
    #[arg(long, env = "ASSETSWAP_UDID")]
    pub udid: Option<String>,

    /// Directory holding the replacement files.
    #[arg(long, env = "ASSETSWAP_ASSETS_DIR", default_value = "Sounds")]
    pub assets_dir: PathBuf,

    /// Served directory for templates, staged copies and crafted manifests.
    #[arg(long, env = "ASSETSWAP_WORKDIR", default_value = ".")]
    pub workdir: PathBuf,

    /// Container id cache; `<workdir>/uuid.txt` when omitted.
    #[arg(long, env = "ASSETSWAP_CACHE_FILE")]
    pub cache_file: Option<PathBuf>,

    /// JSON array of `{"asset", "target", "force_restart"}`; built-in tasks when omitted.
    #[arg(long)]
    pub tasks: Option<PathBuf>,

    /// Address the device should fetch from; the LAN address when omitted.
    #[arg(long, env = "ASSETSWAP_ADVERTISE_HOST")]
    pub advertise_host: Option<IpAddr>,

    /// Path of the pymobiledevice3 executable.
    #[arg(long = "pymobiledevice3", env = "PYMOBILEDEVICE3", default_value = "pymobiledevice3")]
    pub pymobiledevice3: PathBuf,

    /// Never wrap the tunnel command in sudo.
    #[arg(long)]
    pub no_sudo: bool,

    /// Seconds to wait for the tunnel endpoint.
    #[arg(long, default_value_t = 60)]
    pub tunnel_timeout: u64,

    /// Seconds to search the device log for the container id.
    #[arg(long, default_value_t = 120)]
    pub scan_timeout: u64,

    /// Seconds to wait for the device to download each file.
    #[arg(long, default_value_t = 45)]
    pub confirm_timeout: u64,

    /// Default log level (`RUST_LOG` takes precedence).
    #[arg(long, env = "ASSETSWAP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_the_usual_layout() {
        let cli = Cli::try_parse_from(["assetswap", "--no-sudo"]).unwrap();
        assert_eq!(cli.assets_dir, PathBuf::from("Sounds"));
        assert_eq!(cli.confirm_timeout, 45);
        assert!(cli.no_sudo);
        assert!(cli.tasks.is_none());
    }
}
