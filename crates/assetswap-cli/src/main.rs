mod cli;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use assetswap_core::app::{PipelineBuilder, Settings, default_tasks};
use assetswap_core::domain::{DeviceSerial, ReplaceTask};
use assetswap_core::impls::PyMobileDevice;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let tasks = match &cli.tasks {
        Some(path) => load_tasks(path)?,
        None => default_tasks(),
    };

    let mut settings = Settings::new(&cli.assets_dir, &cli.workdir);
    if let Some(cache_file) = &cli.cache_file {
        settings.cache_file = cache_file.clone();
    }
    settings.advertise_host = cli.advertise_host;
    settings.timeouts.tunnel = Duration::from_secs(cli.tunnel_timeout);
    settings.timeouts.identifier_scan = Duration::from_secs(cli.scan_timeout);
    settings.timeouts.controller.confirmation = Duration::from_secs(cli.confirm_timeout);

    let elevate = !cli.no_sudo && !running_as_root();
    let connector = PyMobileDevice::new(&cli.pymobiledevice3).with_elevated_tunnel(elevate);

    let pipeline = PipelineBuilder::new(Arc::new(connector), settings)
        .tasks(tasks)
        .device(cli.udid.map(DeviceSerial::new))
        .build()?;

    info!(tasks = pipeline.task_count(), "starting run");
    let report = match pipeline.run().await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "run aborted");
            return Ok(ExitCode::FAILURE);
        }
    };

    for task in &report.tasks {
        info!(asset = %task.asset, outcome = %task.outcome, "result");
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err))
}

fn load_tasks(path: &Path) -> Result<Vec<ReplaceTask>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse task file {}", path.display()))
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_file_uses_the_library_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"asset": "Tone.m4a", "target": "/var/mobile/Tone.m4a", "force_restart": true}]"#,
        )
        .unwrap();

        let tasks = load_tasks(&path).unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].force_restart);
    }

    #[test]
    fn unreadable_task_file_names_the_path() {
        let err = load_tasks(Path::new("/nonexistent/tasks.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tasks.json"));
    }
}
