//! Tunnel negotiation for devices that no longer expose control services
//! over the direct transport.
//!
//! 交渉プロセスを起動し、標準出力を 1 行ずつ読んで `<address> <port>` 形式の
//! 行が出るまで待つ。プロセスはセッションが生きている間トンネルを維持するので、
//! `Tunnel` が drop されるまで kill しない。
//!
//! 注意: `elevate` のとき drop で SIGKILL されるのは `sudo` 自身で、sudo は
//! SIGKILL を子へ中継できない。昇格した交渉プロセスは残ることがあるので、
//! 必要なら operator が止める（例: `sudo pkill -f start-tunnel`）。

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::domain::TaskError;
use crate::ports::{TunnelCommand, TunnelEndpoint};

/// A live tunnel. The negotiation process is killed on drop.
#[derive(Debug)]
pub struct Tunnel {
    pub endpoint: TunnelEndpoint,
    _child: Child,
}

/// Parse one line of negotiation output. Exactly two tokens are expected.
pub fn parse_endpoint_line(line: &str) -> Option<TunnelEndpoint> {
    let mut tokens = line.split_whitespace();
    let host = tokens.next()?;
    let port = tokens.next()?.parse::<u16>().ok()?;
    if tokens.next().is_some() || port == 0 {
        return None;
    }
    Some(TunnelEndpoint {
        host: host.to_string(),
        port,
    })
}

fn build_command(command: &TunnelCommand) -> Command {
    let mut cmd = if command.elevate {
        let mut cmd = Command::new("sudo");
        cmd.arg(&command.program);
        cmd
    } else {
        Command::new(&command.program)
    };
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        // sudo のパスワードプロンプトや交渉プロセスのエラーは operator に見せる
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

/// Spawn the negotiation process and wait (at most `limit`) for its endpoint.
pub async fn negotiate(command: &TunnelCommand, limit: Duration) -> Result<Tunnel, TaskError> {
    info!(program = %command.program.display(), elevate = command.elevate, "creating tunnel");

    let mut child = build_command(command).spawn().map_err(|err| {
        TaskError::TunnelEstablishment(format!(
            "failed to spawn {}: {err}",
            command.program.display()
        ))
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        TaskError::TunnelEstablishment("negotiation process has no stdout".to_string())
    })?;
    let mut lines = BufReader::new(stdout).lines();

    let scan = async {
        while let Some(line) = lines.next_line().await? {
            if let Some(endpoint) = parse_endpoint_line(&line) {
                return Ok(Some(endpoint));
            }
            debug!(%line, "ignoring tunnel output");
        }
        Ok::<_, std::io::Error>(None)
    };

    let endpoint = match tokio::time::timeout(limit, scan).await {
        Err(_) => {
            return Err(TaskError::TunnelEstablishment(format!(
                "no endpoint reported within {limit:?}"
            )));
        }
        Ok(Err(err)) => {
            return Err(TaskError::TunnelEstablishment(format!(
                "failed to read negotiation output: {err}"
            )));
        }
        Ok(Ok(None)) => {
            let status = child
                .wait()
                .await
                .map(|s| s.to_string())
                .unwrap_or_else(|err| err.to_string());
            return Err(TaskError::TunnelEstablishment(format!(
                "negotiation process exited ({status}) without reporting an endpoint"
            )));
        }
        Ok(Ok(Some(endpoint))) => endpoint,
    };

    // Keep draining stdout so the process never blocks on a full pipe.
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(%line, "tunnel output");
        }
    });

    info!(%endpoint, "tunnel ready");
    Ok(Tunnel {
        endpoint,
        _child: child,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn command(elevate: bool) -> TunnelCommand {
        TunnelCommand {
            program: "/usr/local/bin/pymobiledevice3".into(),
            args: vec!["lockdown".into(), "start-tunnel".into()],
            elevate,
        }
    }

    fn argv(cmd: &Command) -> (String, Vec<String>) {
        let std = cmd.as_std();
        (
            std.get_program().to_string_lossy().into_owned(),
            std.get_args().map(|a| a.to_string_lossy().into_owned()).collect(),
        )
    }

    #[test]
    fn elevated_command_runs_the_program_under_sudo() {
        let (program, args) = argv(&build_command(&command(true)));
        assert_eq!(program, "sudo");
        assert_eq!(
            args,
            ["/usr/local/bin/pymobiledevice3", "lockdown", "start-tunnel"]
        );

        let (program, args) = argv(&build_command(&command(false)));
        assert_eq!(program, "/usr/local/bin/pymobiledevice3");
        assert_eq!(args, ["lockdown", "start-tunnel"]);
    }

    #[rstest]
    #[case("fd7a:1d4c::1 58783", "fd7a:1d4c::1", 58783)]
    #[case("  127.0.0.1   49152 ", "127.0.0.1", 49152)]
    fn parses_endpoint_lines(#[case] line: &str, #[case] host: &str, #[case] port: u16) {
        let ep = parse_endpoint_line(line).unwrap();
        assert_eq!(ep.host, host);
        assert_eq!(ep.port, port);
    }

    #[rstest]
    #[case("")]
    #[case("Interface: utun4")]
    #[case("127.0.0.1 notaport")]
    #[case("127.0.0.1 80 extra")]
    #[case("127.0.0.1 0")]
    fn rejects_other_lines(#[case] line: &str) {
        assert!(parse_endpoint_line(line).is_none());
    }

    #[cfg(unix)]
    fn sh(script: &str) -> TunnelCommand {
        TunnelCommand {
            program: "sh".into(),
            args: vec!["-c".to_string(), script.to_string()],
            elevate: false,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn skips_noise_until_endpoint() {
        let tunnel = negotiate(
            &sh("echo 'starting tunnel'; echo '::1 61234'; sleep 5"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(tunnel.endpoint.host, "::1");
        assert_eq!(tunnel.endpoint.port, 61234);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_without_endpoint_is_tunnel_error() {
        let err = negotiate(&sh("echo 'pairing failed'; exit 1"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::TunnelEstablishment(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_process_hits_bound() {
        let err = negotiate(&sh("sleep 10"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("within"));
    }
}
