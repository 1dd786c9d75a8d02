//! Ephemeral asset server - タスク 1 件分だけ動くローカル HTTP サーバ
//!
//! # フロー
//! 1. `0.0.0.0:0` に bind（ポートは OS 任せ）
//! 2. 広告するアドレスとポートを oneshot で呼び出し側へ渡す
//! 3. 許可リストにあるファイルだけを作業ディレクトリから返す
//! 4. 対象ファイルへの HEAD / GET が 200 で返ったら対応するフラグを立てる
//! 5. タスクの後片付けで `stop()` される
//!
//! # 設計原則
//! - 対象以外のパスはフラグに一切触れない
//! - ハンドオフが期限内に来なければタスク失敗（`TaskError::ServerStart`）

pub mod signals;

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::TaskError;

pub use self::signals::{CompletionSignals, OnceFlag};

const STOP_GRACE: Duration = Duration::from_secs(2);

/// All interfaces, OS-assigned port.
pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Where the device can reach this task's server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServedBinding {
    pub host: IpAddr,
    pub port: u16,
}

impl ServedBinding {
    pub fn url_for(&self, file_name: &str) -> String {
        format!("http://{}/{}", SocketAddr::new(self.host, self.port), file_name)
    }
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub root: PathBuf,
    /// Access to `/<target_name>` drives the completion signals.
    pub target_name: String,
    /// Additional servable file names (the crafted manifest and friends).
    pub extra: Vec<String>,
    /// Address advertised to the device; discovered when `None`.
    pub advertise_host: Option<IpAddr>,
    pub listen: SocketAddr,
}

struct ServeState {
    root: PathBuf,
    target_path: String,
    servable: HashSet<String>,
    signals: CompletionSignals,
}

impl ServeState {
    fn observe(&self, method: &Method, path: &str, status: StatusCode) {
        if status != StatusCode::OK || path != self.target_path {
            return;
        }
        if *method == Method::HEAD && self.signals.header().set() {
            info!(path, "device checked the asset (HEAD)");
        } else if *method == Method::GET && self.signals.body().set() {
            info!(path, "device downloaded the asset (GET)");
        }
    }
}

/// Best guess at the LAN address of this host. No packet is sent.
pub async fn lan_address() -> IpAddr {
    async fn routed_ip() -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(("8.8.8.8", 80)).await?;
        Ok(socket.local_addr()?.ip())
    }
    routed_ip().await.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Server worker that has been spawned but not yet confirmed bound.
pub struct PendingServer {
    binding: oneshot::Receiver<ServedBinding>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PendingServer {
    /// Wait for the bound address handoff.
    pub async fn ready(self, limit: Duration) -> Result<RunningServer, TaskError> {
        match tokio::time::timeout(limit, self.binding).await {
            Ok(Ok(binding)) => Ok(RunningServer {
                binding,
                shutdown: Some(self.shutdown),
                task: self.task,
            }),
            Ok(Err(_)) | Err(_) => {
                self.task.abort();
                Err(TaskError::ServerStart(limit))
            }
        }
    }
}

/// A bound, serving asset server. Aborted on drop if not stopped.
pub struct RunningServer {
    binding: ServedBinding,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub fn binding(&self) -> ServedBinding {
        self.binding
    }

    /// Graceful shutdown. Connections still open after `STOP_GRACE` are
    /// cut when the worker is aborted on drop.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(STOP_GRACE, &mut self.task).await {
            Ok(Err(err)) if !err.is_cancelled() => {
                warn!(error = %err, "asset server worker panicked");
            }
            Ok(_) => {}
            Err(_) => debug!("asset server still draining connections; aborting"),
        }
        debug!(port = self.binding.port, "asset server stopped");
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the server worker on the runtime.
pub fn spawn(config: ServeConfig, signals: CompletionSignals) -> PendingServer {
    let (binding_tx, binding_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(serve(config, signals, binding_tx, shutdown_rx));
    PendingServer {
        binding: binding_rx,
        shutdown: shutdown_tx,
        task,
    }
}

async fn serve(
    config: ServeConfig,
    signals: CompletionSignals,
    binding_tx: oneshot::Sender<ServedBinding>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let listener = match TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(listen = %config.listen, error = %err, "asset server failed to bind");
            return;
        }
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(err) => {
            warn!(error = %err, "asset server has no local address");
            return;
        }
    };
    let host = match config.advertise_host {
        Some(host) => host,
        None => lan_address().await,
    };

    let mut servable: HashSet<String> = config.extra.into_iter().collect();
    servable.insert(config.target_name.clone());
    let state = Arc::new(ServeState {
        root: config.root,
        target_path: format!("/{}", config.target_name),
        servable,
        signals,
    });

    if binding_tx.send(ServedBinding { host, port }).is_err() {
        return;
    }

    let app = Router::new().fallback(handle).with_state(state);
    let shutdown = async {
        let _ = shutdown_rx.await;
    };
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        warn!(error = %err, "asset server terminated with error");
    }
}

async fn handle(State(state): State<Arc<ServeState>>, method: Method, uri: Uri) -> Response {
    let path = uri.path();
    let response = respond(&state, &method, path).await;
    let status = response.status();
    debug!(%method, path, status = status.as_u16(), "asset request");
    state.observe(&method, path, status);
    response
}

async fn respond(state: &ServeState, method: &Method, path: &str) -> Response {
    if *method != Method::GET && *method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(name) = path.strip_prefix('/').filter(|n| state.servable.contains(*n)) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(state.root.join(name)).await {
        Ok(bytes) => {
            let headers = [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_LENGTH, bytes.len().to_string()),
            ];
            let body = if *method == Method::HEAD {
                Body::empty()
            } else {
                Body::from(bytes)
            };
            (StatusCode::OK, headers, body).into_response()
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!(path, error = %err, "failed to read served file");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
