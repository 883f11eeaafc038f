use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use stencil_core::{config, ProgressEvent};

use crate::error::{io_err, DaemonError};
use crate::orchestrator::SyncOrchestrator;
use crate::progress::Subscription;
use crate::paths::{socket_path, stencil_root};
use crate::protocol::{DaemonRequest, DaemonResponse, ProgressMessage};

type RequestLines = Lines<BufReader<OwnedReadHalf>>;

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime: socket server plus ctrl-c handler.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let config = config::load_at(&home)?;
    let orchestrator = SyncOrchestrator::new(&home, &config);
    tracing::info!(
        cache_root = %orchestrator.cache_root().display(),
        busy_policy = ?config.busy_policy,
        "stencil daemon starting",
    );
    serve(home, orchestrator).await
}

/// Host `orchestrator` on the socket under `home` until a `stop` request or
/// ctrl-c.
pub async fn serve(home: PathBuf, orchestrator: SyncOrchestrator) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let started_at_unix = unix_seconds_now();

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                orchestrator,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);

    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("stencil daemon stopped");
    Ok(())
}

async fn socket_server_task(
    home: PathBuf,
    orchestrator: SyncOrchestrator,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let orchestrator = orchestrator.clone();
                let shutdown_tx = shutdown_tx.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        orchestrator,
                        socket,
                        shutdown_tx,
                        started_at_unix,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    orchestrator: SyncOrchestrator,
    socket: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_line(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let mut reader_open = true;
        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(build_status_payload(
                &orchestrator,
                &socket,
                started_at_unix,
            )),
            "sync" => match request.path {
                Some(path) => {
                    let (response, open) =
                        serve_sync(&orchestrator, &path, &mut lines, &mut writer).await?;
                    reader_open = open;
                    response
                }
                None => DaemonResponse::error("sync requires a 'path'"),
            },
            "cancel" => DaemonResponse::error("no sync is running on this connection"),
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_line(&mut writer, &response).await?;
        if request.cmd == "stop" || !reader_open {
            break;
        }
    }

    Ok(())
}

/// Run one sync for this connection, forwarding the events of its own
/// session as they are published. A `cancel` line or EOF on the connection
/// cancels the session.
///
/// Returns the final response and whether the read side is still open.
async fn serve_sync(
    orchestrator: &SyncOrchestrator,
    path: &str,
    lines: &mut RequestLines,
    writer: &mut OwnedWriteHalf,
) -> Result<(DaemonResponse, bool), DaemonError> {
    let cancel = CancellationToken::new();
    let (subscribed_tx, mut subscribed_rx) = oneshot::channel();
    let sync = orchestrator.sync_subscribed(path, cancel.clone(), subscribed_tx);
    tokio::pin!(sync);

    let mut subscription: Option<Subscription> = None;
    let mut awaiting_subscription = true;
    let mut reader_open = true;
    let result = loop {
        tokio::select! {
            biased;
            subscribed = &mut subscribed_rx, if awaiting_subscription => {
                awaiting_subscription = false;
                subscription = subscribed.ok();
            }
            event = next_event(&mut subscription), if subscription.is_some() => match event {
                Some(event) => write_line(writer, &ProgressMessage::from(event)).await?,
                None => {
                    if let Some(ended) = subscription.take() {
                        tracing::warn!(source = %ended.key(), "progress subscription ended early");
                    }
                }
            },
            result = &mut sync => break result,
            line = lines.next_line(), if reader_open => match line {
                Ok(Some(line)) => match serde_json::from_str::<DaemonRequest>(&line) {
                    Ok(request) if request.cmd == "cancel" => {
                        tracing::info!(path, "sync cancelled by client");
                        cancel.cancel();
                    }
                    _ => tracing::warn!(path, line = %line, "ignoring request during sync"),
                },
                Ok(None) | Err(_) => {
                    tracing::info!(path, "client disconnected; cancelling sync");
                    reader_open = false;
                    cancel.cancel();
                }
            },
        }
    };

    if awaiting_subscription {
        subscription = subscribed_rx.try_recv().ok();
    }
    if let Some(subscription) = subscription.as_mut() {
        while let Some(event) = subscription.try_recv() {
            write_line(writer, &ProgressMessage::from(event)).await?;
        }
    }

    let response = match result {
        Ok(outcome) => DaemonResponse::ok(serde_json::to_value(&outcome)?),
        Err(err) => DaemonResponse::rejected(&err),
    };
    Ok((response, reader_open))
}

/// Next event of an invoker subscription; pending while there is none.
async fn next_event(subscription: &mut Option<Subscription>) -> Option<ProgressEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

fn build_status_payload(
    orchestrator: &SyncOrchestrator,
    socket: &Path,
    started_at_unix: u64,
) -> Value {
    let sessions = orchestrator.active_sessions();
    let now = unix_seconds_now();
    json!({
        "running": true,
        "pid": std::process::id(),
        "socket": socket.display().to_string(),
        "cache_root": orchestrator.cache_root().display().to_string(),
        "started_at_unix": started_at_unix,
        "uptime_secs": now.saturating_sub(started_at_unix),
        "active_sessions": sessions,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = stencil_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    Ok(())
}

async fn write_line<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    message: &T,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(message)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` filter; records from the `log` facade are bridged in.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
