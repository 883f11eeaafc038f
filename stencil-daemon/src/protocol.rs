use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stencil_core::{ProgressEvent, SyncStatus};

use crate::error::{io_err, DaemonError, InvocationError, InvocationErrorKind};
use crate::paths::socket_path;

pub const SYNC_MESSAGE_EVENT: &str = "syncMessage";

/// JSON newline-delimited request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            path: None,
        }
    }

    pub fn sync(path: impl Into<String>) -> Self {
        Self {
            cmd: "sync".to_string(),
            path: Some(path.into()),
        }
    }
}

/// JSON newline-delimited response; always the last line for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<InvocationErrorKind>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            kind: None,
        }
    }

    pub fn rejected(err: &InvocationError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
            kind: Some(err.kind()),
        }
    }
}

/// One forwarded progress event, written before the final response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub event: String,
    pub status: SyncStatus,
    pub progress: u8,
}

impl From<ProgressEvent> for ProgressMessage {
    fn from(event: ProgressEvent) -> Self {
        Self {
            event: SYNC_MESSAGE_EVENT.to_string(),
            status: event.status,
            progress: event.progress,
        }
    }
}

impl From<&ProgressMessage> for ProgressEvent {
    fn from(message: &ProgressMessage) -> Self {
        ProgressEvent::new(message.status, message.progress)
    }
}

/// Any line the daemon may write back.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerLine {
    Event(ProgressMessage),
    Response(DaemonResponse),
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    read_exchange(home, request, &mut |_: &ProgressMessage| {})
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

/// Ask the daemon to sync `path`, calling `on_event` for every forwarded
/// progress event, and return the outcome once the session is terminal.
pub fn request_sync(
    home: &Path,
    path: &str,
    mut on_event: impl FnMut(ProgressEvent),
) -> Result<Value, DaemonError> {
    let response = read_exchange(home, &DaemonRequest::sync(path), &mut |message: &ProgressMessage| {
        on_event(ProgressEvent::from(message))
    })?;
    response_into_data(response)
}

fn read_exchange(
    home: &Path,
    request: &DaemonRequest,
    on_event: &mut dyn FnMut(&ProgressMessage),
) -> Result<DaemonResponse, DaemonError> {
    let (mut stream, socket) = connect(home)?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| io_err(&socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "daemon closed connection before responding".to_string(),
            ));
        }
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ServerLine>(line.trim_end())? {
            ServerLine::Event(message) => on_event(&message),
            ServerLine::Response(response) => return Ok(response),
        }
    }
}

fn connect(home: &Path) -> Result<(UnixStream, PathBuf), DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;
    Ok((stream, socket))
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let message = response
        .error
        .unwrap_or_else(|| "unknown daemon error".to_string());
    match response.kind {
        Some(kind) => Err(DaemonError::Rejected { kind, message }),
        None => Err(DaemonError::Protocol(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_lines_distinguish_events_from_responses() {
        let event: ServerLine =
            serde_json::from_str(r#"{"event":"syncMessage","status":"Updating","progress":40}"#)
                .expect("event line");
        match event {
            ServerLine::Event(message) => {
                assert_eq!(
                    ProgressEvent::from(&message),
                    ProgressEvent::new(SyncStatus::Updating, 40)
                );
            }
            other => panic!("expected event, got {other:?}"),
        }

        let response: ServerLine =
            serde_json::from_str(r#"{"ok":false,"error":"invalid path 'x': nope","kind":"InvalidPath"}"#)
                .expect("response line");
        match response {
            ServerLine::Response(response) => {
                let err = response_into_data(response).expect_err("rejected");
                assert!(matches!(
                    err,
                    DaemonError::Rejected {
                        kind: InvocationErrorKind::InvalidPath,
                        ..
                    }
                ));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn progress_message_wire_shape() {
        let message = ProgressMessage::from(ProgressEvent::new(SyncStatus::UpdateNotRequired, 100));
        let json = serde_json::to_value(&message).expect("encode");
        assert_eq!(
            json,
            serde_json::json!({"event": "syncMessage", "status": "UpdateNotRequired", "progress": 100})
        );
    }

    #[test]
    fn missing_socket_reports_not_running() {
        let home = tempfile::TempDir::new().expect("home");
        let err = send_request(home.path(), &DaemonRequest::new("status")).expect_err("no daemon");
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }
}
