//! Local IPC server for `crackq-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands and
//! routes them to the [`Orchestrator`].
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "submit", "job": {"target": {"file": "/data/hashes.txt"}, "hash_type": 0, "attack_mode": 0, "wordlists": ["rockyou.txt"]}}
//! {"command": "pause", "id": "6c1f..."}
//! {"command": "status", "id": "6c1f..."}
//! {"command": "subscribe", "id": "6c1f..."}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "session 6c1f... not found", "kind": "NotFound"}
//! ```
//!
//! `subscribe` answers once with `ok` and then writes one event per line
//! until the client disconnects. A subscriber that falls behind receives
//! `{"type": "Gap", "missed": n}` in place of the dropped events.

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::errors::ErrorKind;
use crate::models::job::JobSpec;
use crate::orchestrator::broadcaster::{Delivery, SubscriptionFilter};
use crate::orchestrator::coordinator::Orchestrator;
use crate::{AppError, Result};

/// Inbound IPC request.
#[derive(Debug, Clone, Deserialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Session identifier.
    #[serde(default)]
    pub id: Option<String>,
    /// Job to submit.
    #[serde(default)]
    pub job: Option<JobSpec>,
}

/// Outbound IPC response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error kind on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }

    fn failure(err: &AppError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
            kind: Some(err.kind()),
        }
    }

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| {
            serde_json::to_value(value)
                .map_err(|err| AppError::Ipc(format!("failed to encode response: {err}")))
        }) {
            Ok(data) => Self::success(data),
            Err(err) => Self::failure(&err),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    ipc_name: &str,
    orchestrator: Orchestrator,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = ipc_name.to_owned();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(
                                    stream,
                                    orchestrator.clone(),
                                    ct.clone(),
                                ));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    orchestrator: Orchestrator,
    ct: CancellationToken,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let request = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => request,
                        Err(err) => {
                            let err = AppError::Ipc(format!("invalid json: {err}"));
                            if write_json(&mut writer, &IpcResponse::failure(&err)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    if request.command == "subscribe" {
                        stream_events(&request, &orchestrator, &mut buf_reader, &mut writer, &ct)
                            .await;
                        break;
                    }

                    let response = dispatch_command(&request, &orchestrator).await;
                    if let Err(err) = write_json(&mut writer, &response).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route a request/response IPC command to the orchestrator.
pub async fn dispatch_command(request: &IpcRequest, orchestrator: &Orchestrator) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        match request.command.as_str() {
            "submit" => {
                let Some(ref job) = request.job else {
                    return missing("job");
                };
                IpcResponse::from_result(
                    orchestrator
                        .submit(job.clone())
                        .await
                        .map(|id| serde_json::json!({ "session_id": id })),
                )
            }
            "cancel" => {
                let Some(ref id) = request.id else {
                    return missing("id");
                };
                acknowledge(id, "cancelled", orchestrator.cancel(id).await)
            }
            "pause" => {
                let Some(ref id) = request.id else {
                    return missing("id");
                };
                acknowledge(id, "pausing", orchestrator.pause(id).await)
            }
            "resume" => {
                let Some(ref id) = request.id else {
                    return missing("id");
                };
                acknowledge(id, "resuming", orchestrator.resume(id).await)
            }
            "status" => match request.id {
                Some(ref id) => IpcResponse::from_result(orchestrator.get(id).await),
                None => IpcResponse::from_result(orchestrator.list().await),
            },
            "list" => IpcResponse::from_result(orchestrator.list().await),
            "results" => {
                let Some(ref id) = request.id else {
                    return missing("id");
                };
                IpcResponse::from_result(orchestrator.results(id).await)
            }
            other => IpcResponse::failure(&AppError::Ipc(format!("unknown command: {other}"))),
        }
    }
    .instrument(span)
    .await
}

fn acknowledge(id: &str, status: &str, result: Result<()>) -> IpcResponse {
    IpcResponse::from_result(
        result.map(|()| serde_json::json!({ "session_id": id, "status": status })),
    )
}

fn missing(field: &str) -> IpcResponse {
    IpcResponse::failure(&AppError::Ipc(format!("missing required '{field}' field")))
}

/// Stream events to a subscriber until it disconnects.
async fn stream_events<R, W>(
    request: &IpcRequest,
    orchestrator: &Orchestrator,
    reader: &mut BufReader<R>,
    writer: &mut W,
    ct: &CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let filter = request
        .id
        .clone()
        .map_or(SubscriptionFilter::All, SubscriptionFilter::Session);
    let mut subscription = orchestrator.subscribe(filter.clone());

    let ack = IpcResponse::success(serde_json::json!({ "subscribed": request.id }));
    if write_json(writer, &ack).await.is_err() {
        return;
    }
    debug!(?filter, "ipc subscriber attached");

    let mut sink = String::new();
    loop {
        tokio::select! {
            () = ct.cancelled() => break,
            read = reader.read_line(&mut sink) => {
                // Anything but more input means the client went away.
                if !matches!(read, Ok(n) if n > 0) {
                    break;
                }
                sink.clear();
            }
            delivery = subscription.recv() => {
                let written = match delivery {
                    Some(Delivery::Event(event)) => write_json(writer, &event).await,
                    Some(Delivery::Gap { missed }) => {
                        write_json(writer, &serde_json::json!({ "type": "Gap", "missed": missed }))
                            .await
                    }
                    None => break,
                };
                if written.is_err() {
                    break;
                }
            }
        }
    }
    debug!("ipc subscriber detached");
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(value)
        .unwrap_or_else(|_| r#"{"ok":false,"error":"serialization failed"}"#.to_owned());
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
