//! Unix-socket control plane.
//!
//! Framing: a 4-byte big-endian length prefix followed by a JSON body, both
//! ways. One request per frame; responses come back on the same connection
//! in order. Frames above [`MAX_MESSAGE_SIZE`] are refused.
//!
//! The service's own calls are synchronous (SQLite, file I/O), so each
//! request runs on the blocking pool.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use warden_core::state::{Intent, Message};

use crate::service::{AgentService, ServiceError};

/// Maximum frame size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Requests accepted on the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Drive one graph turn.
    Invoke {
        /// Target thread.
        thread_id: String,
        /// Principal driving the thread.
        user_id: String,
        /// User message text.
        message: String,
        /// Routing hint.
        intent: Intent,
    },
    /// Administratively cancel a thread.
    Cancel {
        /// Target thread.
        thread_id: String,
    },
    /// Fetch the ordered transcript.
    History {
        /// Target thread.
        thread_id: String,
    },
    /// Destroy a thread and its evicted content.
    DeleteThread {
        /// Target thread.
        thread_id: String,
    },
}

/// Responses sent back on the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IpcResponse {
    /// A turn completed (or suspended on approval).
    Turn {
        /// Assistant messages from the turn.
        messages: Vec<String>,
        /// Whether the thread is paused on approval.
        awaiting_approval: bool,
    },
    /// The operation completed with nothing to return.
    Ok,
    /// A transcript.
    History {
        /// The ordered transcript.
        messages: Vec<Message>,
    },
    /// The operation failed. The message is user-safe.
    Error {
        /// User-safe failure description.
        message: String,
    },
}

/// Runs the IPC server until `shutdown` is set.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn run(
    socket_path: &Path,
    service: Arc<AgentService>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create socket directory")?;
    }

    let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;
    info!(socket = %socket_path.display(), "IPC server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let service = service.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, service).await {
                                debug!("connection handler error: {e}");
                            }
                        });
                    }
                    Err(e) => error!("failed to accept connection: {e}"),
                }
            }
            () = wait_for_shutdown(&shutdown) => {
                info!("IPC server shutting down");
                break;
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    Ok(())
}

async fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

async fn handle_connection(mut stream: UnixStream, service: Arc<AgentService>) -> Result<()> {
    debug!("new IPC connection");
    loop {
        let request = match read_request(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("IPC connection closed");
                break;
            },
            Err(e) => {
                warn!("failed to read request: {e}");
                break;
            },
        };

        // Service calls block (SQLite, audit fsync); keep them off the
        // reactor threads.
        let service = service.clone();
        let response =
            tokio::task::spawn_blocking(move || dispatch(&request, &service)).await?;

        if let Err(e) = send_response(&mut stream, &response).await {
            warn!("failed to send response: {e}");
            break;
        }
    }
    Ok(())
}

/// Maps one request onto the service.
fn dispatch(request: &IpcRequest, service: &AgentService) -> IpcResponse {
    let result = match request {
        IpcRequest::Invoke {
            thread_id,
            user_id,
            message,
            intent,
        } => service
            .invoke(thread_id, user_id, message, *intent)
            .map(|outcome| IpcResponse::Turn {
                messages: outcome.messages,
                awaiting_approval: outcome.awaiting_approval,
            }),
        IpcRequest::Cancel { thread_id } => service.cancel(thread_id).map(|()| IpcResponse::Ok),
        IpcRequest::History { thread_id } => service
            .history(thread_id)
            .map(|messages| IpcResponse::History { messages }),
        IpcRequest::DeleteThread { thread_id } => {
            service.delete_thread(thread_id).map(|()| IpcResponse::Ok)
        },
    };

    result.unwrap_or_else(|err| IpcResponse::Error {
        message: user_safe_message(&err),
    })
}

/// The error strings crossing the wire; [`ServiceError`] display text is
/// already user-safe, this is the single chokepoint asserting that.
fn user_safe_message(err: &ServiceError) -> String {
    match err {
        ServiceError::State(_) | ServiceError::Graph(_) | ServiceError::Audit(_)
        | ServiceError::Eviction(_) => "internal failure; an operator has been notified".to_string(),
        other => other.to_string(),
    }
}

async fn read_request(stream: &mut UnixStream) -> Result<Option<IpcRequest>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        anyhow::bail!("message too large: {len} bytes");
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let request = serde_json::from_slice(&payload).context("failed to parse request")?;
    Ok(Some(request))
}

async fn send_response(stream: &mut UnixStream, response: &IpcResponse) -> Result<()> {
    let json = serde_json::to_vec(response).context("failed to serialize response")?;
    let len = u32::try_from(json.len()).context("response too large")?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&json).await?;
    stream.flush().await?;
    Ok(())
}
