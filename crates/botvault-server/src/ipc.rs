//! Newline-delimited JSON adapter over a Unix socket.
//!
//! This is how an external transport drives the daemon: it feeds inbound
//! envelopes in with `Deliver`, drains outbound ones with `TakeOutbox`, and
//! probes liveness with `Health`. Binary payloads travel as standard base64.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::error::ServerError;
use crate::health::HealthReport;
use crate::server_state::ServerState;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum IpcRequest {
    /// Register a bot and publish its first prekeys.
    CreateBot { bot_id: String },
    /// Close a bot's engine. Its keys are kept.
    RemoveBot { bot_id: String },
    /// Close a bot's engine and destroy its keys.
    PurgeBot { bot_id: String },
    /// Inbound envelope from `peer` for `bot_id`.
    Deliver {
        bot_id: String,
        peer: String,
        envelope: String,
    },
    /// Encrypt `plaintext` from `bot_id` to `peer` and queue it.
    Send {
        bot_id: String,
        peer: String,
        plaintext: String,
    },
    /// Drain the envelopes `bot_id` has queued.
    TakeOutbox { bot_id: String },
    JoinConversation { conversation: String, member: String },
    LeaveConversation { conversation: String, member: String },
    ListBots,
    /// Run every health check.
    Health,
    Status,
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcResponse {
    Ok,
    Bot {
        bot_id: String,
        identity_key: String,
        prekey_ids: Vec<u16>,
    },
    Plaintext { plaintext: String },
    Outbox { envelopes: Vec<OutboxEnvelope> },
    Bots { bots: Vec<String> },
    Health {
        healthy: bool,
        checks: BTreeMap<String, HealthReport>,
    },
    Status { uptime_secs: u64, bot_count: usize },
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub from: String,
    pub to: String,
    pub envelope: String,
}

/// Bind the IPC socket, replacing a stale socket file.
pub fn bind_ipc_socket(socket_path: &Path) -> std::io::Result<UnixListener> {
    match std::fs::remove_file(socket_path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    UnixListener::bind(socket_path)
}

/// Accept connections forever, serving each on its own task.
pub async fn serve_ipc(listener: UnixListener, state: Arc<ServerState>, shutdown_tx: mpsc::Sender<()>) {
    tracing::info!("IPC listener started");

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = Arc::clone(&state);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(handle_connection(stream, state, shutdown_tx));
            }
            Err(e) => {
                tracing::warn!(error = %e, "IPC accept error");
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, state: Arc<ServerState>, shutdown_tx: mpsc::Sender<()>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => handle_ipc_request(&state, request, &shutdown_tx).await,
            Err(e) => IpcResponse::Error {
                message: format!("invalid request: {e}"),
            },
        };

        let mut buf = serde_json::to_vec(&response).unwrap_or_default();
        buf.push(b'\n');
        if let Err(e) = writer.write_all(&buf).await {
            tracing::warn!(error = %e, "failed to write IPC response");
            break;
        }
    }
}

async fn handle_ipc_request(
    state: &Arc<ServerState>,
    request: IpcRequest,
    shutdown_tx: &mpsc::Sender<()>,
) -> IpcResponse {
    let result = match request {
        IpcRequest::CreateBot { bot_id } => {
            let repo = Arc::clone(&state.repo);
            blocking(move || {
                let bundle = repo.create_bot(&bot_id)?;
                Ok(IpcResponse::Bot {
                    bot_id,
                    identity_key: hex::encode(&bundle.identity_key),
                    prekey_ids: bundle.prekeys.iter().map(|p| p.id).collect(),
                })
            })
            .await
        }
        IpcRequest::RemoveBot { bot_id } => {
            let repo = Arc::clone(&state.repo);
            blocking(move || {
                if repo.remove(&bot_id) {
                    Ok(IpcResponse::Ok)
                } else {
                    Err(ServerError::UnknownBot(bot_id))
                }
            })
            .await
        }
        IpcRequest::PurgeBot { bot_id } => {
            let repo = Arc::clone(&state.repo);
            blocking(move || repo.purge(&bot_id).map(|()| IpcResponse::Ok)).await
        }
        IpcRequest::Deliver {
            bot_id,
            peer,
            envelope,
        } => match STANDARD.decode(envelope) {
            Ok(envelope) => {
                let repo = Arc::clone(&state.repo);
                blocking(move || {
                    let plaintext = repo.decrypt(&bot_id, &peer, &envelope)?;
                    Ok(IpcResponse::Plaintext {
                        plaintext: STANDARD.encode(plaintext),
                    })
                })
                .await
            }
            Err(e) => Err(format!("envelope is not valid base64: {e}")),
        },
        IpcRequest::Send {
            bot_id,
            peer,
            plaintext,
        } => match STANDARD.decode(plaintext) {
            Ok(plaintext) => {
                let repo = Arc::clone(&state.repo);
                blocking(move || repo.send(&bot_id, &peer, &plaintext).map(|()| IpcResponse::Ok)).await
            }
            Err(e) => Err(format!("plaintext is not valid base64: {e}")),
        },
        IpcRequest::TakeOutbox { bot_id } => {
            let envelopes = state
                .network
                .take_outbox(&bot_id)
                .into_iter()
                .map(|out| OutboxEnvelope {
                    from: out.from,
                    to: out.to,
                    envelope: STANDARD.encode(out.envelope),
                })
                .collect();
            Ok(IpcResponse::Outbox { envelopes })
        }
        IpcRequest::JoinConversation { conversation, member } => {
            state.network.join(&conversation, &member);
            Ok(IpcResponse::Ok)
        }
        IpcRequest::LeaveConversation { conversation, member } => {
            state.network.leave(&conversation, &member);
            Ok(IpcResponse::Ok)
        }
        IpcRequest::ListBots => {
            let repo = Arc::clone(&state.repo);
            blocking(move || {
                Ok(IpcResponse::Bots {
                    bots: repo.snapshot().into_iter().collect(),
                })
            })
            .await
        }
        IpcRequest::Health => {
            let health = Arc::clone(&state.health);
            blocking(move || {
                let checks = health.run_all();
                Ok(IpcResponse::Health {
                    healthy: checks.values().all(|c| c.healthy),
                    checks,
                })
            })
            .await
        }
        IpcRequest::Status => {
            let uptime_secs = state.uptime_secs();
            let repo = Arc::clone(&state.repo);
            blocking(move || {
                Ok(IpcResponse::Status {
                    uptime_secs,
                    bot_count: repo.len(),
                })
            })
            .await
        }
        IpcRequest::Shutdown => {
            tracing::info!("shutdown requested via IPC");
            let _ = shutdown_tx.send(()).await;
            Ok(IpcResponse::Ok)
        }
    };

    result.unwrap_or_else(|message| IpcResponse::Error { message })
}

/// Run engine and storage work off the async workers.
async fn blocking<F>(f: F) -> Result<IpcResponse, String>
where
    F: FnOnce() -> Result<IpcResponse, ServerError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("request task failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use botvault_crypto::{MemoryKeyStore, OpenPolicy};

    use super::*;

    async fn roundtrip(
        lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        request: &serde_json::Value,
    ) -> serde_json::Value {
        let mut buf = serde_json::to_vec(request).unwrap();
        buf.push(b'\n');
        writer.write_all(&buf).await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn bots_exchange_messages_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("botvault.sock");
        let state = Arc::new(ServerState::new(Arc::new(MemoryKeyStore::new()), OpenPolicy::default()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let listener = bind_ipc_socket(&socket).unwrap();
        let server = tokio::spawn(serve_ipc(listener, Arc::clone(&state), shutdown_tx));

        let (reader, mut writer) = UnixStream::connect(&socket).await.unwrap().into_split();
        let mut lines = BufReader::new(reader).lines();

        for bot in ["bot-1", "bot-2"] {
            let resp = roundtrip(
                &mut lines,
                &mut writer,
                &serde_json::json!({"method": "CreateBot", "params": {"bot_id": bot}}),
            )
            .await;
            assert_eq!(resp["type"], "Bot");
            assert_eq!(resp["data"]["prekey_ids"].as_array().unwrap().len(), 8);
        }

        let resp = roundtrip(
            &mut lines,
            &mut writer,
            &serde_json::json!({"method": "Send", "params": {
                "bot_id": "bot-1", "peer": "bot-2", "plaintext": STANDARD.encode("hello")
            }}),
        )
        .await;
        assert_eq!(resp["type"], "Ok");

        let resp = roundtrip(
            &mut lines,
            &mut writer,
            &serde_json::json!({"method": "TakeOutbox", "params": {"bot_id": "bot-1"}}),
        )
        .await;
        let envelope = resp["data"]["envelopes"][0]["envelope"].as_str().unwrap().to_string();

        let resp = roundtrip(
            &mut lines,
            &mut writer,
            &serde_json::json!({"method": "Deliver", "params": {
                "bot_id": "bot-2", "peer": "bot-1", "envelope": envelope
            }}),
        )
        .await;
        assert_eq!(resp["type"], "Plaintext");
        assert_eq!(resp["data"]["plaintext"], STANDARD.encode("hello"));

        // Replaying the same envelope is rejected.
        let resp = roundtrip(
            &mut lines,
            &mut writer,
            &serde_json::json!({"method": "Deliver", "params": {
                "bot_id": "bot-2", "peer": "bot-1", "envelope": envelope
            }}),
        )
        .await;
        assert_eq!(resp["type"], "Error");

        let resp = roundtrip(&mut lines, &mut writer, &serde_json::json!({"method": "ListBots"})).await;
        assert_eq!(resp["data"]["bots"], serde_json::json!(["bot-1", "bot-2"]));

        let resp = roundtrip(&mut lines, &mut writer, &serde_json::json!({"method": "Health"})).await;
        assert_eq!(resp["data"]["healthy"], true);
        assert_eq!(resp["data"]["checks"].as_object().unwrap().len(), 3);

        let resp = roundtrip(&mut lines, &mut writer, &serde_json::json!({"method": "Shutdown"})).await;
        assert_eq!(resp["type"], "Ok");
        assert!(shutdown_rx.recv().await.is_some());

        server.abort();
    }

    #[tokio::test]
    async fn malformed_requests_get_an_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("botvault.sock");
        let state = Arc::new(ServerState::new(Arc::new(MemoryKeyStore::new()), OpenPolicy::default()));
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let server = tokio::spawn(serve_ipc(bind_ipc_socket(&socket).unwrap(), state, shutdown_tx));

        let (reader, mut writer) = UnixStream::connect(&socket).await.unwrap().into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"not json\n").await.unwrap();
        let resp: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp["type"], "Error");

        let resp = roundtrip(
            &mut lines,
            &mut writer,
            &serde_json::json!({"method": "Deliver", "params": {
                "bot_id": "bot-1", "peer": "peer-1", "envelope": "***"
            }}),
        )
        .await;
        assert_eq!(resp["type"], "Error");

        let resp = roundtrip(
            &mut lines,
            &mut writer,
            &serde_json::json!({"method": "RemoveBot", "params": {"bot_id": "ghost"}}),
        )
        .await;
        assert!(resp["data"]["message"].as_str().unwrap().contains("unknown bot"));

        server.abort();
    }
}
