// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use otto_bus::{Channel, Event, EventBus, EventType, OUTBOUND_ALLOWLIST};

/// Local IPC server.
///
/// Wire protocol: line-delimited JSON, UTF-8, `\n`-terminated.  Inbound
/// lines are `{type, content, client_id?}` and become bus events on the
/// `ipc` channel; outbound events in the allow-list are sent to the client
/// whose id matches the event's session, or broadcast when none does.
pub struct IpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    bus: EventBus,
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    next_client: AtomicU64,
    accepting: AtomicBool,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    socket_path: Option<PathBuf>,
}

impl IpcServer {
    /// Bind a unix-domain socket.  A stale socket file is unlinked first.
    pub async fn start_unix(bus: EventBus, path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        let server = Self::new(bus, Some(path));

        let inner = Arc::clone(&server.inner);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if !inner.accepting.load(Ordering::Acquire) {
                            continue;
                        }
                        inner.clone().spawn_connection(stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "unix accept failed");
                        break;
                    }
                }
            }
        });
        *server.inner.accept_task.lock().unwrap() = Some(task);
        Ok(server)
    }

    /// Bind a TCP loopback listener.  Returns the server and the bound
    /// address (useful with port 0).
    pub async fn start_tcp(bus: EventBus, addr: &str) -> anyhow::Result<(Self, std::net::SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let server = Self::new(bus, None);

        let inner = Arc::clone(&server.inner);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if !inner.accepting.load(Ordering::Acquire) {
                            continue;
                        }
                        inner.clone().spawn_connection(stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        break;
                    }
                }
            }
        });
        *server.inner.accept_task.lock().unwrap() = Some(task);
        Ok((server, local))
    }

    fn new(bus: EventBus, socket_path: Option<PathBuf>) -> Self {
        let inner = Arc::new(Inner {
            bus: bus.clone(),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            accept_task: Mutex::new(None),
            socket_path,
        });

        // Outbound routing: allow-listed events go to the matching client or
        // to everyone.
        let outbound = Arc::clone(&inner);
        bus.subscribe(
            None,
            Arc::new(move |event| {
                let outbound = Arc::clone(&outbound);
                Box::pin(async move {
                    outbound.route_outbound(&event);
                    Ok(())
                })
            }),
        );

        Self { inner }
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
    }

    /// Stop accepting new connections; existing clients stay connected.
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }

    /// Drop every connected client.
    pub fn disconnect_all(&self) {
        self.inner.clients.lock().unwrap().clear();
    }

    /// Full shutdown: stop accepting, drop clients, unlink the socket.
    pub async fn shutdown(&self) {
        self.stop_accepting();
        self.disconnect_all();
        if let Some(task) = self.inner.accept_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(path) = &self.inner.socket_path {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

impl Inner {
    fn spawn_connection<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client_id = format!("client-{}", self.next_client.fetch_add(1, Ordering::Relaxed));
        debug!(client = %client_id, "ipc client connected");

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        self.clients
            .lock()
            .unwrap()
            .insert(client_id.clone(), line_tx.clone());

        // First outbound on a new connection is the hello handshake.
        let _ = line_tx.send(
            json!({"type": "system:hello", "client_id": client_id}).to_string(),
        );

        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut lines = BufReader::new(read_half).lines();

            loop {
                tokio::select! {
                    outbound = line_rx.recv() => {
                        match outbound {
                            Some(line) => {
                                if write_half.write_all(line.as_bytes()).await.is_err()
                                    || write_half.write_all(b"\n").await.is_err()
                                {
                                    break;
                                }
                                let _ = write_half.flush().await;
                            }
                            // Sender dropped: disconnect_all or shutdown.
                            None => break,
                        }
                    }
                    inbound = lines.next_line() => {
                        match inbound {
                            Ok(Some(line)) => self.handle_line(&client_id, &line),
                            Ok(None) | Err(_) => break,
                        }
                    }
                }
            }

            debug!(client = %client_id, "ipc client disconnected");
            self.clients.lock().unwrap().remove(&client_id);
        });
    }

    fn handle_line(&self, client_id: &str, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(client = %client_id, error = %e, "dropping malformed ipc line");
                return;
            }
        };
        let event_type = match value.get("type").and_then(Value::as_str).and_then(EventType::parse)
        {
            Some(t) => t,
            None => {
                warn!(client = %client_id, "dropping ipc line with unknown event type");
                return;
            }
        };
        let content = value.get("content").cloned().unwrap_or(Value::Null);
        let session = value
            .get("client_id")
            .and_then(Value::as_str)
            .or_else(|| content.get("client_id").and_then(Value::as_str))
            .unwrap_or(client_id)
            .to_string();

        let _ = self.bus.publish(
            Event::new(event_type, content)
                .with_channel(Channel::Ipc)
                .with_session(session),
        );
    }

    fn route_outbound(&self, event: &Event) {
        if !OUTBOUND_ALLOWLIST.contains(&event.event_type) {
            return;
        }
        let line = json!({
            "type": event.event_type.as_str(),
            "content": event.content,
            "client_id": event.session_id,
            "timestamp": event.timestamp,
        })
        .to_string();

        let clients = self.clients.lock().unwrap();
        match clients.get(&event.session_id) {
            Some(tx) => {
                let _ = tx.send(line);
            }
            None => {
                for tx in clients.values() {
                    let _ = tx.send(line.clone());
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
