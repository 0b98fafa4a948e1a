//! Mock FreeSWITCH server for inbound-mode tests.
//!
//! Binds to port 0 (random) and exposes the actual bound address; each test
//! spins up its own isolated instance.
//!
//! # Protocol behavior
//!
//! - On accept, sends `Content-Type: auth/request`.
//! - `auth <password>` is checked against the configured password: match
//!   replies `+OK accepted`, mismatch replies `-ERR invalid` followed by a
//!   `text/disconnect-notice` and a socket close.
//! - `api create_uuid` returns a fresh UUID as an `api/response` body.
//! - `bgapi ...` replies `+OK Job-UUID: <uuid>` echoing the client's
//!   `Job-UUID:` header (or a test-supplied override, for mismatch tests).
//! - Everything else replies `+OK` unless a test installed a custom
//!   responder for the command prefix.
//! - Every received command is recorded in a wire trace; tests can inject
//!   events that are broadcast to all connected clients.

use esl_wire::EslEvent;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Canned response for a command prefix.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// `Content-Type: command/reply` with the given `Reply-Text`.
    CommandReply(String),
    /// `Content-Type: api/response` with the given body.
    ApiResponse(String),
    /// Swallow the command without answering (for timeout tests).
    Silent,
}

struct ServerState {
    password: String,
    commands: Mutex<Vec<String>>,
    responders: Mutex<Vec<(String, MockReply)>>,
    /// Job-UUID the next bgapi reply should claim, overriding the echo.
    bgapi_uuid_override: Mutex<Option<String>>,
    inject_tx: broadcast::Sender<String>,
}

/// A mock FreeSWITCH ESL server.
pub struct MockFreeswitch {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockFreeswitch {
    /// Start the mock server with the default password.
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with_password(crate::DEFAULT_PASSWORD).await
    }

    /// Start the mock server, binding to a random available port.
    pub async fn start_with_password(password: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (inject_tx, _) = broadcast::channel(64);

        let state = Arc::new(ServerState {
            password: password.to_owned(),
            commands: Mutex::new(Vec::new()),
            responders: Mutex::new(Vec::new()),
            bgapi_uuid_override: Mutex::new(None),
            inject_tx,
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "mock freeswitch accepted connection");
                        tokio::spawn(serve_connection(stream, accept_state.clone()));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// All commands received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Install a canned reply for commands starting with `prefix`.
    /// Later installs win over earlier ones; all win over the defaults.
    pub fn set_reply_for(&self, prefix: &str, reply: MockReply) {
        self.state
            .responders
            .lock()
            .unwrap()
            .insert(0, (prefix.to_owned(), reply));
    }

    /// Make the next bgapi reply claim `job_uuid` instead of echoing the
    /// client's header (Job-UUID mismatch scenario).
    pub fn override_next_bgapi_uuid(&self, job_uuid: &str) {
        *self.state.bgapi_uuid_override.lock().unwrap() = Some(job_uuid.to_owned());
    }

    /// Broadcast a `text/event-plain` frame built from `body` to every
    /// connected client.
    pub fn send_event(&self, body: &str) {
        let frame = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
            body.len(),
            body
        );
        let _ = self.state.inject_tx.send(frame);
    }

    /// Broadcast an event described by an [`EslEvent`].
    pub fn send_esl_event(&self, event: &EslEvent) {
        self.send_event(&event.to_plain_format());
    }

    /// Broadcast a raw frame verbatim (must carry its own framing).
    pub fn send_raw(&self, frame: &str) {
        let _ = self.state.inject_tx.send(frame.to_owned());
    }

    /// Wait until a command starting with `prefix` has been received,
    /// returning it.  Polls the trace; `None` on timeout.
    pub async fn wait_for_command(&self, prefix: &str, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(cmd) = self
                .state
                .commands
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.starts_with(prefix))
            {
                return Some(cmd.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handling
// ---------------------------------------------------------------------------

async fn serve_connection(stream: TcpStream, state: Arc<ServerState>) {
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    // Forward injected events to this connection.
    let mut inject_rx = state.inject_tx.subscribe();
    let inject_writer = writer.clone();
    let inject_task = tokio::spawn(async move {
        while let Ok(frame) = inject_rx.recv().await {
            if write_frame(&inject_writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let _ = write_frame(&writer, "Content-Type: auth/request\n\n").await;

    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Some(command) = next_command(&mut buffer, &mut chunk, &mut read_half).await else {
            break;
        };
        state.commands.lock().unwrap().push(command.clone());
        debug!(command = %command, "mock freeswitch received command");

        if !respond(&command, &state, &writer).await {
            break;
        }
    }

    inject_task.abort();
}

/// Read from the socket until one blank-line-terminated command is buffered.
async fn next_command(
    buffer: &mut Vec<u8>,
    chunk: &mut [u8],
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
) -> Option<String> {
    loop {
        if let Some(pos) = find_terminator(buffer) {
            let raw: Vec<u8> = buffer.drain(..pos + 2).collect();
            let text = String::from_utf8_lossy(&raw).trim().to_string();
            if text.is_empty() {
                continue;
            }
            return Some(text);
        }
        match read_half.read(chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Handle one command; returns false when the connection should close.
async fn respond(
    command: &str,
    state: &Arc<ServerState>,
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
) -> bool {
    // Custom responders first.
    let custom = state
        .responders
        .lock()
        .unwrap()
        .iter()
        .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        .map(|(_, reply)| reply.clone());
    if let Some(reply) = custom {
        return match reply {
            MockReply::CommandReply(text) => write_command_reply(writer, &text).await.is_ok(),
            MockReply::ApiResponse(body) => write_api_response(writer, &body).await.is_ok(),
            MockReply::Silent => true,
        };
    }

    if let Some(rest) = command.strip_prefix("auth ") {
        if rest.trim() == state.password {
            return write_command_reply(writer, "+OK accepted").await.is_ok();
        }
        let _ = write_command_reply(writer, "-ERR invalid").await;
        let _ = write_frame(
            writer,
            "Content-Type: text/disconnect-notice\nContent-Length: 21\n\nDisconnected, goodbye",
        )
        .await;
        return false;
    }

    if command.starts_with("api create_uuid") {
        let uuid = Uuid::new_v4().to_string();
        return write_api_response(writer, &uuid).await.is_ok();
    }

    if command.starts_with("api ") {
        return write_api_response(writer, "+OK").await.is_ok();
    }

    if command.starts_with("bgapi") {
        let sent_uuid = command
            .lines()
            .find_map(|l| l.strip_prefix("Job-UUID: "))
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
        let claimed = state
            .bgapi_uuid_override
            .lock()
            .unwrap()
            .take()
            .unwrap_or(sent_uuid);
        return write_command_reply(writer, &format!("+OK Job-UUID: {claimed}"))
            .await
            .is_ok();
    }

    if command == "exit" {
        let _ = write_command_reply(writer, "+OK bye").await;
        return false;
    }

    // events / filter / linger / myevents / sendmsg / connect ...
    write_command_reply(writer, "+OK").await.is_ok()
}

async fn write_frame(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    frame: &str,
) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(frame.as_bytes()).await?;
    w.flush().await
}

async fn write_command_reply(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    reply_text: &str,
) -> std::io::Result<()> {
    write_frame(
        writer,
        &format!("Content-Type: command/reply\nReply-Text: {reply_text}\n\n"),
    )
    .await
}

async fn write_api_response(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    body: &str,
) -> std::io::Result<()> {
    write_frame(
        writer,
        &format!(
            "Content-Type: api/response\nContent-Length: {}\n\n{}",
            body.len(),
            body
        ),
    )
    .await
}
