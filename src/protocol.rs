//! The protocol engine: one multiplexed ESL connection.
//!
//! Two long-lived tasks run per connection:
//!
//! - the **reader loop** pulls raw frames off the socket, expands them
//!   into events (multi-event payloads included), and pushes every one
//!   onto the events queue;
//! - the **consumer loop** classifies each event — the auth gate,
//!   command replies into the serial reply queue, disconnect notices into
//!   shutdown (unless lingering) — then hands it to the router.
//!
//! `send()` is a serial RPC: one async mutex owns both the writer half
//! and the reply receiver, so replies match commands in strict FIFO order
//! even when callers interleave.

use crate::bgapi::JobTable;
use crate::error::EslError;
use crate::metrics::metrics;
use crate::results::BackgroundJobResult;
use crate::routing::{EventHandler, HandlerId, Router};
use crate::transport::{FrameReader, write_command};
use esl_wire::{EslEvent, content_types, expand_frame};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{Instrument, debug, error, trace};

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed FreeSWITCH and authenticate with a password.
    Inbound,
    /// FreeSWITCH dialed us (one connection per call).
    Outbound,
}

struct SendSlot {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<EslEvent>,
}

pub(crate) struct ConnInner {
    pub(crate) router: Arc<Router>,
    pub(crate) jobs: JobTable,
    role: Role,
    send_slot: Mutex<Option<SendSlot>>,
    connected: watch::Sender<bool>,
    auth_gate: watch::Sender<bool>,
    lingering: AtomicBool,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Cheap-to-clone handle to one ESL connection.
#[derive(Clone)]
pub struct EslConnection {
    pub(crate) inner: Arc<ConnInner>,
}

impl EslConnection {
    /// Take ownership of a connected stream and start the reader and
    /// consumer loops.
    pub fn start(stream: TcpStream, role: Role) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (connected_tx, _) = watch::channel(true);
        let (auth_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ConnInner {
            router: Arc::new(Router::new()),
            jobs: JobTable::new(),
            role,
            send_slot: Mutex::new(Some(SendSlot {
                writer: write_half,
                replies: replies_rx,
            })),
            connected: connected_tx,
            auth_gate: auth_tx,
            lingering: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let reader_task = tokio::spawn(reader_loop(
            FrameReader::new(read_half),
            events_tx,
            inner.clone(),
        ));
        let consumer_task = tokio::spawn(consumer_loop(events_rx, replies_tx, inner.clone()));
        inner
            .tasks
            .lock()
            .unwrap()
            .extend([reader_task, consumer_task]);

        EslConnection { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// A watch that flips to `false` when the connection dies; waits
    /// select against it to fail fast with `ConnectionClosed`.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Park until the connection dies (or is already dead).
    pub async fn wait_closed(&self) {
        let mut watch = self.connected_watch();
        loop {
            if !*watch.borrow() {
                return;
            }
            if watch.changed().await.is_err() {
                return;
            }
        }
    }

    /// Mark that a `linger` directive was sent, so a disconnect notice no
    /// longer tears the connection down.
    pub fn set_lingering(&self) {
        self.inner.lingering.store(true, Ordering::Relaxed);
    }

    // -- commands ------------------------------------------------------------

    /// Send one command and return its reply.
    ///
    /// Replies are matched to commands in FIFO order; concurrent callers
    /// serialize on the command slot.  A `-ERR` reply is returned intact —
    /// classifying it is the caller's job.
    pub async fn send(&self, command: &str) -> Result<EslEvent, EslError> {
        if !self.is_connected() {
            return Err(EslError::NotConnected);
        }
        let command_name = command.split_whitespace().next().unwrap_or("");
        let span = tracing::debug_span!("send_command", command = command_name);

        async {
            debug!(command = %command, "send command");

            let started = std::time::Instant::now();
            let mut slot_guard = self.inner.send_slot.lock().await;
            let slot = slot_guard.as_mut().ok_or(EslError::NotConnected)?;

            metrics().commands_sent.fetch_add(1, Ordering::Relaxed);
            write_command(&mut slot.writer, command).await?;

            let reply = slot
                .replies
                .recv()
                .await
                .ok_or(EslError::ConnectionClosed)?;
            metrics().command_duration.record(started.elapsed());

            if reply.reply_text().is_some_and(|t| t.starts_with("-ERR")) {
                metrics().command_errors.fetch_add(1, Ordering::Relaxed);
                debug!(reply = ?reply.reply_text(), "command returned -ERR");
            }
            Ok(reply)
        }
        .instrument(span)
        .await
    }

    /// `api <cmd>` convenience.
    pub async fn api(&self, command: &str) -> Result<EslEvent, EslError> {
        self.send(&format!("api {command}")).await
    }

    /// Execute a background API command, correlated by Job-UUID.
    pub async fn bgapi(
        &self,
        command: &str,
        job_uuid: Option<String>,
    ) -> Result<BackgroundJobResult, EslError> {
        crate::bgapi::execute(self, command, job_uuid).await
    }

    // -- authentication ------------------------------------------------------

    /// Inbound handshake: wait for `auth/request`, send the password, and
    /// verify the `+OK accepted` reply.
    pub async fn authenticate(&self, password: &str) -> Result<(), EslError> {
        let mut gate = self.inner.auth_gate.subscribe();
        let mut connected = self.connected_watch();
        loop {
            if *gate.borrow() {
                break;
            }
            tokio::select! {
                changed = gate.changed() => {
                    if changed.is_err() {
                        return Err(EslError::ConnectionClosed);
                    }
                }
                _ = connected.changed() => {
                    if !*connected.borrow() {
                        return Err(EslError::ConnectionClosed);
                    }
                }
            }
        }

        debug!("send command to authenticate inbound connection");
        let reply = self.send(&format!("auth {password}")).await?;
        if reply.reply_text() != Some("+OK accepted") {
            debug!("freeswitch rejected the password");
            return Err(EslError::Authentication);
        }
        Ok(())
    }

    // -- handler registration ------------------------------------------------

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Register a global handler for an event name (or `*`).
    pub fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.inner.router.on(event, handler)
    }

    /// Remove a global handler; idempotent.
    pub fn remove(&self, event: &str, id: HandlerId) {
        self.inner.router.remove(event, id);
    }

    /// Register a channel-scoped handler (O(1) routing by UUID).
    pub fn on_channel(&self, uuid: &str, event: &str, handler: EventHandler) -> HandlerId {
        self.inner.router.on_channel(uuid, event, handler)
    }

    pub fn remove_channel(&self, uuid: &str, event: &str, id: HandlerId) {
        self.inner.router.remove_channel(uuid, event, id);
    }

    // -- shutdown ------------------------------------------------------------

    /// Terminate the connection: stop both loops, close the writer, and
    /// fail every pending command and job wait with `ConnectionClosed`.
    pub async fn stop(&self) {
        if self.inner.connected.send_replace(false) {
            debug!("stopping esl connection");
        }
        let tasks: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Some(slot) = self.inner.send_slot.lock().await.take() {
            let mut writer = slot.writer;
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        }
        self.inner.jobs.fail_all();
    }
}

// ---------------------------------------------------------------------------
// Reader loop
// ---------------------------------------------------------------------------

async fn reader_loop(
    mut reader: FrameReader,
    events_tx: mpsc::UnboundedSender<EslEvent>,
    inner: Arc<ConnInner>,
) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                for event in expand_frame(frame.headers, frame.body.as_deref()) {
                    if events_tx.send(event).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(e) => {
                if *inner.connected.borrow() {
                    error!(error = %e, "error reading from stream");
                }
                break;
            }
        }
    }
    // Dropping events_tx ends the consumer loop, which finishes teardown.
    let _ = inner.connected.send_replace(false);
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

async fn consumer_loop(
    mut events_rx: mpsc::UnboundedReceiver<EslEvent>,
    replies_tx: mpsc::UnboundedSender<EslEvent>,
    inner: Arc<ConnInner>,
) {
    while let Some(event) = events_rx.recv().await {
        metrics().events_received.fetch_add(1, Ordering::Relaxed);
        log_event(&event);

        match event.content_type() {
            Some(content_types::AUTH_REQUEST) => {
                let _ = inner.auth_gate.send_replace(true);
            }
            Some(content_types::COMMAND_REPLY | content_types::API_RESPONSE) => {
                let _ = replies_tx.send(event.clone());
            }
            Some(content_types::DISCONNECT_NOTICE | content_types::RUDE_REJECTION) => {
                let linger_notice =
                    event.get("Content-Disposition") == Some("linger");
                if !inner.lingering.load(Ordering::Relaxed) && !linger_notice {
                    debug!("disconnect notice received, shutting down");
                    shutdown_from_consumer(&inner);
                    inner.router.dispatch(&event);
                    break;
                }
            }
            _ => {}
        }

        inner.router.dispatch(&event);
    }
    // Either the reader ended (channel closed) or we broke out on a
    // disconnect notice; make the death visible to every waiter.
    let _ = inner.connected.send_replace(false);
    inner.jobs.fail_all();
}

/// Shutdown initiated from inside the consumer: must not await the send
/// slot (a pending `send()` holds it while waiting on us), so the writer
/// is closed from a detached task.
fn shutdown_from_consumer(inner: &Arc<ConnInner>) {
    let _ = inner.connected.send_replace(false);
    let tasks: Vec<_> = inner.tasks.lock().unwrap().drain(..).collect();
    let inner = inner.clone();
    tokio::spawn(async move {
        for task in tasks {
            // The consumer task itself is in this list; aborting it after
            // the loop breaks is a no-op.
            task.abort();
        }
        if let Some(slot) = inner.send_slot.lock().await.take() {
            let mut writer = slot.writer;
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        }
        inner.jobs.fail_all();
    });
}

/// Debug-level visibility into the event stream, without flooding.
fn log_event(event: &EslEvent) {
    match (event.event_name(), event.unique_id()) {
        (Some(name), Some(uuid)) => {
            trace!(event = %name, uuid = %uuid, "event received");
            if name == "CHANNEL_EXECUTE_COMPLETE" {
                debug!(
                    application = ?event.get("Application"),
                    response = ?event.application_response(),
                    "application completed"
                );
            }
        }
        (Some(name), None) => trace!(event = %name, "event received"),
        (None, _) => {
            if let Some(reply) = event.reply_text() {
                trace!(reply = %reply, "command reply received");
            }
        }
    }
}
