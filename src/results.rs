//! Awaitable results for correlated operations.
//!
//! A `sendmsg execute` resolves later via `CHANNEL_EXECUTE_COMPLETE`; a
//! `bgapi` resolves via `BACKGROUND_JOB`.  Both are represented as a value
//! holding the immediate `+OK` reply plus a one-shot completion receiver.
//! Dropping an unresolved result unregisters its correlation handlers.

use crate::error::EslError;
use crate::metrics::metrics;
use crate::routing::{HandlerId, Router};
use esl_wire::EslEvent;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::oneshot;

/// One correlation registration to undo on completion or drop.
#[derive(Debug)]
pub(crate) enum GuardEntry {
    Global { name: String, id: HandlerId },
    Channel { uuid: String, name: String, id: HandlerId },
}

/// Unregisters a set of handlers exactly once.  Removal is idempotent, so
/// a handler that already unregistered itself is harmless to guard.
pub(crate) struct HandlerGuard {
    router: Arc<Router>,
    entries: Vec<GuardEntry>,
}

impl HandlerGuard {
    pub(crate) fn new(router: Arc<Router>, entries: Vec<GuardEntry>) -> Self {
        HandlerGuard { router, entries }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        for entry in &self.entries {
            match entry {
                GuardEntry::Global { name, id } => self.router.remove(name, *id),
                GuardEntry::Channel { uuid, name, id } => {
                    self.router.remove_channel(uuid, name, *id);
                }
            }
        }
    }
}

/// Shared one-shot resolution slot: the first of the competing correlation
/// handlers to take the sender decides the outcome.
pub(crate) type ResolutionSlot = Arc<std::sync::Mutex<Option<oneshot::Sender<Result<EslEvent, EslError>>>>>;

pub(crate) fn resolution_slot() -> (ResolutionSlot, oneshot::Receiver<Result<EslEvent, EslError>>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(std::sync::Mutex::new(Some(tx))), rx)
}

/// Resolve the slot if it is still armed.
pub(crate) fn resolve(slot: &ResolutionSlot, outcome: Result<EslEvent, EslError>) {
    if let Some(tx) = slot.lock().unwrap().take() {
        let _ = tx.send(outcome);
    }
}

// ---------------------------------------------------------------------------
// CommandResult
// ---------------------------------------------------------------------------

enum Completion {
    /// Non-correlated command: the reply is the whole story.
    Immediate,
    /// Correlated execute waiting for its completion event.
    Pending {
        rx: oneshot::Receiver<Result<EslEvent, EslError>>,
        /// Flips to `false` when the connection dies, failing the wait.
        closed: tokio::sync::watch::Receiver<bool>,
        _guard: HandlerGuard,
    },
    /// Completion event already received (or synthesized).
    Done(EslEvent),
}

/// Result of one command sent on a channel.
///
/// For plain commands (`hangup`, api translations) the initial reply is
/// final and [`CommandResult::complete`] returns immediately.  For
/// `execute` commands the result stays pending until the matching
/// `CHANNEL_EXECUTE_COMPLETE` arrives, the channel hangs up
/// ([`EslError::OperationInterrupted`]), or the timeout elapses.
pub struct CommandResult {
    reply: EslEvent,
    app_uuid: Option<String>,
    channel_uuid: Option<String>,
    completion: Completion,
}

impl CommandResult {
    /// A result that is final as of its initial reply.
    pub(crate) fn immediate(reply: EslEvent) -> Self {
        CommandResult {
            reply,
            app_uuid: None,
            channel_uuid: None,
            completion: Completion::Immediate,
        }
    }

    pub(crate) fn pending(
        reply: EslEvent,
        app_uuid: String,
        channel_uuid: Option<String>,
        rx: oneshot::Receiver<Result<EslEvent, EslError>>,
        closed: tokio::sync::watch::Receiver<bool>,
        guard: HandlerGuard,
    ) -> Self {
        CommandResult {
            reply,
            app_uuid: Some(app_uuid),
            channel_uuid,
            completion: Completion::Pending {
                rx,
                closed,
                _guard: guard,
            },
        }
    }

    /// The immediate `command/reply` (or synthesized equivalent).
    pub fn reply(&self) -> &EslEvent {
        &self.reply
    }

    pub fn app_uuid(&self) -> Option<&str> {
        self.app_uuid.as_deref()
    }

    pub fn channel_uuid(&self) -> Option<&str> {
        self.channel_uuid.as_deref()
    }

    /// Whether the immediate reply was `+OK`.
    pub fn reply_ok(&self) -> bool {
        self.reply
            .reply_text()
            .is_some_and(|t| t.starts_with("+OK"))
    }

    /// The completion event, if the operation already finished.
    pub fn completion_event(&self) -> Option<&EslEvent> {
        match &self.completion {
            Completion::Done(event) => Some(event),
            _ => None,
        }
    }

    /// `Application-Response` of the completion event.
    pub fn response(&self) -> Option<&str> {
        self.completion_event()
            .and_then(EslEvent::application_response)
    }

    /// Wait (forever) for the operation to finish.
    pub async fn complete(&mut self) -> Result<&EslEvent, EslError> {
        self.complete_inner(None).await
    }

    /// Wait for the operation to finish, failing with [`EslError::Timeout`]
    /// if `timeout` elapses first.  The correlation handlers are
    /// unregistered on every outcome, including timeout.
    pub async fn complete_within(&mut self, timeout: Duration) -> Result<&EslEvent, EslError> {
        self.complete_inner(Some(timeout)).await
    }

    async fn complete_inner(&mut self, timeout: Option<Duration>) -> Result<&EslEvent, EslError> {
        match std::mem::replace(&mut self.completion, Completion::Immediate) {
            Completion::Immediate => {
                self.completion = Completion::Immediate;
                Ok(&self.reply)
            }
            Completion::Done(event) => {
                self.completion = Completion::Done(event);
                match &self.completion {
                    Completion::Done(event) => Ok(event),
                    _ => unreachable!(),
                }
            }
            Completion::Pending {
                rx,
                mut closed,
                _guard,
            } => {
                let wait = async {
                    tokio::select! {
                        outcome = rx => outcome.unwrap_or(Err(EslError::ConnectionClosed)),
                        _ = async {
                            loop {
                                if !*closed.borrow() { break; }
                                if closed.changed().await.is_err() { break; }
                            }
                        } => Err(EslError::ConnectionClosed),
                    }
                };
                let outcome = match timeout {
                    None => wait.await,
                    Some(limit) => match tokio::time::timeout(limit, wait).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            metrics().timeouts.fetch_add(1, Ordering::Relaxed);
                            let label = self
                                .app_uuid
                                .clone()
                                .unwrap_or_else(|| "execute completion".to_owned());
                            // Guard dropped here — handlers unregistered.
                            return Err(EslError::Timeout(label));
                        }
                    },
                };
                let event = outcome?;
                self.completion = Completion::Done(event);
                match &self.completion {
                    Completion::Done(event) => Ok(event),
                    _ => unreachable!(),
                }
            }
        }
    }
}

impl std::fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandResult")
            .field("app_uuid", &self.app_uuid)
            .field("channel_uuid", &self.channel_uuid)
            .field("reply_text", &self.reply.reply_text())
            .field(
                "state",
                &match self.completion {
                    Completion::Immediate => "immediate",
                    Completion::Pending { .. } => "pending",
                    Completion::Done(_) => "done",
                },
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BackgroundJobResult
// ---------------------------------------------------------------------------

/// Result of one `bgapi` command, resolved by its `BACKGROUND_JOB` event.
pub struct BackgroundJobResult {
    job_uuid: String,
    command: String,
    rx: Option<oneshot::Receiver<Result<EslEvent, EslError>>>,
    event: Option<EslEvent>,
}

impl BackgroundJobResult {
    pub(crate) fn new(
        job_uuid: String,
        command: String,
        rx: oneshot::Receiver<Result<EslEvent, EslError>>,
    ) -> Self {
        BackgroundJobResult {
            job_uuid,
            command,
            rx: Some(rx),
            event: None,
        }
    }

    /// The Job-UUID FreeSWITCH is tracking this job under (post mismatch
    /// adoption).
    pub fn job_uuid(&self) -> &str {
        &self.job_uuid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the `BACKGROUND_JOB` event.
    pub async fn complete(&mut self) -> Result<&EslEvent, EslError> {
        if let Some(rx) = self.rx.take() {
            let event = rx.await.map_err(|_| EslError::ConnectionClosed)??;
            self.event = Some(event);
        }
        self.event.as_ref().ok_or(EslError::ConnectionClosed)
    }

    /// Wait with a deadline.
    pub async fn complete_within(&mut self, timeout: Duration) -> Result<&EslEvent, EslError> {
        if let Some(rx) = self.rx.take() {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(outcome)) => self.event = Some(outcome?),
                Ok(Err(_)) => return Err(EslError::ConnectionClosed),
                Err(_) => {
                    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(EslError::Timeout(format!("bgapi job {}", self.job_uuid)));
                }
            }
        }
        self.event.as_ref().ok_or(EslError::ConnectionClosed)
    }

    /// The job's result body (`+OK ...` / `-ERR ...`), once completed.
    pub fn response(&self) -> Option<&str> {
        self.event.as_ref().and_then(EslEvent::body)
    }

    /// Whether the completed job reported `+OK`.
    pub fn is_successful(&self) -> Option<bool> {
        self.response().map(|body| body.trim_start().starts_with("+OK"))
    }
}

impl std::fmt::Debug for BackgroundJobResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundJobResult")
            .field("job_uuid", &self.job_uuid)
            .field("command", &self.command)
            .field("completed", &self.event.is_some())
            .finish()
    }
}
