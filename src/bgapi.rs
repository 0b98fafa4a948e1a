//! Background API (`bgapi`) correlation.
//!
//! A `bgapi` command returns `+OK Job-UUID: <uuid>` immediately and later
//! a `BACKGROUND_JOB` event carrying the real result in its body.  The
//! job table pairs the two.  Flow per job:
//!
//! 1. register the pending entry under a locally generated Job-UUID
//!    (before anything hits the wire, so the completion can never race
//!    past the registration);
//! 2. `filter Job-UUID <uuid>` so the event reaches us even when other
//!    filters are active;
//! 3. send `bgapi <cmd>` with a `Job-UUID:` header;
//! 4. if the reply claims a different UUID, adopt it: re-key the entry,
//!    delete the old filter, add the new one;
//! 5. a persistent `BACKGROUND_JOB` handler resolves the entry and
//!    deletes the filter.
//!
//! Jobs are NOT cancelled by channel hangups (they may not target any
//! channel); connection shutdown fails every outstanding job.

use crate::error::EslError;
use crate::protocol::{ConnInner, EslConnection};
use crate::results::BackgroundJobResult;
use crate::routing::EventHandler;
use esl_wire::EslEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type JobSender = oneshot::Sender<Result<EslEvent, EslError>>;

/// Pending background jobs for one connection.
pub(crate) struct JobTable {
    pending: Mutex<HashMap<String, JobSender>>,
    handler_registered: AtomicBool,
}

impl JobTable {
    pub(crate) fn new() -> Self {
        JobTable {
            pending: Mutex::new(HashMap::new()),
            handler_registered: AtomicBool::new(false),
        }
    }

    fn insert(&self, job_uuid: &str, tx: JobSender) {
        self.pending.lock().unwrap().insert(job_uuid.to_owned(), tx);
    }

    fn remove(&self, job_uuid: &str) -> Option<JobSender> {
        self.pending.lock().unwrap().remove(job_uuid)
    }

    /// Move a pending entry to the UUID FreeSWITCH actually assigned.
    fn rekey(&self, old: &str, new: &str) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(tx) = pending.remove(old) {
            pending.insert(new.to_owned(), tx);
        }
    }

    /// Fail every outstanding job; used on connection shutdown.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<(String, JobSender)> =
            self.pending.lock().unwrap().drain().collect();
        for (job_uuid, tx) in drained {
            debug!(job_uuid = %job_uuid, "cancelling background job on shutdown");
            let _ = tx.send(Err(EslError::ConnectionClosed));
        }
    }
}

/// Register the persistent `BACKGROUND_JOB` handler once per connection.
fn ensure_handler(conn: &EslConnection) {
    if conn
        .inner
        .jobs
        .handler_registered
        .swap(true, Ordering::SeqCst)
    {
        return;
    }

    let weak: Weak<ConnInner> = std::sync::Arc::downgrade(&conn.inner);
    conn.on(
        "BACKGROUND_JOB",
        EventHandler::task(move |event| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else { return };
                let Some(job_uuid) = event.job_uuid().map(str::to_owned) else {
                    warn!("BACKGROUND_JOB event without Job-UUID");
                    return;
                };
                let Some(tx) = inner.jobs.remove(&job_uuid) else {
                    debug!(job_uuid = %job_uuid, "BACKGROUND_JOB for unknown job");
                    return;
                };
                debug!(job_uuid = %job_uuid, "completing background job");
                let _ = tx.send(Ok(event));

                // Keep the server-side filter list clean.
                let conn = EslConnection { inner };
                if let Err(e) = conn.send(&format!("filter delete Job-UUID {job_uuid}")).await {
                    if !e.is_cancellation() {
                        warn!(job_uuid = %job_uuid, error = %e, "filter delete failed");
                    }
                }
            }
        }),
    );
    debug!("registered BACKGROUND_JOB handler");
}

/// Issue one bgapi command and return its awaitable result.
pub(crate) async fn execute(
    conn: &EslConnection,
    command: &str,
    job_uuid: Option<String>,
) -> Result<BackgroundJobResult, EslError> {
    if !conn.is_connected() {
        return Err(EslError::NotConnected);
    }
    ensure_handler(conn);

    let mut job_uuid = job_uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    debug!(command = %command, job_uuid = %job_uuid, "executing bgapi command");

    let (tx, rx) = oneshot::channel();
    conn.inner.jobs.insert(&job_uuid, tx);

    // Ensure the BACKGROUND_JOB event reaches us even if other filters
    // are active.
    conn.send(&format!("filter Job-UUID {job_uuid}")).await?;

    let reply = match conn
        .send(&format!("bgapi {command}\nJob-UUID: {job_uuid}"))
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            conn.inner.jobs.remove(&job_uuid);
            return Err(e);
        }
    };

    let reply_text = reply.reply_text().unwrap_or("").to_owned();
    let Some(confirmed) = reply_text.strip_prefix("+OK Job-UUID: ") else {
        conn.inner.jobs.remove(&job_uuid);
        let _ = conn.send(&format!("filter delete Job-UUID {job_uuid}")).await;
        return Err(EslError::Protocol(format!(
            "no Job-UUID confirmation in bgapi reply: '{reply_text}'"
        )));
    };

    let confirmed = confirmed.trim().to_owned();
    if confirmed != job_uuid {
        // FreeSWITCH assigned its own UUID; track that one instead.
        warn!(sent = %job_uuid, received = %confirmed, "bgapi Job-UUID mismatch");
        conn.inner.jobs.rekey(&job_uuid, &confirmed);
        let _ = conn.send(&format!("filter delete Job-UUID {job_uuid}")).await;
        conn.send(&format!("filter Job-UUID {confirmed}")).await?;
        job_uuid = confirmed;
    }

    debug!(job_uuid = %job_uuid, "background job registered");
    Ok(BackgroundJobResult::new(job_uuid, command.to_owned(), rx))
}
