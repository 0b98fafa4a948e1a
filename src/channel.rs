//! A FreeSWITCH call leg.
//!
//! One `Channel` models one leg, identified by a stable UUID, and works
//! over both connection modes: on an outbound session its verbs become
//! `sendmsg execute` commands correlated by `CHANNEL_EXECUTE_COMPLETE`;
//! on an inbound connection they translate to `api uuid_*` calls.
//!
//! State tracking is event-driven: a persistent channel-scoped
//! `CHANNEL_STATE` handler updates the core state (from
//! `Channel-State-Number`, falling back to the `CS_*` string), the call
//! state, the variables cache, and the terminal (`is_gone`) flag.

use crate::error::EslError;
use crate::metrics::metrics;
use crate::protocol::{EslConnection, Role};
use crate::results::{
    BackgroundJobResult, CommandResult, GuardEntry, HandlerGuard, resolution_slot, resolve,
};
use crate::routing::{EventHandler, HandlerId};
use crate::session::Session;
use esl_wire::{CallState, ChannelState, EslEvent, SendMsg, VarMap};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel headers copied into the variables cache verbatim, alongside
/// every `variable_*` header.
const VARIABLE_WHITELIST: [&str; 5] = [
    "Caller-Caller-ID-Number",
    "Caller-Caller-ID-Name",
    "Caller-Destination-Number",
    "Unique-ID",
    "Channel-Name",
];

/// Event names whose waits are filtered by this channel's UUID.  Other
/// events (notably `DTMF`) are delivered regardless of `Unique-ID`: in
/// some configurations FreeSWITCH omits a usable UUID on them, so
/// unscoped delivery is the safer default.
const CHANNEL_SPECIFIC_EVENTS: [&str; 3] =
    ["CHANNEL_STATE", "CHANNEL_ANSWER", "CHANNEL_HANGUP_COMPLETE"];

pub(crate) struct ChannelShared {
    pub(crate) state: ChannelState,
    pub(crate) call_state: CallState,
    pub(crate) variables: HashMap<String, String>,
    pub(crate) context: HashMap<String, String>,
    pub(crate) is_gone: bool,
    pub(crate) state_changes: Vec<(ChannelState, Instant)>,
}

pub(crate) struct ChannelInner {
    conn: EslConnection,
    uuid: OnceLock<String>,
    dial_path: String,
    session: Mutex<Option<Weak<crate::session::SessionInner>>>,
    shared: Mutex<ChannelShared>,
    created_at: Instant,
    state_handler: Mutex<Option<HandlerId>>,
}

/// Handle to one call leg; cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    fn new_inner(conn: EslConnection, dial_path: &str) -> Self {
        Channel {
            inner: Arc::new(ChannelInner {
                conn,
                uuid: OnceLock::new(),
                dial_path: dial_path.to_owned(),
                session: Mutex::new(None),
                shared: Mutex::new(ChannelShared {
                    state: ChannelState::New,
                    call_state: CallState::Down,
                    variables: HashMap::new(),
                    context: HashMap::new(),
                    is_gone: false,
                    state_changes: Vec::new(),
                }),
                created_at: Instant::now(),
                state_handler: Mutex::new(None),
            }),
        }
    }

    // -- factories -----------------------------------------------------------

    /// Originate a new leg over an inbound connection.
    ///
    /// Sends `api create_uuid` to obtain the leg's UUID, subscribes to its
    /// events, then issues
    /// `api originate {origination_uuid=...,return_ring_ready=true,...} <dial> &park()`.
    /// Returns as soon as the originate command is acknowledged; use
    /// [`Channel::wait_for_state`] to wait for the leg to come up.
    pub async fn create(
        conn: &EslConnection,
        dial_path: &str,
        variables: Option<&VarMap>,
    ) -> Result<Channel, EslError> {
        let channel = Self::new_inner(conn.clone(), dial_path);

        if conn.role() == Role::Inbound {
            conn.send("events plain ALL").await?;
        }

        let reply = conn.api("create_uuid").await?;
        let uuid = reply
            .body()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EslError::Channel("create_uuid returned no UUID".to_owned()))?
            .to_owned();
        channel
            .inner
            .uuid
            .set(uuid.clone())
            .expect("uuid set once at creation");

        channel.register_state_tracking();
        conn.send(&format!("filter Unique-ID {uuid}")).await?;

        let mut vars = VarMap::new();
        vars.set("origination_uuid", uuid.as_str());
        vars.set("return_ring_ready", true);
        if let Some(extra) = variables {
            vars.merge_defaults(extra);
        }

        let cmd = format!(
            "api originate {}{} &park()",
            vars.to_raw_option_string(),
            dial_path
        );
        conn.send(&cmd).await?;

        metrics().channel_operations.fetch_add(1, Ordering::Relaxed);
        info!(uuid = %uuid, dial_path = %dial_path, "channel created");
        Ok(channel)
    }

    /// Wrap the existing leg of an outbound session (the A-leg FreeSWITCH
    /// connected to us about).
    pub fn from_session(session: &Session) -> Result<Channel, EslError> {
        let uuid = session
            .uuid()
            .ok_or_else(|| EslError::Channel("session has no channel UUID".to_owned()))?;
        let dial_path = session.context_value("Channel-Name").unwrap_or_default();

        let channel = Self::new_inner(session.connection().clone(), &dial_path);
        channel
            .inner
            .uuid
            .set(uuid)
            .expect("uuid set once at creation");
        *channel.inner.session.lock().unwrap() = Some(session.downgrade());

        {
            let mut shared = channel.inner.shared.lock().unwrap();
            if let Some(state) = session
                .context_value("Channel-State")
                .and_then(|s| ChannelState::from_cs_name(&s))
            {
                shared.state = state;
            }
            for (name, value) in session.context_snapshot() {
                shared.context.insert(name, value);
            }
        }

        channel.register_state_tracking();
        Ok(channel)
    }

    /// Create a new leg with `originate` over bgapi and register it with
    /// the owning session.
    ///
    /// The command is
    /// `originate {vars}<destination> &<application_after>`, with
    /// `origination_uuid` forced to the new leg's UUID.  A `-ERR` job
    /// result — or a leg that dies before the job completes — raises
    /// [`EslError::Originate`] and rolls the registration back.
    pub async fn originate(
        session: &Session,
        destination: &str,
        uuid: Option<String>,
        variables: Option<&VarMap>,
        timeout: Option<Duration>,
        application_after: &str,
    ) -> Result<Channel, EslError> {
        let conn = session.connection().clone();
        let new_uuid = uuid.unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(uuid = %new_uuid, destination = %destination, "originating new channel");

        let mut vars = variables.cloned().unwrap_or_default();
        vars.set("origination_uuid", new_uuid.as_str());

        conn.send(&format!("filter Unique-ID {new_uuid}")).await?;

        let mut cmd = format!(
            "originate {}{destination} &{application_after}",
            vars.to_variable_string()
        );
        if let Some(timeout) = timeout {
            cmd.push_str(&format!(" timeout={}", timeout.as_secs()));
        }

        let channel = session.adopt_channel(&new_uuid);
        let originate_failed = |message: String| EslError::Originate {
            message,
            destination: destination.to_owned(),
            variables: vars.clone(),
        };

        let outcome = async {
            let mut job = conn.bgapi(&cmd, None).await?;
            let event = job.complete().await?;
            let body = event.body().unwrap_or("").trim();
            debug!(uuid = %new_uuid, response = %body, "originate job finished");
            if body.starts_with("-ERR") || body.to_uppercase().contains("ERROR") {
                return Err(originate_failed(body.to_owned()));
            }
            if channel.is_gone() {
                return Err(originate_failed(format!(
                    "channel {new_uuid} disconnected immediately"
                )));
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(uuid = %new_uuid, "originate succeeded");
                Ok(channel)
            }
            Err(e) => {
                channel.detach();
                session.evict_channel(&new_uuid);
                Err(e)
            }
        }
    }

    /// Attach a channel object for a UUID the session learned about
    /// (dispatcher-created legs, pre-generated bridge B-legs).
    pub(crate) fn attach(
        conn: EslConnection,
        uuid: &str,
        session: Option<Weak<crate::session::SessionInner>>,
    ) -> Channel {
        let channel = Self::new_inner(conn, "");
        channel
            .inner
            .uuid
            .set(uuid.to_owned())
            .expect("uuid set once at creation");
        *channel.inner.session.lock().unwrap() = session;
        channel.register_state_tracking();
        channel
    }

    // -- accessors -----------------------------------------------------------

    pub fn uuid(&self) -> Option<&str> {
        self.inner.uuid.get().map(String::as_str)
    }

    fn require_uuid(&self) -> Result<String, EslError> {
        self.uuid()
            .map(str::to_owned)
            .ok_or_else(|| EslError::Channel("channel has no UUID yet".to_owned()))
    }

    pub fn dial_path(&self) -> &str {
        &self.inner.dial_path
    }

    pub fn state(&self) -> ChannelState {
        self.inner.shared.lock().unwrap().state
    }

    pub fn call_state(&self) -> CallState {
        self.inner.shared.lock().unwrap().call_state
    }

    pub fn is_gone(&self) -> bool {
        let shared = self.inner.shared.lock().unwrap();
        shared.is_gone || shared.state.is_terminal()
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// When the channel first entered `state`, if it has.
    pub fn state_changed_at(&self, state: ChannelState) -> Option<Instant> {
        self.inner
            .shared
            .lock()
            .unwrap()
            .state_changes
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, at)| *at)
    }

    /// Cached channel variable (`variable_*` headers plus caller-id and
    /// channel-name keys).
    pub fn variable(&self, name: &str) -> Option<String> {
        self.inner.shared.lock().unwrap().variables.get(name).cloned()
    }

    /// Last-seen value of any channel header.
    pub fn context_value(&self, name: &str) -> Option<String> {
        self.inner.shared.lock().unwrap().context.get(name).cloned()
    }

    pub fn connection(&self) -> &EslConnection {
        &self.inner.conn
    }

    /// The owning outbound session, when this leg belongs to one.
    pub fn session(&self) -> Option<Session> {
        self.inner
            .session
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Session::from_inner)
    }

    fn ensure_alive(&self) -> Result<(), EslError> {
        if self.is_gone() {
            return Err(EslError::SessionGoneAway(
                self.uuid().unwrap_or("<unassigned>").to_owned(),
            ));
        }
        Ok(())
    }

    // -- state tracking ------------------------------------------------------

    fn register_state_tracking(&self) {
        let Some(uuid) = self.uuid().map(str::to_owned) else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.conn.on_channel(
            &uuid,
            "CHANNEL_STATE",
            EventHandler::task(move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        Channel { inner }.absorb_event(&event);
                    }
                }
            }),
        );
        *self.inner.state_handler.lock().unwrap() = Some(id);
    }

    /// Unregister the persistent state handler (session GC on destroy).
    pub(crate) fn detach(&self) {
        if let (Some(uuid), Some(id)) = (self.uuid(), self.inner.state_handler.lock().unwrap().take())
        {
            self.inner.conn.remove_channel(uuid, "CHANNEL_STATE", id);
        }
    }

    /// Fold one inbound event into the channel state.
    pub(crate) fn absorb_event(&self, event: &EslEvent) {
        let mut shared = self.inner.shared.lock().unwrap();

        if let Some(new_state) = ChannelState::from_event(event) {
            if new_state != shared.state {
                debug!(
                    uuid = ?self.uuid(),
                    from = %shared.state,
                    to = %new_state,
                    "channel state change"
                );
                shared.state_changes.push((new_state, Instant::now()));
                shared.state = new_state;
            }
        }

        if let Some(call_state) = CallState::from_event(event) {
            if call_state != shared.call_state {
                debug!(
                    uuid = ?self.uuid(),
                    from = %shared.call_state,
                    to = %call_state,
                    "call state change"
                );
                shared.call_state = call_state;
            }
        }

        if shared.call_state == CallState::Hangup || shared.state == ChannelState::Destroy {
            if !shared.is_gone {
                debug!(uuid = ?self.uuid(), "channel marked as gone");
            }
            shared.is_gone = true;
        }

        for (name, value) in event.iter() {
            let value = value.first();
            if let Some(var_name) = name.strip_prefix("variable_") {
                shared.variables.insert(var_name.to_owned(), value.to_owned());
            } else if VARIABLE_WHITELIST.contains(&name) {
                shared.variables.insert(name.to_owned(), value.to_owned());
            }
            shared.context.insert(name.to_owned(), value.to_owned());
        }
    }

    // -- waiting -------------------------------------------------------------

    /// Wait until the channel reaches `target`, a terminal state, or the
    /// timeout.
    ///
    /// Returns the state event when the target is reached, `None` when a
    /// terminal state arrived first (or the channel was already there),
    /// and [`EslError::Timeout`] when nothing happened in time.
    ///
    /// Waiting for [`ChannelState::Execute`] additionally requires a
    /// `CHANNEL_ANSWER` for this UUID, in either order: EXECUTE without
    /// answer is a transient pre-media state that must not be mistaken
    /// for an answered call.
    pub async fn wait_for_state(
        &self,
        target: ChannelState,
        timeout: Duration,
    ) -> Result<Option<EslEvent>, EslError> {
        let uuid = self.require_uuid()?;
        {
            let shared = self.inner.shared.lock().unwrap();
            if shared.state.is_terminal() {
                return Ok(None);
            }
            if shared.state == target && target != ChannelState::Execute {
                return Ok(None);
            }
        }

        struct WaitProgress {
            answered: bool,
            target_event: Option<EslEvent>,
        }
        let progress = Arc::new(Mutex::new(WaitProgress {
            answered: target != ChannelState::Execute,
            target_event: None,
        }));
        let (slot, rx) = resolution_slot();

        let router = self.inner.conn.router().clone();
        let state_id = router.allocate_id();
        let answer_id = router.allocate_id();
        let mut guard_entries = vec![GuardEntry::Channel {
            uuid: uuid.clone(),
            name: "CHANNEL_STATE".to_owned(),
            id: state_id,
        }];

        {
            let slot = slot.clone();
            let progress = progress.clone();
            router.on_channel_with_id(
                &uuid,
                "CHANNEL_STATE",
                state_id,
                EventHandler::task(move |event| {
                    let slot = slot.clone();
                    let progress = progress.clone();
                    async move {
                        let Some(event_state) = ChannelState::from_event(&event) else {
                            return;
                        };
                        if event_state == target {
                            let mut p = progress.lock().unwrap();
                            if p.answered {
                                drop(p);
                                resolve(&slot, Ok(event));
                            } else {
                                p.target_event = Some(event);
                            }
                        } else if event_state.is_terminal() {
                            // Terminal state won the race: resolve empty.
                            resolve(&slot, Err(EslError::SessionGoneAway(String::new())));
                        }
                    }
                }),
            );
        }

        if target == ChannelState::Execute {
            guard_entries.push(GuardEntry::Channel {
                uuid: uuid.clone(),
                name: "CHANNEL_ANSWER".to_owned(),
                id: answer_id,
            });
            let slot = slot.clone();
            let progress = progress.clone();
            let this = self.clone();
            router.on_channel_with_id(
                &uuid,
                "CHANNEL_ANSWER",
                answer_id,
                EventHandler::task(move |event| {
                    let slot = slot.clone();
                    let progress = progress.clone();
                    let this = this.clone();
                    async move {
                        let mut p = progress.lock().unwrap();
                        p.answered = true;
                        if let Some(state_event) = p.target_event.take() {
                            drop(p);
                            resolve(&slot, Ok(state_event));
                        } else if this.state() == ChannelState::Execute {
                            drop(p);
                            resolve(&slot, Ok(event));
                        }
                    }
                }),
            );
        }

        let guard = HandlerGuard::new(router, guard_entries);
        let outcome = self.await_resolution(rx, timeout, &format!("state {target}")).await;
        drop(guard);

        match outcome {
            Ok(event) => Ok(Some(event)),
            // The gone-away marker above means "terminal first": map to None.
            Err(EslError::SessionGoneAway(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Wait for a named event.
    ///
    /// The three channel-specific events (`CHANNEL_STATE`,
    /// `CHANNEL_ANSWER`, `CHANNEL_HANGUP_COMPLETE`) are filtered by this
    /// channel's UUID; everything else is delivered unscoped (see the
    /// note on [`CHANNEL_SPECIFIC_EVENTS`]).
    pub async fn wait_for_event(
        &self,
        event_name: &str,
        timeout: Duration,
    ) -> Result<EslEvent, EslError> {
        let (slot, rx) = resolution_slot();
        let router = self.inner.conn.router().clone();
        let id = router.allocate_id();

        let handler = {
            let slot = slot.clone();
            EventHandler::task(move |event| {
                let slot = slot.clone();
                async move {
                    resolve(&slot, Ok(event));
                }
            })
        };

        let guard_entry = if CHANNEL_SPECIFIC_EVENTS.contains(&event_name) {
            let uuid = self.require_uuid()?;
            router.on_channel_with_id(&uuid, event_name, id, handler);
            GuardEntry::Channel {
                uuid,
                name: event_name.to_owned(),
                id,
            }
        } else {
            router.on_with_id(event_name, id, handler);
            GuardEntry::Global {
                name: event_name.to_owned(),
                id,
            }
        };

        let guard = HandlerGuard::new(router, vec![guard_entry]);
        let outcome = self
            .await_resolution(rx, timeout, &format!("event {event_name}"))
            .await;
        drop(guard);
        outcome
    }

    /// Race a resolution against the timeout and connection death.
    async fn await_resolution(
        &self,
        rx: tokio::sync::oneshot::Receiver<Result<EslEvent, EslError>>,
        timeout: Duration,
        what: &str,
    ) -> Result<EslEvent, EslError> {
        let mut connected = self.inner.conn.connected_watch();
        let wait = async {
            tokio::select! {
                outcome = rx => outcome.unwrap_or(Err(EslError::ConnectionClosed)),
                _ = async {
                    loop {
                        if !*connected.borrow() { break; }
                        if connected.changed().await.is_err() { break; }
                    }
                } => Err(EslError::ConnectionClosed),
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                metrics().timeouts.fetch_add(1, Ordering::Relaxed);
                Err(EslError::Timeout(what.to_owned()))
            }
        }
    }

    // -- command dispatch ----------------------------------------------------

    /// Run a dialplan application and wait for it to complete.
    ///
    /// On an outbound session this is a correlated `sendmsg execute`; the
    /// call resolves when `CHANNEL_EXECUTE_COMPLETE` arrives, fails with
    /// [`EslError::OperationInterrupted`] if the channel hangs up first.
    /// On an inbound connection it translates to `api uuid_execute`.
    pub async fn execute(
        &self,
        application: &str,
        data: Option<&str>,
    ) -> Result<CommandResult, EslError> {
        let mut result = self.execute_nowait(application, data).await?;
        result.complete().await?;
        Ok(result)
    }

    /// Like [`Channel::execute`] with a completion deadline.
    pub async fn execute_within(
        &self,
        application: &str,
        data: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandResult, EslError> {
        let mut result = self.execute_nowait(application, data).await?;
        result.complete_within(timeout).await?;
        Ok(result)
    }

    /// Issue the execute and return right after the `+OK` reply; the
    /// result resolves in the background.
    pub async fn execute_nowait(
        &self,
        application: &str,
        data: Option<&str>,
    ) -> Result<CommandResult, EslError> {
        self.ensure_alive()?;
        let uuid = self.require_uuid()?;
        metrics().channel_operations.fetch_add(1, Ordering::Relaxed);

        if let Some(session) = self.session() {
            let msg =
                SendMsg::execute(application, data.map(str::to_owned)).with_uuid(uuid);
            return session.sendmsg(msg).await;
        }

        // Inbound path: api uuid_execute.
        let cmd = match data {
            Some(data) => format!("uuid_execute {uuid} {application} {data}"),
            None => format!("uuid_execute {uuid} {application}"),
        };
        let reply = self.inner.conn.api(&cmd).await?;
        Ok(CommandResult::immediate(reply))
    }

    // -- verbs ---------------------------------------------------------------

    pub async fn answer(&self) -> Result<CommandResult, EslError> {
        self.execute("answer", None).await
    }

    pub async fn park(&self) -> Result<CommandResult, EslError> {
        debug!(uuid = ?self.uuid(), "parking channel");
        self.execute("park", None).await
    }

    /// Hang the leg up.
    ///
    /// On a channel that is already terminal this is a no-op returning a
    /// synthetic `+OK` — no wire command is emitted.
    pub async fn hangup(&self, cause: &str) -> Result<CommandResult, EslError> {
        if self.is_gone() {
            info!(uuid = ?self.uuid(), "channel already hung up, skipping hangup");
            let mut reply = EslEvent::new();
            reply.set_header("Content-Type", "command/reply");
            reply.set_header("Reply-Text", "+OK Channel already hungup or gone");
            return Ok(CommandResult::immediate(reply));
        }

        let uuid = self.require_uuid()?;
        metrics().record_hangup_cause(cause);
        metrics().channel_operations.fetch_add(1, Ordering::Relaxed);
        metrics().call_duration.record(self.inner.created_at.elapsed());

        if let Some(session) = self.session() {
            let msg = SendMsg::hangup(cause).with_uuid(uuid);
            return session.sendmsg(msg).await;
        }
        let reply = self.inner.conn.api(&format!("uuid_kill {uuid} {cause}")).await?;
        Ok(CommandResult::immediate(reply))
    }

    pub async fn playback(&self, path: &str) -> Result<CommandResult, EslError> {
        self.execute("playback", Some(path)).await
    }

    /// Play `ms` milliseconds of silence.
    pub async fn silence(&self, ms: u32) -> Result<CommandResult, EslError> {
        debug!(uuid = ?self.uuid(), ms, "playing silence");
        self.playback(&format!("silence_stream://{ms}")).await
    }

    pub async fn say(&self, text: &str, options: &SayOptions) -> Result<CommandResult, EslError> {
        let arguments = options.to_arguments(text);
        debug!(arguments = %arguments, "say command arguments");
        self.execute("say", Some(&arguments)).await
    }

    pub async fn play_and_get_digits(
        &self,
        args: &PlayAndGetDigits,
    ) -> Result<CommandResult, EslError> {
        let arguments = args.to_arguments();
        debug!(arguments = %arguments, "play_and_get_digits arguments");
        self.execute("play_and_get_digits", Some(&arguments)).await
    }

    /// Log a message on the FreeSWITCH console via the `log` application.
    pub async fn log(&self, level: LogLevel, message: &str) -> Result<CommandResult, EslError> {
        self.execute("log", Some(&format!("{level} {message}"))).await
    }

    pub async fn set_variable(&self, name: &str, value: &str) -> Result<CommandResult, EslError> {
        self.execute("set", Some(&format!("{name}={value}"))).await
    }

    /// Read a channel variable from the local cache.
    pub fn get_variable(&self, name: &str) -> Result<Option<String>, EslError> {
        self.ensure_alive()?;
        Ok(self.variable(name))
    }

    // -- bridging ------------------------------------------------------------

    /// Bridge this leg to another leg or to a dial endpoint.
    ///
    /// Bridging to an existing [`Channel`] issues `uuid_bridge` as a
    /// background job.  Bridging to an endpoint string (outbound sessions
    /// only) pre-generates the B-leg UUID, propagates the A-leg caller-id
    /// origination variables unless overridden, and runs the `bridge`
    /// application; the returned result resolves when the bridge ends.
    pub async fn bridge(
        &self,
        target: BridgeTarget<'_>,
        variables: Option<&VarMap>,
    ) -> Result<BridgeOutcome, EslError> {
        if self.state().is_terminal() || self.is_gone() {
            return Err(EslError::Channel(format!(
                "cannot bridge channel in state {}",
                self.state()
            )));
        }
        let uuid = self.require_uuid()?;
        metrics().bridge_operations.fetch_add(1, Ordering::Relaxed);

        match target {
            BridgeTarget::Leg(other) => {
                let other_uuid = other.require_uuid()?;
                info!(a = %uuid, b = %other_uuid, "bridging existing legs via uuid_bridge");
                let job = self
                    .inner
                    .conn
                    .bgapi(&format!("uuid_bridge {uuid} {other_uuid}"), None)
                    .await?;
                Ok(BridgeOutcome::Job(job))
            }
            BridgeTarget::Endpoint(endpoint) => {
                let session = self.session().ok_or_else(|| {
                    EslError::Channel(
                        "endpoint bridge requires an outbound session".to_owned(),
                    )
                })?;

                let b_leg_uuid = Uuid::new_v4().to_string();
                let bridge_app_uuid = Uuid::new_v4().to_string();

                let mut vars = variables.cloned().unwrap_or_default();
                vars.set("origination_uuid", b_leg_uuid.as_str());
                for (var, source) in [
                    ("origination_caller_id_name", "Caller-Caller-ID-Name"),
                    ("origination_caller_id_number", "Caller-Caller-ID-Number"),
                ] {
                    if !vars.contains_key(var) {
                        if let Some(value) = self.variable(source).filter(|v| !v.is_empty()) {
                            vars.set(var, value);
                        }
                    }
                }

                let dial_string = format!("{}{endpoint}", vars.to_variable_string());
                info!(uuid = %uuid, target = %dial_string, "bridging to endpoint");

                let b_leg = session.adopt_channel(&b_leg_uuid);
                if let Err(e) = self
                    .inner
                    .conn
                    .send(&format!("filter Unique-ID {b_leg_uuid}"))
                    .await
                {
                    warn!(uuid = %b_leg_uuid, error = %e, "failed to add B-leg event filter");
                }

                let msg = SendMsg::execute("bridge", Some(dial_string))
                    .with_uuid(uuid)
                    .with_app_uuid(bridge_app_uuid);
                let result = session.sendmsg(msg).await?;
                Ok(BridgeOutcome::Executed { result, b_leg })
            }
        }
    }

    /// Break this leg out of its bridge via `uuid_transfer`.
    ///
    /// With `park = true` both legs are parked (`-both`); otherwise the
    /// leg is transferred to `destination`.
    pub async fn unbridge(
        &self,
        destination: Option<&str>,
        park: bool,
    ) -> Result<BackgroundJobResult, EslError> {
        self.ensure_alive()?;
        let uuid = self.require_uuid()?;

        let transfer_target = if park {
            "park:".to_owned()
        } else {
            destination.unwrap_or_default().to_owned()
        };
        let mut parts = vec!["uuid_transfer".to_owned(), uuid.clone()];
        if park {
            parts.push("-both".to_owned());
        }
        parts.push(transfer_target);
        parts.push("inline".to_owned());
        let cmd = parts.join(" ");

        info!(uuid = %uuid, park, "unbridging channel");
        self.inner.conn.bgapi(&cmd, None).await
    }

    // -- DTMF ----------------------------------------------------------------

    /// Register a handler invoked on each `DTMF` event whose digit matches
    /// (any digit when `digit` is `None`).
    ///
    /// DTMF delivery is intentionally not filtered by `Unique-ID` (see
    /// [`CHANNEL_SPECIFIC_EVENTS`]).
    pub fn on_dtmf<F, Fut>(&self, digit: Option<char>, handler: F) -> HandlerId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.inner.conn.on(
            "DTMF",
            EventHandler::task(move |event| {
                let handler = handler.clone();
                async move {
                    let Some(received) = event.get("DTMF-Digit").map(str::to_owned) else {
                        return;
                    };
                    if digit.is_some_and(|d| d.to_string() != received) {
                        return;
                    }
                    metrics().dtmf_received.fetch_add(1, Ordering::Relaxed);
                    handler(received).await;
                }
            }),
        )
    }

    /// Remove a handler registered with [`Channel::on_dtmf`].
    pub fn remove_dtmf(&self, id: HandlerId) {
        self.inner.conn.remove("DTMF", id);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock().unwrap();
        f.debug_struct("Channel")
            .field("uuid", &self.uuid())
            .field("state", &shared.state)
            .field("call_state", &shared.call_state)
            .field("is_gone", &shared.is_gone)
            .finish()
    }
}

/// Target of a [`Channel::bridge`].
pub enum BridgeTarget<'a> {
    /// An existing leg, bridged with `uuid_bridge`.
    Leg(&'a Channel),
    /// A dial endpoint string such as `user/1001`.
    Endpoint(&'a str),
}

/// What a bridge produced.
#[derive(Debug)]
pub enum BridgeOutcome {
    /// `uuid_bridge` background job.
    Job(BackgroundJobResult),
    /// `bridge` application running on the A-leg, plus the pre-created
    /// B-leg channel.
    Executed {
        result: CommandResult,
        b_leg: Channel,
    },
}

// ---------------------------------------------------------------------------
// Verb argument types
// ---------------------------------------------------------------------------

/// FreeSWITCH console log levels accepted by the `log` application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Console,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Console => "CONSOLE",
            LogLevel::Alert => "ALERT",
            LogLevel::Crit => "CRIT",
            LogLevel::Err => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        };
        write!(f, "{name}")
    }
}

/// Options for the `say` application.
#[derive(Debug, Clone)]
pub struct SayOptions {
    pub module: String,
    pub lang: Option<String>,
    pub kind: String,
    pub method: String,
    pub gender: String,
}

impl Default for SayOptions {
    fn default() -> Self {
        SayOptions {
            module: "en".to_owned(),
            lang: None,
            kind: "NUMBER".to_owned(),
            method: "pronounced".to_owned(),
            gender: "FEMININE".to_owned(),
        }
    }
}

impl SayOptions {
    fn to_arguments(&self, text: &str) -> String {
        let module = match &self.lang {
            Some(lang) => format!("{}:{lang}", self.module),
            None => self.module.clone(),
        };
        format!(
            "{module} {} {} {} {text}",
            self.kind, self.method, self.gender
        )
    }
}

/// Arguments for the `play_and_get_digits` application, in its positional
/// order.
#[derive(Debug, Clone, Default)]
pub struct PlayAndGetDigits {
    pub min_digits: u32,
    pub max_digits: u32,
    pub tries: u32,
    pub timeout_ms: u32,
    pub terminators: String,
    pub file: String,
    pub invalid_file: Option<String>,
    pub var_name: Option<String>,
    pub regexp: Option<String>,
    pub digit_timeout_ms: Option<u32>,
    pub transfer_on_failure: Option<String>,
}

impl PlayAndGetDigits {
    fn to_arguments(&self) -> String {
        let opt = |value: &Option<String>| value.clone().unwrap_or_default();
        let opt_num = |value: &Option<u32>| value.map(|v| v.to_string()).unwrap_or_default();
        let parts = [
            self.min_digits.to_string(),
            self.max_digits.to_string(),
            self.tries.to_string(),
            self.timeout_ms.to_string(),
            self.terminators.clone(),
            self.file.clone(),
            opt(&self.invalid_file),
            opt(&self.var_name),
            opt(&self.regexp),
            opt_num(&self.digit_timeout_ms),
            opt(&self.transfer_on_failure),
        ];
        parts.join(" ").trim_end().to_owned()
    }
}
