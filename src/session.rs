//! Outbound session: one accepted socket, one call.
//!
//! FreeSWITCH dials us once per call.  The session owns that connection,
//! keeps a map of every leg it knows about (A-leg first, B-legs from
//! bridges and originates), and runs the dispatcher that fans events out
//! to the owning channel.
//!
//! The A-leg materializes lazily: the `command/reply` answering `connect`
//! carries the full channel context (it is not named `CHANNEL_CREATE`,
//! but it is the creation trigger), so the dispatcher treats the first
//! such reply with a `Channel-State` header as channel creation.

use crate::channel::Channel;
use crate::error::EslError;
use crate::protocol::{EslConnection, Role};
use crate::results::{
    BackgroundJobResult, CommandResult, GuardEntry, HandlerGuard, resolution_slot, resolve,
};
use crate::routing::EventHandler;
use esl_wire::{CallCommand, EslEvent, SendMsg, VarMap, content_types};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound-mode startup options.
#[derive(Debug, Clone)]
pub struct OutboundOptions {
    /// Subscribe to events at all.
    pub events: bool,
    /// Use `myevents` (session-scoped subscription) instead of
    /// `event plain ALL` + a `filter Unique-ID` on the initial leg.
    pub myevents: bool,
    /// Send `linger` so events keep flowing after hangup.
    pub linger: bool,
}

impl Default for OutboundOptions {
    fn default() -> Self {
        OutboundOptions {
            events: true,
            myevents: false,
            linger: true,
        }
    }
}

pub(crate) struct SessionInner {
    conn: EslConnection,
    options: OutboundOptions,
    context: Mutex<HashMap<String, String>>,
    channels: Mutex<HashMap<String, Channel>>,
    channel_a: Mutex<Option<Channel>>,
}

/// Handle to one outbound session; cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Take ownership of an accepted socket, run the outbound handshake
    /// (`connect`, then `linger`/event subscription per options), and
    /// return the ready session.
    pub async fn start(stream: TcpStream, options: OutboundOptions) -> Result<Session, EslError> {
        let conn = EslConnection::start(stream, Role::Outbound);
        let inner = Arc::new(SessionInner {
            conn: conn.clone(),
            options: options.clone(),
            context: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            channel_a: Mutex::new(None),
        });
        let session = Session { inner };

        // The dispatcher is a wildcard subscriber; it must be in place
        // before `connect` so the reply can materialize the A-leg.
        let weak = Arc::downgrade(&session.inner);
        conn.on(
            "*",
            EventHandler::task(move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        Session { inner }.dispatch_event(event).await;
                    }
                }
            }),
        );

        let reply = conn.send("connect").await?;
        {
            let mut context = session.inner.context.lock().unwrap();
            for (name, value) in reply.iter() {
                context.insert(name.to_owned(), value.first().to_owned());
            }
        }
        // Materialize the A-leg through the same path the dispatcher
        // uses, so startup does not race the routed copy of the reply.
        session.dispatch_event(reply).await;

        if options.linger {
            conn.send("linger").await?;
            conn.set_lingering();
        }
        if options.events {
            if options.myevents {
                conn.send("myevents").await?;
            } else {
                conn.send("event plain ALL").await?;
                if let Some(uuid) = session.uuid() {
                    conn.send(&format!("filter Unique-ID {uuid}")).await?;
                }
            }
        }

        info!(uuid = ?session.uuid(), "outbound session established");
        Ok(session)
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Session {
        Session { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    // -- accessors -----------------------------------------------------------

    pub fn connection(&self) -> &EslConnection {
        &self.inner.conn
    }

    /// UUID of the initial leg, from the connect reply.
    pub fn uuid(&self) -> Option<String> {
        self.context_value("Unique-ID")
    }

    pub fn context_value(&self, name: &str) -> Option<String> {
        self.inner.context.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn context_snapshot(&self) -> Vec<(String, String)> {
        self.inner
            .context
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The originally connected leg, once materialized.
    pub fn channel_a(&self) -> Option<Channel> {
        self.inner.channel_a.lock().unwrap().clone()
    }

    pub fn channel(&self, uuid: &str) -> Option<Channel> {
        self.inner.channels.lock().unwrap().get(uuid).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().unwrap().len()
    }

    /// Create-and-register a channel object for a UUID this session owns
    /// (dispatcher-created legs, pre-generated bridge B-legs).  Idempotent:
    /// a UUID already in the map returns the existing channel, so the
    /// dispatcher task and a direct caller cannot double-create.
    pub(crate) fn adopt_channel(&self, uuid: &str) -> Channel {
        let mut channels = self.inner.channels.lock().unwrap();
        if let Some(existing) = channels.get(uuid) {
            return existing.clone();
        }
        let channel = Channel::attach(self.inner.conn.clone(), uuid, Some(self.downgrade()));
        channels.insert(uuid.to_owned(), channel.clone());
        debug!(uuid = %uuid, "adopted channel into session");
        channel
    }

    /// Drop a channel from the session's map (rollback of a failed
    /// originate).  The caller detaches the channel's handlers.
    pub(crate) fn evict_channel(&self, uuid: &str) {
        self.inner.channels.lock().unwrap().remove(uuid);
    }

    // -- dispatcher ----------------------------------------------------------

    /// Forward one event to the owning channel, creating channels for the
    /// designated creation triggers and garbage-collecting on destroy.
    async fn dispatch_event(&self, event: EslEvent) {
        let Some(target_uuid) = event.channel_uuid().map(str::to_owned) else {
            return;
        };
        let event_name = event.event_name().map(str::to_owned);

        let existing = self.channel(&target_uuid);
        let channel = match existing {
            Some(channel) => channel,
            None => {
                let is_creation_event = matches!(
                    event_name.as_deref(),
                    Some("CHANNEL_CREATE" | "CHANNEL_DATA")
                );
                let is_initial_connect_reply = self.channel_a().is_none()
                    && event.content_type() == Some(content_types::COMMAND_REPLY)
                    && event.contains("Channel-State");

                if !is_creation_event && !is_initial_connect_reply {
                    debug!(
                        uuid = %target_uuid,
                        event = ?event_name,
                        "event for unmanaged channel, ignoring"
                    );
                    return;
                }

                info!(uuid = %target_uuid, event = ?event_name, "creating channel");
                let channel = self.adopt_channel(&target_uuid);

                if !self.inner.options.myevents && !is_initial_connect_reply {
                    if let Err(e) = self
                        .inner
                        .conn
                        .send(&format!("filter Unique-ID {target_uuid}"))
                        .await
                    {
                        warn!(uuid = %target_uuid, error = %e, "filter for new channel failed");
                    }
                }

                let mut channel_a = self.inner.channel_a.lock().unwrap();
                if channel_a.is_none() {
                    info!(uuid = %target_uuid, "channel assigned as A-leg");
                    *channel_a = Some(channel.clone());
                }
                channel
            }
        };

        channel.absorb_event(&event);

        if event_name.as_deref() == Some("CHANNEL_DESTROY") {
            info!(uuid = %target_uuid, "channel destroyed, removing from session");
            channel.detach();
            self.inner.channels.lock().unwrap().remove(&target_uuid);
            let mut channel_a = self.inner.channel_a.lock().unwrap();
            if channel_a
                .as_ref()
                .and_then(Channel::uuid)
                .is_some_and(|u| u == target_uuid)
            {
                *channel_a = None;
            }
        }
    }

    // -- sendmsg + execute correlation ---------------------------------------

    /// Send one `sendmsg` command.
    ///
    /// For `execute` commands the correlation handlers are registered
    /// BEFORE the command is written, so the completion event can never
    /// be observed ahead of the `+OK` reply:
    /// `CHANNEL_EXECUTE_COMPLETE` matching the `Application-UUID`
    /// resolves the result; `CHANNEL_HANGUP` / `CHANNEL_DESTROY` on the
    /// target channel aborts it with
    /// [`EslError::OperationInterrupted`].  Exactly one outcome wins.
    pub async fn sendmsg(&self, mut msg: SendMsg) -> Result<CommandResult, EslError> {
        if msg.command != CallCommand::Execute {
            let reply = self.inner.conn.send(&msg.to_command()).await?;
            return Ok(CommandResult::immediate(reply));
        }

        let app_uuid = msg
            .app_uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        msg.app_uuid = Some(app_uuid.clone());
        let channel_uuid = msg.uuid.clone();

        let router = self.inner.conn.router().clone();
        let (slot, rx) = resolution_slot();
        let complete_id = router.allocate_id();
        let hangup_id = router.allocate_id();
        let destroy_id = router.allocate_id();

        let mut guard_entries = vec![GuardEntry::Global {
            name: "CHANNEL_EXECUTE_COMPLETE".to_owned(),
            id: complete_id,
        }];

        {
            let slot = slot.clone();
            let router = router.clone();
            let app_uuid = app_uuid.clone();
            let channel_uuid = channel_uuid.clone();
            router.clone().on_with_id(
                "CHANNEL_EXECUTE_COMPLETE",
                complete_id,
                EventHandler::task(move |event| {
                    let slot = slot.clone();
                    let router = router.clone();
                    let app_uuid = app_uuid.clone();
                    let channel_uuid = channel_uuid.clone();
                    async move {
                        if event.get("Application-UUID") != Some(app_uuid.as_str()) {
                            return;
                        }
                        debug!(app_uuid = %app_uuid, "execute completed");
                        resolve(&slot, Ok(event));
                        router.remove("CHANNEL_EXECUTE_COMPLETE", complete_id);
                        if channel_uuid.is_some() {
                            router.remove("CHANNEL_HANGUP", hangup_id);
                            router.remove("CHANNEL_DESTROY", destroy_id);
                        }
                    }
                }),
            );
        }

        if let Some(watched_uuid) = channel_uuid.clone() {
            for (name, id) in [("CHANNEL_HANGUP", hangup_id), ("CHANNEL_DESTROY", destroy_id)] {
                guard_entries.push(GuardEntry::Global {
                    name: name.to_owned(),
                    id,
                });
                let slot = slot.clone();
                let router = router.clone();
                let app_uuid = app_uuid.clone();
                let watched_uuid = watched_uuid.clone();
                router.clone().on_with_id(
                    name,
                    id,
                    EventHandler::task(move |event| {
                        let slot = slot.clone();
                        let router = router.clone();
                        let app_uuid = app_uuid.clone();
                        let watched_uuid = watched_uuid.clone();
                        async move {
                            if event.unique_id() != Some(watched_uuid.as_str()) {
                                return;
                            }
                            warn!(
                                app_uuid = %app_uuid,
                                channel = %watched_uuid,
                                event = ?event.event_name(),
                                "execute interrupted by hangup"
                            );
                            resolve(
                                &slot,
                                Err(EslError::OperationInterrupted {
                                    app_uuid: app_uuid.clone(),
                                    channel_uuid: watched_uuid.clone(),
                                }),
                            );
                            router.remove("CHANNEL_EXECUTE_COMPLETE", complete_id);
                            router.remove("CHANNEL_HANGUP", hangup_id);
                            router.remove("CHANNEL_DESTROY", destroy_id);
                        }
                    }),
                );
            }
        }

        let guard = HandlerGuard::new(router, guard_entries);
        debug!(
            app_uuid = %app_uuid,
            uuid = ?channel_uuid,
            application = %msg.application,
            "sending correlated execute"
        );
        let reply = match self.inner.conn.send(&msg.to_command()).await {
            Ok(reply) => reply,
            Err(e) => {
                drop(guard);
                return Err(e);
            }
        };

        Ok(CommandResult::pending(
            reply,
            app_uuid,
            channel_uuid,
            rx,
            self.inner.conn.connected_watch(),
            guard,
        ))
    }

    /// Run a dialplan application on the session's own channel and wait
    /// for completion.
    pub async fn execute(
        &self,
        application: &str,
        data: Option<&str>,
    ) -> Result<CommandResult, EslError> {
        let mut result = self
            .sendmsg(SendMsg::execute(application, data.map(str::to_owned)))
            .await?;
        result.complete().await?;
        Ok(result)
    }

    // -- A-leg verbs ---------------------------------------------------------

    pub async fn answer(&self) -> Result<CommandResult, EslError> {
        self.execute("answer", None).await
    }

    pub async fn park(&self) -> Result<CommandResult, EslError> {
        self.execute("park", None).await
    }

    /// Hang up via the `hangup` dialplan application.
    pub async fn hangup(&self, cause: &str) -> Result<CommandResult, EslError> {
        self.execute("hangup", Some(cause)).await
    }

    pub async fn playback(&self, path: &str) -> Result<CommandResult, EslError> {
        self.execute("playback", Some(path)).await
    }

    pub async fn say(
        &self,
        text: &str,
        options: &crate::channel::SayOptions,
    ) -> Result<CommandResult, EslError> {
        let channel = self
            .channel_a()
            .ok_or_else(|| EslError::Channel("session has no A-leg".to_owned()))?;
        channel.say(text, options).await
    }

    pub async fn log(
        &self,
        level: crate::channel::LogLevel,
        message: &str,
    ) -> Result<CommandResult, EslError> {
        self.execute("log", Some(&format!("{level} {message}"))).await
    }

    pub async fn play_and_get_digits(
        &self,
        args: &crate::channel::PlayAndGetDigits,
    ) -> Result<CommandResult, EslError> {
        let channel = self
            .channel_a()
            .ok_or_else(|| EslError::Channel("session has no A-leg".to_owned()))?;
        channel.play_and_get_digits(args).await
    }

    // -- bgapi + originate ---------------------------------------------------

    /// Execute a background API command on this session's connection.
    pub async fn bgapi(&self, command: &str) -> Result<BackgroundJobResult, EslError> {
        self.inner.conn.bgapi(command, None).await
    }

    /// Create a new leg with FreeSWITCH's `originate` command.
    ///
    /// Convenience wrapper around [`Channel::originate`].
    pub async fn originate(
        &self,
        destination: &str,
        uuid: Option<String>,
        variables: Option<&VarMap>,
        timeout: Option<Duration>,
        application_after: &str,
    ) -> Result<Channel, EslError> {
        info!(destination = %destination, "originating new call");
        Channel::originate(self, destination, uuid, variables, timeout, application_after).await
    }

    /// Bridge an owned leg to an endpoint; sugar over [`Channel::bridge`].
    pub async fn bridge(
        &self,
        channel: &Channel,
        target: &str,
        variables: Option<&VarMap>,
    ) -> Result<(CommandResult, Channel), EslError> {
        if channel.is_gone() {
            return Err(EslError::SessionGoneAway(
                channel.uuid().unwrap_or_default().to_owned(),
            ));
        }
        match channel
            .bridge(crate::channel::BridgeTarget::Endpoint(target), variables)
            .await?
        {
            crate::channel::BridgeOutcome::Executed { result, b_leg } => Ok((result, b_leg)),
            crate::channel::BridgeOutcome::Job(_) => Err(EslError::Channel(
                "endpoint bridge unexpectedly ran as a background job".to_owned(),
            )),
        }
    }

    /// Unbridge an owned leg; sugar over [`Channel::unbridge`].
    pub async fn unbridge(
        &self,
        channel: &Channel,
        destination: Option<&str>,
        park: bool,
    ) -> Result<BackgroundJobResult, EslError> {
        channel.unbridge(destination, park).await
    }

    /// Tear the session down.
    pub async fn stop(&self) {
        self.inner.conn.stop().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uuid", &self.uuid())
            .field("channels", &self.channel_count())
            .finish()
    }
}
