//! `sendmsg` command text building.
//!
//! Outbound sessions drive a channel with `sendmsg` frames:
//!
//! ```text
//! sendmsg <uuid>
//! call-command: execute
//! execute-app-name: playback
//! execute-app-arg: /tmp/prompt.wav
//! Event-UUID: <app-uuid>
//! ```
//!
//! The blank-line terminator is appended by the transport, not here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The `call-command` of a `sendmsg` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallCommand {
    Execute,
    Hangup,
    Unicast,
    NoMedia,
    XferExt,
}

impl fmt::Display for CallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallCommand::Execute => "execute",
            CallCommand::Hangup => "hangup",
            CallCommand::Unicast => "unicast",
            CallCommand::NoMedia => "nomedia",
            CallCommand::XferExt => "xferext",
        };
        write!(f, "{name}")
    }
}

/// Builder for one `sendmsg` command.
#[derive(Debug, Clone)]
pub struct SendMsg {
    pub command: CallCommand,
    /// Dialplan application for `execute`.
    pub application: String,
    /// Application argument, or the hangup cause for `hangup`.
    pub data: Option<String>,
    /// Target channel; omitted on the socket's own channel.
    pub uuid: Option<String>,
    /// `Event-UUID` echoed back as `Application-UUID` in execute events.
    pub app_uuid: Option<String>,
    /// Emit `event-lock: true`.
    pub lock: bool,
    /// Extra headers appended verbatim.
    pub headers: Vec<(String, String)>,
}

impl SendMsg {
    pub fn execute(application: impl Into<String>, data: Option<String>) -> Self {
        SendMsg {
            command: CallCommand::Execute,
            application: application.into(),
            data,
            uuid: None,
            app_uuid: None,
            lock: false,
            headers: Vec::new(),
        }
    }

    pub fn hangup(cause: impl Into<String>) -> Self {
        SendMsg {
            command: CallCommand::Hangup,
            application: String::new(),
            data: Some(cause.into()),
            uuid: None,
            app_uuid: None,
            lock: false,
            headers: Vec::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_app_uuid(mut self, app_uuid: impl Into<String>) -> Self {
        self.app_uuid = Some(app_uuid.into());
        self
    }

    pub fn locked(mut self) -> Self {
        self.lock = true;
        self
    }

    /// Render the command text (no trailing blank line).
    pub fn to_command(&self) -> String {
        let mut cmd = match &self.uuid {
            Some(uuid) => format!("sendmsg {uuid}"),
            None => "sendmsg".to_owned(),
        };
        cmd.push_str(&format!("\ncall-command: {}", self.command));

        if self.command == CallCommand::Execute {
            cmd.push_str(&format!("\nexecute-app-name: {}", self.application));
            if let Some(data) = &self.data {
                cmd.push_str(&format!("\nexecute-app-arg: {data}"));
            }
            if let Some(app_uuid) = &self.app_uuid {
                cmd.push_str(&format!("\nEvent-UUID: {app_uuid}"));
            }
        }

        if self.lock {
            cmd.push_str("\nevent-lock: true");
        }

        if self.command == CallCommand::Hangup {
            let cause = self.data.as_deref().unwrap_or("NORMAL_CLEARING");
            cmd.push_str(&format!("\nhangup-cause: {cause}"));
        }

        for (name, value) in &self.headers {
            cmd.push_str(&format!("\n{name}: {value}"));
        }

        cmd
    }
}
