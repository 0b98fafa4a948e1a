//! Inbound ESL client.
//!
//! The library dials FreeSWITCH's event socket (default port 8021),
//! waits for `auth/request`, and authenticates with the password.  The
//! connect timeout applies only to the dial; once established, the
//! connection lives until [`Inbound::stop`] or a disconnect notice.

use crate::config::InboundConfig;
use crate::error::EslError;
use crate::protocol::{EslConnection, Role};
use crate::results::BackgroundJobResult;
use crate::routing::{EventHandler, HandlerId};
use crate::transport;
use esl_wire::EslEvent;
use std::time::Duration;
use tracing::{Instrument, debug};

/// An authenticated inbound connection to FreeSWITCH.
pub struct Inbound {
    conn: EslConnection,
}

impl Inbound {
    /// Connect and authenticate.
    pub async fn connect(
        host: &str,
        port: u16,
        password: &str,
        timeout: Duration,
    ) -> Result<Inbound, EslError> {
        let span = tracing::debug_span!("inbound_connect", host = host, port = port);
        async {
            let stream = transport::connect(host, port, timeout).await?;
            let conn = EslConnection::start(stream, Role::Inbound);

            if let Err(e) = conn.authenticate(password).await {
                conn.stop().await;
                return Err(e);
            }
            debug!("inbound connection authenticated");
            Ok(Inbound { conn })
        }
        .instrument(span)
        .await
    }

    /// Connect using a loaded [`InboundConfig`].
    pub async fn connect_with(config: &InboundConfig) -> Result<Inbound, EslError> {
        Self::connect(
            &config.host,
            config.port,
            &config.password,
            Duration::from_millis(config.connect_timeout_ms),
        )
        .await
    }

    pub fn connection(&self) -> &EslConnection {
        &self.conn
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Send one raw command and return its reply.
    pub async fn send(&self, command: &str) -> Result<EslEvent, EslError> {
        self.conn.send(command).await
    }

    /// `api <cmd>`.
    pub async fn api(&self, command: &str) -> Result<EslEvent, EslError> {
        self.conn.api(command).await
    }

    /// `bgapi <cmd>`, correlated by Job-UUID.
    pub async fn bgapi(&self, command: &str) -> Result<BackgroundJobResult, EslError> {
        self.conn.bgapi(command, None).await
    }

    /// Ask the server to start sending events (`events plain <classes>`),
    /// e.g. `"ALL"` or `"CHANNEL_ANSWER CHANNEL_HANGUP"`.
    pub async fn subscribe(&self, classes: &str) -> Result<EslEvent, EslError> {
        self.conn.send(&format!("events plain {classes}")).await
    }

    /// Install a server-side event filter.
    pub async fn filter(&self, header: &str, value: &str) -> Result<EslEvent, EslError> {
        self.conn.send(&format!("filter {header} {value}")).await
    }

    pub fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.conn.on(event, handler)
    }

    pub fn remove(&self, event: &str, id: HandlerId) {
        self.conn.remove(event, id);
    }

    /// Politely exit and tear the connection down.
    pub async fn stop(&self) {
        if self.conn.is_connected() {
            // Best effort; the server may already be gone.
            let _ = self.conn.send("exit").await;
        }
        self.conn.stop().await;
    }
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("connected", &self.is_connected())
            .finish()
    }
}
