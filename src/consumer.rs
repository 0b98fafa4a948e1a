//! Event-consumer sugar over the inbound client.
//!
//! Register handlers first, then [`Consumer::start`]: it connects,
//! subscribes to all events, installs one server-side filter per
//! registered key (`filter Event-Name <NAME>` for upper-case keys,
//! `filter Event-Subclass <name>` for CUSTOM subclasses), and parks
//! until the connection dies.

use crate::config::InboundConfig;
use crate::error::EslError;
use crate::inbound::Inbound;
use crate::routing::EventHandler;
use std::sync::Mutex;
use tracing::debug;

/// A long-running ESL event consumer.
pub struct Consumer {
    config: InboundConfig,
    registrations: Mutex<Vec<(String, EventHandler)>>,
    inbound: Mutex<Option<Inbound>>,
}

impl Consumer {
    pub fn new(config: InboundConfig) -> Self {
        Consumer {
            config,
            registrations: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
        }
    }

    /// Register a handler for an event name (upper-case) or a CUSTOM
    /// subclass (anything else).  Must be called before [`Consumer::start`].
    pub fn handle(&self, key: &str, handler: EventHandler) {
        debug!(key = %key, "consumer handler registered");
        self.registrations
            .lock()
            .unwrap()
            .push((key.to_owned(), handler));
    }

    /// Connect, subscribe, install filters, and block until the
    /// connection closes.
    pub async fn start(&self) -> Result<(), EslError> {
        let inbound = Inbound::connect_with(&self.config).await?;

        let registrations: Vec<(String, EventHandler)> = self
            .registrations
            .lock()
            .unwrap()
            .iter()
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect();
        for (key, handler) in &registrations {
            inbound.on(key, handler.clone());
        }

        debug!("asking freeswitch to send all events");
        inbound.subscribe("ALL").await?;

        for (key, _) in &registrations {
            if key.chars().all(|c| !c.is_lowercase()) {
                debug!(event = %key, "filtering by event name");
                inbound.filter("Event-Name", key).await?;
            } else {
                debug!(subclass = %key, "filtering by event subclass");
                inbound.filter("Event-Subclass", key).await?;
            }
        }

        let conn = inbound.connection().clone();
        *self.inbound.lock().unwrap() = Some(inbound);

        // Park until the connection dies or stop() is called.
        conn.wait_closed().await;
        Ok(())
    }

    /// Stop the underlying connection, unblocking [`Consumer::start`].
    pub async fn stop(&self) {
        let inbound = self.inbound.lock().unwrap().take();
        if let Some(inbound) = inbound {
            inbound.stop().await;
        }
    }
}
