//! Outbound ESL socket server.
//!
//! FreeSWITCH's dialplan points `socket` at us (one TCP connection per
//! call); the server accepts each connection, runs the outbound
//! handshake, and hands the ready [`Session`] to the application
//! handler in its own task.

use crate::error::EslError;
use crate::session::{OutboundOptions, Session};
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

type SessionHandler = Arc<dyn Fn(Session) -> BoxFuture<'static, ()> + Send + Sync>;

/// The accept server for outbound mode.
pub struct Outbound {
    listener: TcpListener,
    options: OutboundOptions,
    handler: SessionHandler,
}

impl Outbound {
    /// Bind the listener (use port 0 to let the OS choose) and install
    /// the per-call handler.
    pub async fn bind<F, Fut>(
        addr: &str,
        options: OutboundOptions,
        handler: F,
    ) -> Result<Outbound, EslError>
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "outbound server listening");
        Ok(Outbound {
            listener,
            options,
            handler: Arc::new(move |session| Box::pin(handler(session))),
        })
    }

    /// The bound address (useful when port 0 was requested).
    pub fn local_addr(&self) -> Result<SocketAddr, EslError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop.  Consumes `self`; each accepted call gets its
    /// own session task.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "freeswitch connected");
                    let options = self.options.clone();
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        match Session::start(stream, options).await {
                            Ok(session) => {
                                handler(session.clone()).await;
                                session.stop().await;
                            }
                            Err(e) => {
                                error!(error = %e, "outbound handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}
