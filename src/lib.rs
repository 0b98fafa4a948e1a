//! switchboard: an async FreeSWITCH Event Socket Layer (ESL) client.
//!
//! Supports both connection modes:
//!
//! - **inbound** — the library dials FreeSWITCH, authenticates, and
//!   drives it with api/bgapi commands ([`Inbound`]);
//! - **outbound** — FreeSWITCH dials the library once per call, and the
//!   application drives the leg through a [`Session`] ([`Outbound`]).
//!
//! On top of the protocol engine sit call-leg abstractions
//! ([`Channel`]), dialplan application execution correlated by
//! `CHANNEL_EXECUTE_COMPLETE`, background jobs correlated by
//! `BACKGROUND_JOB` ([`BackgroundJobResult`]), and ring-group hunting
//! ([`RingGroup`]).
//!
//! ```no_run
//! use std::time::Duration;
//! use switchboard::{Inbound, Channel};
//! use esl_wire::ChannelState;
//!
//! # async fn example() -> Result<(), switchboard::EslError> {
//! let client = Inbound::connect("127.0.0.1", 8021, "ClueCon", Duration::from_secs(5)).await?;
//! let channel = Channel::create(client.connection(), "user/1000", None).await?;
//! channel.wait_for_state(ChannelState::Execute, Duration::from_secs(30)).await?;
//! channel.playback("/tmp/welcome.wav").await?;
//! channel.hangup("NORMAL_CLEARING").await?;
//! # Ok(())
//! # }
//! ```

mod bgapi;
mod channel;
mod config;
mod consumer;
mod error;
mod group;
mod inbound;
mod metrics;
mod outbound;
mod protocol;
mod results;
mod routing;
mod session;
mod transport;

pub use channel::{
    BridgeOutcome, BridgeTarget, Channel, LogLevel, PlayAndGetDigits, SayOptions,
};
pub use config::{
    ConfigError, EslConfig, InboundConfig, OutboundServerConfig, load_config,
    load_config_from_path, load_config_from_str,
};
pub use consumer::Consumer;
pub use error::EslError;
pub use group::{InMemoryBalancer, LoadBalancerBackend, PostgresBalancer, RingGroup, RingMode};
pub use inbound::Inbound;
pub use metrics::{Metrics, MetricsSnapshot, metrics};
pub use outbound::Outbound;
pub use protocol::{EslConnection, Role};
pub use results::{BackgroundJobResult, CommandResult};
pub use routing::{EventHandler, HandlerId, Router};
pub use session::{OutboundOptions, Session};
pub use transport::{FrameReader, RawFrame};

// Re-export the wire crate so applications need only one dependency.
pub use esl_wire;
