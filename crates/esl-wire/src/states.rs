//! Channel and call state enums.
//!
//! `ChannelState` mirrors the FreeSWITCH `CS_*` machine and is ordered:
//! `state >= ChannelState::Hangup` means the leg is terminal.  `CallState`
//! mirrors `Channel-Call-State`, with `EARLY_MEDIA` normalized to `EARLY`.

use crate::event::EslEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Core state of a FreeSWITCH channel (the `CS_*` definitions).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ChannelState {
    New = 0,
    Init = 1,
    Routing = 2,
    SoftExecute = 3,
    Execute = 4,
    ExchangeMedia = 5,
    Park = 6,
    ConsumeMedia = 7,
    Hibernate = 8,
    Reset = 9,
    Hangup = 10,
    Reporting = 11,
    Destroy = 12,
    /// Should not be seen in normal operation.
    None = 13,
}

impl ChannelState {
    /// From `Channel-State-Number`.
    pub fn from_number(n: u8) -> Option<Self> {
        Some(match n {
            0 => ChannelState::New,
            1 => ChannelState::Init,
            2 => ChannelState::Routing,
            3 => ChannelState::SoftExecute,
            4 => ChannelState::Execute,
            5 => ChannelState::ExchangeMedia,
            6 => ChannelState::Park,
            7 => ChannelState::ConsumeMedia,
            8 => ChannelState::Hibernate,
            9 => ChannelState::Reset,
            10 => ChannelState::Hangup,
            11 => ChannelState::Reporting,
            12 => ChannelState::Destroy,
            13 => ChannelState::None,
            _ => return Option::None,
        })
    }

    /// From the `Channel-State` string, with or without the `CS_` prefix.
    pub fn from_cs_name(name: &str) -> Option<Self> {
        let name = name.trim();
        let name = name.strip_prefix("CS_").unwrap_or(name);
        Some(match name.to_uppercase().as_str() {
            "NEW" => ChannelState::New,
            "INIT" => ChannelState::Init,
            "ROUTING" => ChannelState::Routing,
            "SOFT_EXECUTE" => ChannelState::SoftExecute,
            "EXECUTE" => ChannelState::Execute,
            "EXCHANGE_MEDIA" => ChannelState::ExchangeMedia,
            "PARK" => ChannelState::Park,
            "CONSUME_MEDIA" => ChannelState::ConsumeMedia,
            "HIBERNATE" => ChannelState::Hibernate,
            "RESET" => ChannelState::Reset,
            "HANGUP" => ChannelState::Hangup,
            "REPORTING" => ChannelState::Reporting,
            "DESTROY" => ChannelState::Destroy,
            "NONE" => ChannelState::None,
            _ => return Option::None,
        })
    }

    /// Derive the state carried by an event, preferring the numeric header.
    pub fn from_event(event: &EslEvent) -> Option<Self> {
        if let Some(n) = event.get("Channel-State-Number") {
            if let Some(state) = n.trim().parse::<u8>().ok().and_then(Self::from_number) {
                return Some(state);
            }
        }
        event.get("Channel-State").and_then(Self::from_cs_name)
    }

    /// Whether the channel can accept no further commands.
    pub fn is_terminal(self) -> bool {
        self >= ChannelState::Hangup
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::New => "NEW",
            ChannelState::Init => "INIT",
            ChannelState::Routing => "ROUTING",
            ChannelState::SoftExecute => "SOFT_EXECUTE",
            ChannelState::Execute => "EXECUTE",
            ChannelState::ExchangeMedia => "EXCHANGE_MEDIA",
            ChannelState::Park => "PARK",
            ChannelState::ConsumeMedia => "CONSUME_MEDIA",
            ChannelState::Hibernate => "HIBERNATE",
            ChannelState::Reset => "RESET",
            ChannelState::Hangup => "HANGUP",
            ChannelState::Reporting => "REPORTING",
            ChannelState::Destroy => "DESTROY",
            ChannelState::None => "NONE",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// CallState
// ---------------------------------------------------------------------------

/// Call-specific state of a channel (`Channel-Call-State`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CallState {
    Down,
    Dialing,
    Ringing,
    Early,
    Active,
    Held,
    RingWait,
    Hangup,
    Unheld,
}

impl CallState {
    /// From the wire string; `EARLY_MEDIA` normalizes to `Early`.
    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name.trim().to_uppercase().as_str() {
            "DOWN" => CallState::Down,
            "DIALING" => CallState::Dialing,
            "RINGING" => CallState::Ringing,
            "EARLY" | "EARLY_MEDIA" => CallState::Early,
            "ACTIVE" => CallState::Active,
            "HELD" => CallState::Held,
            "RING_WAIT" => CallState::RingWait,
            "HANGUP" => CallState::Hangup,
            "UNHELD" => CallState::Unheld,
            _ => return None,
        })
    }

    pub fn from_event(event: &EslEvent) -> Option<Self> {
        event.get("Channel-Call-State").and_then(Self::from_wire)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Down => "DOWN",
            CallState::Dialing => "DIALING",
            CallState::Ringing => "RINGING",
            CallState::Early => "EARLY",
            CallState::Active => "ACTIVE",
            CallState::Held => "HELD",
            CallState::RingWait => "RING_WAIT",
            CallState::Hangup => "HANGUP",
            CallState::Unheld => "UNHELD",
        };
        write!(f, "{name}")
    }
}
