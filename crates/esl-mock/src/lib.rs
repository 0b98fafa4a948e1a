// esl-mock: a mock FreeSWITCH ESL endpoint for integration tests.
//
// Two roles are covered:
// - `MockFreeswitch` plays the server side of inbound mode (the library
//   dials it, authenticates, and sends api/bgapi commands);
// - `MockOutboundLeg` plays FreeSWITCH dialing an outbound socket server
//   (it connects, answers `connect` with channel headers, and acks
//   `sendmsg` commands).
//
// Only ESL wire behavior is simulated; no SIP, no media.

mod outbound_leg;
mod server;

pub use outbound_leg::{MockOutboundLeg, OutboundLegConfig};
pub use server::{MockFreeswitch, MockReply};

/// Default mock password, matching the FreeSWITCH default.
pub const DEFAULT_PASSWORD: &str = "ClueCon";
