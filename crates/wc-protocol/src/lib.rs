// wc-protocol: WalletConnect v1 bridge wire schema and bus key derivation.
//
// Every frame that crosses a relay socket or the shared bus is one
// `SocketMessage` serialized as JSON.  `role` and `phase` stay raw strings on
// the wire so values the relay does not recognize pass through untouched;
// the constants modules below name the values the relay acts on.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message schema
// ---------------------------------------------------------------------------

/// Message type discriminator. The only required field of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Pub,
    Sub,
    Ack,
    Ping,
    Pong,
}

/// A single relay frame, identical on the client socket and on the bus.
///
/// All fields except `type` are optional on the wire and default when
/// absent; unknown extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketMessage {
    #[serde(default)]
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub silent: bool,
}

impl SocketMessage {
    /// A bare frame of the given type with every optional field empty.
    pub fn of_kind(kind: MessageType) -> Self {
        SocketMessage {
            topic: String::new(),
            kind,
            payload: String::new(),
            role: String::new(),
            phase: String::new(),
            silent: false,
        }
    }
}

/// Wire values of the `role` field the relay acts on.
pub mod role {
    pub const DAPP: &str = "dapp";
    pub const WALLET: &str = "wallet";
    pub const RELAY: &str = "relay";
}

/// Wire values of the `phase` field. Session lifecycle:
/// request -> received -> start, with suspended/resumed around wallet
/// hibernation and expired when no wallet ever picks the request up.
pub mod phase {
    pub const SESSION_REQUEST: &str = "sessionRequest";
    pub const SESSION_RECEIVED: &str = "sessionReceived";
    pub const SESSION_EXPIRED: &str = "sessionExpired";
    pub const SESSION_START: &str = "sessionStart";
    pub const SESSION_SUSPENDED: &str = "sessionSuspended";
    pub const SESSION_RESUMED: &str = "sessionResumed";
}

// ---------------------------------------------------------------------------
// Bus channel and cache key derivation
// ---------------------------------------------------------------------------

// Literal prefixes; the topic is appended verbatim.
const MESSAGE_CHAN_PREFIX: &str = "wc:relay:chan:messages:";
const DAPP_NOTIFY_CHAN_PREFIX: &str = "wc:relay:chan:dappNotify:";
const CACHED_MESSAGES_PREFIX: &str = "wc:relay:cache:pendingMessages:";

/// Bus channel carrying published frames for `topic`.
pub fn message_channel(topic: &str) -> String {
    format!("{MESSAGE_CHAN_PREFIX}{topic}")
}

/// Bus channel carrying relay-generated wallet-presence events for the
/// dapp publishing on `topic`.
pub fn dapp_notify_channel(topic: &str) -> String {
    format!("{DAPP_NOTIFY_CHAN_PREFIX}{topic}")
}

/// Store key of the per-topic offline message cache list.
pub fn cached_messages_key(topic: &str) -> String {
    format!("{CACHED_MESSAGES_PREFIX}{topic}")
}

/// Whether a bus delivery arrived on a dapp-notify channel (as opposed to a
/// message channel).
pub fn is_dapp_notify_channel(channel: &str) -> bool {
    channel.starts_with(DAPP_NOTIFY_CHAN_PREFIX)
}
