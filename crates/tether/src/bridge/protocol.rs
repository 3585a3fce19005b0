//! Wire protocol types for the connection envelope.
//!
//! Every top-level message on a transport is an [`Envelope`]: a marker, the
//! namespace key, the sender's connection uuid and one [`Message`].
//!
//! - **ready**: announce + capability probe payload
//! - **init**: the boxed exposed value
//! - **message**: boxed data for one sub-channel
//! - **port-closed**: the sender released its end of a sub-channel

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a sub-channel, namespaced by the connection that allocated it.
///
/// Rendered on the wire as `"<origin>:<id>"` so a receiver can tell which
/// endpoint's allocator owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId {
    origin: Uuid,
    id: Uuid,
}

impl ChannelId {
    pub fn new(origin: Uuid) -> Self {
        Self {
            origin,
            id: Uuid::new_v4(),
        }
    }

    pub fn from_parts(origin: Uuid, id: Uuid) -> Self {
        Self { origin, id }
    }

    /// Uuid of the connection that allocated this channel.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn parse(s: &str) -> Result<Self, ChannelIdError> {
        let (origin, id) = s.split_once(':').ok_or(ChannelIdError::MissingSeparator)?;
        Ok(Self {
            origin: Uuid::parse_str(origin)?,
            id: Uuid::parse_str(id)?,
        })
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.id)
    }
}

impl FromStr for ChannelId {
    type Err = ChannelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ChannelIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelIdError {
    #[error("channel id is missing the ':' separator")]
    MissingSeparator,
    #[error("invalid uuid in channel id: {0}")]
    Uuid(#[from] uuid::Error),
}

/// How a box refers to its sub-channel.
///
/// Either a native port carried in the envelope's transfer list (capable
/// transport) or a routed id (JSON-only transport) - never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelRef {
    Transfer(usize),
    PortId(ChannelId),
}

/// How a box refers to raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BufferRef {
    Transfer(usize),
    Base64(String),
}

/// Probe payload carried by `ready`.
///
/// The receiver checks whether the buffer and port arrived as live transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvCheck {
    pub buffer: BufferRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<ChannelRef>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "__tether__")]
    pub marker: bool,
    /// Namespace filter; connections sharing a transport ignore foreign keys.
    pub key: String,
    /// Sender's connection uuid.
    pub uuid: Uuid,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(key: impl Into<String>, uuid: Uuid, message: Message) -> Self {
        Self {
            marker: true,
            key: key.into(),
            uuid,
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Ready {
        #[serde(rename = "envCheck")]
        env_check: EnvCheck,
    },

    /// Boxed exposed value (sent once, after the first `ready`).
    Init { data: serde_json::Value },

    /// Boxed data routed to one sub-channel.
    #[serde(rename = "message")]
    Data {
        #[serde(rename = "portId")]
        port_id: ChannelId,
        data: serde_json::Value,
    },

    PortClosed {
        #[serde(rename = "portId")]
        port_id: ChannelId,
    },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Init { .. } => "init",
            Self::Data { .. } => "message",
            Self::PortClosed { .. } => "port-closed",
        }
    }
}
