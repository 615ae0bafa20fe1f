use serde::{Deserialize, Serialize};
use tidemark_util::{UnixMillis, unix_millis};

use crate::offset::Offset;

/// Internal compacted topic carrying consumer-group mark messages.
pub const CONSUMER_OFFSETS_TOPIC: &str = "__consumer_offsets";

/// Channel poison messages are re-produced onto after the redelivery budget
/// is exhausted. The spelling is part of the persisted format.
pub const DEAD_LETTER_CHANNEL: &str = "DeathLetter";

/// Channel a message lands on when the producer does not name one.
pub const DEFAULT_CHANNEL: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the partition leader during the append; zero until then.
    pub offset: Offset,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub clustering_key: Vec<u8>,
    pub channel: String,
    /// Set once by the original producer; redelivery never rewrites it.
    pub produced_at: UnixMillis,
}

impl Message {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            offset: Offset::ZERO,
            key: key.into(),
            value: value.into(),
            clustering_key: Vec::new(),
            channel: DEFAULT_CHANNEL.to_string(),
            produced_at: unix_millis(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Delivery state of one (group, offset). Ordered so that a bytewise max over
/// kinds picks the most settled state: Commited > Acknowledged > Consumed >
/// NotAcknowledged > Unknown.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum MarkKind {
    #[default]
    Unknown = 0,
    NotAcknowledged = 1,
    Consumed = 2,
    Acknowledged = 3,
    Committed = 4,
}

impl MarkKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Unknown),
            1 => Some(Self::NotAcknowledged),
            2 => Some(Self::Consumed),
            3 => Some(Self::Acknowledged),
            4 => Some(Self::Committed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarkState {
    pub kind: MarkKind,
    pub delivery_count: u32,
}

impl MarkState {
    pub fn new(kind: MarkKind, delivery_count: u32) -> Self {
        Self {
            kind,
            delivery_count,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_order_matches_settlement() {
        assert!(MarkKind::Unknown < MarkKind::NotAcknowledged);
        assert!(MarkKind::NotAcknowledged < MarkKind::Consumed);
        assert!(MarkKind::Consumed < MarkKind::Acknowledged);
        assert!(MarkKind::Acknowledged < MarkKind::Committed);
        for b in 0..=4u8 {
            assert_eq!(MarkKind::from_byte(b).unwrap().as_byte(), b);
        }
        assert!(MarkKind::from_byte(9).is_none());
    }

    #[test]
    fn message_round_trips_through_bincode() {
        let msg = Message::new(&b"k"[..], &b"v"[..]).with_channel("audit");
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
