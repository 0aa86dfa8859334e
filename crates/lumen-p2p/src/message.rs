//! Wire messages.
//!
//! Every frame carries one JSON object tagged by `type`.

use lumen_core::{Block, BusMessage};
use serde::{Deserialize, Serialize};

/// Blocks past `fromIndex` sent when `QUERY_ALL` has no limit.
pub const DEFAULT_QUERY_LIMIT: u64 = 5;

fn default_limit() -> u64 {
    DEFAULT_QUERY_LIMIT
}

/// Identity a node announces right after connecting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMeta {
    /// Bus address of the sender.
    pub bus_address: String,
    /// Port the sender accepts connections on, if any.
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Hash of the sender's genesis block.
    pub genesis_hash: String,
}

/// Peer protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Ask for the head block.
    QueryLatest,
    /// Ask for heights `from_index..=from_index + limit`.
    QueryAll {
        /// First height wanted.
        #[serde(rename = "fromIndex", default)]
        from_index: u64,
        /// Heights past `from_index`.
        #[serde(default = "default_limit")]
        limit: u64,
    },
    /// A run of blocks, usually ascending.
    ResponseBlockchain {
        /// The blocks.
        blocks: Vec<Block>,
    },
    /// Known peer addresses.
    MyPeers {
        /// `host:port` strings.
        peers: Vec<String>,
    },
    /// Gossip envelope.
    Broadcast(BusMessage),
    /// Sender identity.
    Meta(NodeMeta),
}

impl Message {
    /// Name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::QueryLatest => "QUERY_LATEST",
            Message::QueryAll { .. } => "QUERY_ALL",
            Message::ResponseBlockchain { .. } => "RESPONSE_BLOCKCHAIN",
            Message::MyPeers { .. } => "MY_PEERS",
            Message::Broadcast(_) => "BROADCAST",
            Message::Meta(_) => "META",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_all_limit_defaults() {
        let m: Message = serde_json::from_value(json!({"type": "QUERY_ALL", "fromIndex": 7})).unwrap();
        assert_eq!(
            m,
            Message::QueryAll {
                from_index: 7,
                limit: DEFAULT_QUERY_LIMIT
            }
        );
    }

    #[test]
    fn broadcast_envelope_is_flattened() {
        let bus = BusMessage::new(json!({"a": 1}), "to", "from", "id", 1, 0);
        let v = serde_json::to_value(Message::Broadcast(bus.clone())).unwrap();
        assert_eq!(v["type"], "BROADCAST");
        assert_eq!(v["receiver"], "to");
        let back: Message = serde_json::from_value(v).unwrap();
        assert_eq!(back, Message::Broadcast(bus));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_value::<Message>(json!({"type": "PASS"})).is_err());
    }
}
