use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Peer process identity. Larger values outrank smaller ones; uniqueness
/// within a multicast group is an operator responsibility.
pub type Pid = u64;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Wire envelope: one JSON object per datagram, self-describing through the
/// `type` tag so heterogeneous implementations interoperate. Receivers drop
/// anything that fails to decode, including unknown type tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "HELLO")]
    Hello { from: Pid },

    #[serde(rename = "HELLO_ACK")]
    HelloAck { from: Pid, leader: Pid, round: u64 },

    #[serde(rename = "ELECTION")]
    Election { from: Pid },

    #[serde(rename = "OK")]
    Okay { from: Pid },

    #[serde(rename = "LEADER")]
    Leader {
        from: Pid,
        pid: Pid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u64>,
    },

    #[serde(rename = "HB")]
    Heartbeat { from: Pid },

    #[serde(rename = "ROUND_QUERY")]
    RoundQuery { from: Pid },

    #[serde(rename = "ROUND_RESPONSE")]
    RoundResponse { from: Pid, round: u64 },

    #[serde(rename = "ROUND_UPDATE")]
    RoundUpdate { from: Pid, round: u64 },

    #[serde(rename = "START_CONSENSUS")]
    StartConsensus { from: Pid, round: u64, leader: Pid },

    #[serde(rename = "VALUE")]
    Value { from: Pid, round: u64, value: u64 },

    #[serde(rename = "RESPONSE")]
    Response { from: Pid, round: u64, response: u64 },
}

impl Message {
    /// Serialize for the wire. Cannot fail for any constructible message.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("wire messages always serialize")
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// The sending peer, carried by every message type.
    pub fn sender(&self) -> Pid {
        match self {
            Message::Hello { from }
            | Message::HelloAck { from, .. }
            | Message::Election { from }
            | Message::Okay { from }
            | Message::Leader { from, .. }
            | Message::Heartbeat { from }
            | Message::RoundQuery { from }
            | Message::RoundResponse { from, .. }
            | Message::RoundUpdate { from, .. }
            | Message::StartConsensus { from, .. }
            | Message::Value { from, .. }
            | Message::Response { from, .. } => *from,
        }
    }
}
