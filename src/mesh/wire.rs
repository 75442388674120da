//! Wire protocol: the typed message table.
//!
//! Every frame is a JSON object carrying a `"type"` field with the numeric
//! message code. Decoding dispatches on that code into a typed variant, so
//! an unhandled code is a compile-time-visible missing arm rather than a
//! stringly-typed lookup.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::models::{Agent, BoardMessage, Node, NodeId, Task};

use super::codec::CodecError;

/// Wire codes. Kept in one place so the table reads like the protocol doc.
pub mod code {
    pub const HELLO: u8 = 0x01;
    pub const PEX: u8 = 0x05;
    pub const PING: u8 = 0x06;
    pub const PONG: u8 = 0x07;
    pub const TASK_CREATE: u8 = 0x10;
    pub const TASK_CLAIM: u8 = 0x11;
    pub const TASK_UPDATE: u8 = 0x12;
    pub const TASK_COMPLETE: u8 = 0x13;
    pub const TASK_FAIL: u8 = 0x14;
    pub const TASK_CANCEL: u8 = 0x15;
    pub const AGENT_REGISTER: u8 = 0x20;
    pub const AGENT_HEARTBEAT: u8 = 0x21;
    pub const AGENT_DEREGISTER: u8 = 0x22;
    pub const SYNC_REQ: u8 = 0x30;
    pub const SYNC_RSP: u8 = 0x31;
    pub const EMPEROR_HEARTBEAT: u8 = 0x40;
    pub const ELECTION_START: u8 = 0x41;
    pub const ELECTION_VICTORY: u8 = 0x42;
    pub const BOARD_POST: u8 = 0x50;
    pub const NODE_REGISTER: u8 = 0xB0;
    pub const NODE_STATUS: u8 = 0xB1;
}

/// Connection handshake. `auth` is present when the cluster runs with a
/// shared secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub node_id: NodeId,
    pub p2p_port: u16,
    pub http_port: u16,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Peer-exchange gossip: a bounded union of known addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pex {
    pub peers: Vec<String>,
}

/// Keepalive probe and its echo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub node_id: NodeId,
    pub timestamp: i64,
}

/// Full-record task replication payloads. The extra fields beside `task`
/// mirror the protocol table so sparse consumers can skip the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreate {
    pub message_id: Uuid,
    pub task: Task,
}

/// A claim ticket. Deliberately *not* a full record: claims resolve through
/// the deterministic claim resolver, not last-writer-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskClaim {
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub node_id: NodeId,
    pub lamport_ts: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub message_id: Uuid,
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    pub lamport_ts: u64,
    pub task: Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskComplete {
    pub message_id: Uuid,
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub lamport_ts: u64,
    pub task: Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFail {
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub error: String,
    pub lamport_ts: u64,
    pub task: Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCancel {
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub task: Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentGossip {
    pub message_id: Uuid,
    pub agent: Agent,
}

/// Anti-entropy pull request: everything after the watermark, please.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReq {
    pub node_id: NodeId,
    pub since_lamport_ts: u64,
}

/// Anti-entropy response carrying every record class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRsp {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub board_messages: Vec<BoardMessage>,
}

/// Election traffic: heartbeat, challenge, and victory all carry the same
/// shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionNotice {
    pub node_id: NodeId,
    pub lamport_ts: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardPost {
    pub message_id: Uuid,
    pub message: BoardMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGossip {
    pub message_id: Uuid,
    pub node: Node,
}

/// Every message that can cross the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Pex(Pex),
    Ping(Ping),
    Pong(Ping),
    TaskCreate(TaskCreate),
    TaskClaim(TaskClaim),
    TaskUpdate(TaskUpdate),
    TaskComplete(TaskComplete),
    TaskFail(TaskFail),
    TaskCancel(TaskCancel),
    AgentRegister(AgentGossip),
    AgentHeartbeat(AgentGossip),
    AgentDeregister(AgentGossip),
    SyncReq(SyncReq),
    SyncRsp(Box<SyncRsp>),
    EmperorHeartbeat(ElectionNotice),
    ElectionStart(ElectionNotice),
    ElectionVictory(ElectionNotice),
    BoardPost(BoardPost),
    NodeRegister(NodeGossip),
    NodeStatus(NodeGossip),
}

impl Message {
    /// Numeric wire code of this message.
    pub fn code(&self) -> u8 {
        match self {
            Self::Hello(_) => code::HELLO,
            Self::Pex(_) => code::PEX,
            Self::Ping(_) => code::PING,
            Self::Pong(_) => code::PONG,
            Self::TaskCreate(_) => code::TASK_CREATE,
            Self::TaskClaim(_) => code::TASK_CLAIM,
            Self::TaskUpdate(_) => code::TASK_UPDATE,
            Self::TaskComplete(_) => code::TASK_COMPLETE,
            Self::TaskFail(_) => code::TASK_FAIL,
            Self::TaskCancel(_) => code::TASK_CANCEL,
            Self::AgentRegister(_) => code::AGENT_REGISTER,
            Self::AgentHeartbeat(_) => code::AGENT_HEARTBEAT,
            Self::AgentDeregister(_) => code::AGENT_DEREGISTER,
            Self::SyncReq(_) => code::SYNC_REQ,
            Self::SyncRsp(_) => code::SYNC_RSP,
            Self::EmperorHeartbeat(_) => code::EMPEROR_HEARTBEAT,
            Self::ElectionStart(_) => code::ELECTION_START,
            Self::ElectionVictory(_) => code::ELECTION_VICTORY,
            Self::BoardPost(_) => code::BOARD_POST,
            Self::NodeRegister(_) => code::NODE_REGISTER,
            Self::NodeStatus(_) => code::NODE_STATUS,
        }
    }

    /// Dedup id for gossip-class messages; point-to-point traffic has none.
    pub fn message_id(&self) -> Option<Uuid> {
        match self {
            Self::TaskCreate(m) => Some(m.message_id),
            Self::TaskClaim(m) => Some(m.message_id),
            Self::TaskUpdate(m) => Some(m.message_id),
            Self::TaskComplete(m) => Some(m.message_id),
            Self::TaskFail(m) => Some(m.message_id),
            Self::TaskCancel(m) => Some(m.message_id),
            Self::AgentRegister(m) | Self::AgentHeartbeat(m) | Self::AgentDeregister(m) => {
                Some(m.message_id)
            }
            Self::BoardPost(m) => Some(m.message_id),
            Self::NodeRegister(m) | Self::NodeStatus(m) => Some(m.message_id),
            _ => None,
        }
    }

    /// Serialize into the JSON object form with the `type` tag injected.
    pub fn to_value(&self) -> Result<Value, CodecError> {
        fn tagged<T: Serialize>(code: u8, payload: &T) -> Result<Value, CodecError> {
            let mut value = serde_json::to_value(payload)?;
            match value.as_object_mut() {
                Some(map) => {
                    map.insert("type".to_string(), Value::from(code));
                    Ok(value)
                }
                None => Err(CodecError::NotAnObject),
            }
        }

        match self {
            Self::Hello(m) => tagged(code::HELLO, m),
            Self::Pex(m) => tagged(code::PEX, m),
            Self::Ping(m) => tagged(code::PING, m),
            Self::Pong(m) => tagged(code::PONG, m),
            Self::TaskCreate(m) => tagged(code::TASK_CREATE, m),
            Self::TaskClaim(m) => tagged(code::TASK_CLAIM, m),
            Self::TaskUpdate(m) => tagged(code::TASK_UPDATE, m),
            Self::TaskComplete(m) => tagged(code::TASK_COMPLETE, m),
            Self::TaskFail(m) => tagged(code::TASK_FAIL, m),
            Self::TaskCancel(m) => tagged(code::TASK_CANCEL, m),
            Self::AgentRegister(m) => tagged(code::AGENT_REGISTER, m),
            Self::AgentHeartbeat(m) => tagged(code::AGENT_HEARTBEAT, m),
            Self::AgentDeregister(m) => tagged(code::AGENT_DEREGISTER, m),
            Self::SyncReq(m) => tagged(code::SYNC_REQ, m),
            Self::SyncRsp(m) => tagged(code::SYNC_RSP, m.as_ref()),
            Self::EmperorHeartbeat(m) => tagged(code::EMPEROR_HEARTBEAT, m),
            Self::ElectionStart(m) => tagged(code::ELECTION_START, m),
            Self::ElectionVictory(m) => tagged(code::ELECTION_VICTORY, m),
            Self::BoardPost(m) => tagged(code::BOARD_POST, m),
            Self::NodeRegister(m) => tagged(code::NODE_REGISTER, m),
            Self::NodeStatus(m) => tagged(code::NODE_STATUS, m),
        }
    }

    /// Decode the JSON object form, dispatching on the `type` tag.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let tag = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or(CodecError::MissingType)?;
        let tag = u8::try_from(tag).map_err(|_| CodecError::UnknownType(u8::MAX))?;

        fn payload<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
            Ok(serde_json::from_value(value)?)
        }

        Ok(match tag {
            code::HELLO => Self::Hello(payload(value)?),
            code::PEX => Self::Pex(payload(value)?),
            code::PING => Self::Ping(payload(value)?),
            code::PONG => Self::Pong(payload(value)?),
            code::TASK_CREATE => Self::TaskCreate(payload(value)?),
            code::TASK_CLAIM => Self::TaskClaim(payload(value)?),
            code::TASK_UPDATE => Self::TaskUpdate(payload(value)?),
            code::TASK_COMPLETE => Self::TaskComplete(payload(value)?),
            code::TASK_FAIL => Self::TaskFail(payload(value)?),
            code::TASK_CANCEL => Self::TaskCancel(payload(value)?),
            code::AGENT_REGISTER => Self::AgentRegister(payload(value)?),
            code::AGENT_HEARTBEAT => Self::AgentHeartbeat(payload(value)?),
            code::AGENT_DEREGISTER => Self::AgentDeregister(payload(value)?),
            code::SYNC_REQ => Self::SyncReq(payload(value)?),
            code::SYNC_RSP => Self::SyncRsp(Box::new(payload(value)?)),
            code::EMPEROR_HEARTBEAT => Self::EmperorHeartbeat(payload(value)?),
            code::ELECTION_START => Self::ElectionStart(payload(value)?),
            code::ELECTION_VICTORY => Self::ElectionVictory(payload(value)?),
            code::BOARD_POST => Self::BoardPost(payload(value)?),
            code::NODE_REGISTER => Self::NodeRegister(payload(value)?),
            code::NODE_STATUS => Self::NodeStatus(payload(value)?),
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::NodeId;

    #[test]
    fn type_tag_is_injected() {
        let msg = Message::Ping(Ping { node_id: NodeId::from_string("aaaa"), timestamp: 7 });
        let value = msg.to_value().unwrap();
        assert_eq!(value.get("type").and_then(Value::as_u64), Some(u64::from(code::PING)));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let value = serde_json::json!({ "type": 0xEE, "whatever": 1 });
        assert!(matches!(Message::from_value(value), Err(CodecError::UnknownType(0xEE))));
    }

    #[test]
    fn missing_type_is_rejected() {
        let value = serde_json::json!({ "node_id": "aaaa" });
        assert!(matches!(Message::from_value(value), Err(CodecError::MissingType)));
    }

    #[test]
    fn round_trip_every_point_to_point_type() {
        let node = NodeId::from_string("aaaa");
        let messages = vec![
            Message::Hello(Hello {
                node_id: node.clone(),
                p2p_port: 7700,
                http_port: 7780,
                role: "worker".into(),
                auth: None,
            }),
            Message::Pex(Pex { peers: vec!["10.0.0.1:7700".into()] }),
            Message::Ping(Ping { node_id: node.clone(), timestamp: 1 }),
            Message::Pong(Ping { node_id: node.clone(), timestamp: 2 }),
            Message::SyncReq(SyncReq { node_id: node.clone(), since_lamport_ts: 9 }),
            Message::EmperorHeartbeat(ElectionNotice { node_id: node.clone(), lamport_ts: 3 }),
            Message::ElectionStart(ElectionNotice { node_id: node.clone(), lamport_ts: 4 }),
            Message::ElectionVictory(ElectionNotice { node_id: node, lamport_ts: 5 }),
        ];
        for msg in messages {
            let value = msg.to_value().unwrap();
            let decoded = Message::from_value(value).unwrap();
            assert_eq!(decoded, msg);
        }
    }
}
