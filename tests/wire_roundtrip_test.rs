mod common;

use uuid::Uuid;
use voidlux::domain::models::{Agent, BoardMessage, Node, NodeId, NodeRole};
use voidlux::mesh::wire::{
    AgentGossip, BoardPost, Message, NodeGossip, SyncRsp, TaskClaim, TaskComplete, TaskCreate,
};
use voidlux::mesh::{encode, FrameBuffer};

use common::test_task;

fn round_trip(message: Message) {
    let mut buf = FrameBuffer::new();
    buf.extend(&encode(&message).unwrap());
    let decoded = buf.decode_all().unwrap();
    assert_eq!(decoded, vec![message]);
    assert!(buf.is_empty());
}

#[test]
fn task_records_survive_the_wire() {
    let mut task = test_task("round trip", "aaaa");
    task.required_capabilities = vec!["rust".to_string(), "git".to_string()];
    task.depends_on = vec![Uuid::new_v4()];
    task.lamport_ts = 42;
    task.review_feedback = Some("tighten the error handling".to_string());

    round_trip(Message::TaskCreate(TaskCreate { message_id: Uuid::new_v4(), task: task.clone() }));
    round_trip(Message::TaskComplete(TaskComplete {
        message_id: Uuid::new_v4(),
        task_id: task.id,
        result: Some("done".to_string()),
        lamport_ts: 43,
        task,
    }));
}

#[test]
fn claim_tickets_survive_the_wire() {
    round_trip(Message::TaskClaim(TaskClaim {
        message_id: Uuid::new_v4(),
        task_id: Uuid::new_v4(),
        agent_id: Uuid::new_v4(),
        node_id: NodeId::from_string("aaaa"),
        lamport_ts: 5,
    }));
}

#[test]
fn agent_and_node_records_survive_the_wire() {
    let node_id = NodeId::generate();
    let agent = Agent::new(node_id.clone(), "coder", "tmux")
        .with_model("sonnet")
        .with_capabilities(vec!["rust".to_string()]);
    round_trip(Message::AgentHeartbeat(AgentGossip { message_id: Uuid::new_v4(), agent }));

    let mut node = Node::new(node_id.clone(), NodeRole::Worker, "10.0.0.7", 7780, 7700);
    node.capabilities = vec!["gpu".to_string()];
    node.lamport_ts = 9;
    round_trip(Message::NodeStatus(NodeGossip { message_id: Uuid::new_v4(), node }));

    let board = BoardMessage::new(node_id, "aaaa-coder", "status", "halfway there");
    round_trip(Message::BoardPost(BoardPost { message_id: Uuid::new_v4(), message: board }));
}

#[test]
fn sync_response_survives_the_wire() {
    let rsp = SyncRsp {
        tasks: vec![test_task("synced", "aaaa")],
        agents: vec![],
        nodes: vec![],
        board_messages: vec![],
    };
    round_trip(Message::SyncRsp(Box::new(rsp)));
}

/// Concatenated frames decode in order and a partial tail stays buffered.
#[test]
fn frame_stream_reassembles() {
    let a = Message::TaskClaim(TaskClaim {
        message_id: Uuid::new_v4(),
        task_id: Uuid::new_v4(),
        agent_id: Uuid::new_v4(),
        node_id: NodeId::from_string("aaaa"),
        lamport_ts: 1,
    });
    let b = Message::TaskCreate(TaskCreate {
        message_id: Uuid::new_v4(),
        task: test_task("second", "bbbb"),
    });

    let mut stream = encode(&a).unwrap();
    stream.extend(encode(&b).unwrap());
    let c_frame = encode(&a).unwrap();
    stream.extend(&c_frame[..c_frame.len() / 2]);

    let mut buf = FrameBuffer::new();
    buf.extend(&stream);
    let decoded = buf.decode_all().unwrap();
    assert_eq!(decoded, vec![a, b]);
    assert!(!buf.is_empty());
}
