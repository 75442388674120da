//! VoidLux: a decentralized swarm orchestrator for AI coding agents.
//!
//! Nodes form a peer-to-peer mesh over framed TCP, replicate task/agent/node
//! state with Lamport-ordered gossip, elect a single emperor for planning and
//! review, and integrate completed subtask branches through a bounded
//! merge/test/retry loop.

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod mesh;
pub mod services;
