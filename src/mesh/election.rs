//! Bully leader election.
//!
//! Exactly one node should hold the emperor role. The smallest node id (by
//! lexicographic order) wins: a candidate that hears a smaller challenger
//! yields, and one that hears nothing smaller for the quorum window
//! announces victory. Brief split-brain is tolerated; claiming is
//! idempotent downstream.
//!
//! The manager is a passive state machine: callers feed it ticks and
//! messages and execute the effects it returns, which keeps the logic
//! testable without a network.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::domain::models::{NodeId, NodeRole};

use super::constants;

/// What the caller must do after feeding the manager an input.
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionEffect {
    /// Broadcast EMPEROR_HEARTBEAT.
    SendHeartbeat,
    /// Broadcast ELECTION_START (we are campaigning or challenging).
    SendElectionStart,
    /// Broadcast ELECTION_VICTORY.
    SendVictory,
    /// We now hold the emperor role; persist and gossip it.
    BecameEmperor,
    /// Another node is emperor now.
    EmperorIs(NodeId),
    /// We were emperor and lost the role.
    SteppedDown,
}

#[derive(Debug)]
pub struct ElectionManager {
    node_id: NodeId,
    role: NodeRole,
    current_emperor: Option<NodeId>,
    last_emperor_seen: Instant,
    last_heartbeat_sent: Option<Instant>,
    /// When we started campaigning, if an election is running.
    campaign_started: Option<Instant>,
    heartbeat_interval: Duration,
    stale_after: Duration,
    quorum_wait: Duration,
}

impl ElectionManager {
    pub fn new(node_id: NodeId, initial_role: NodeRole) -> Self {
        Self {
            node_id,
            role: initial_role,
            current_emperor: None,
            last_emperor_seen: Instant::now(),
            last_heartbeat_sent: None,
            campaign_started: None,
            heartbeat_interval: constants::EMPEROR_HEARTBEAT_INTERVAL,
            stale_after: constants::EMPEROR_STALE_AFTER,
            quorum_wait: constants::ELECTION_WAIT,
        }
    }

    /// Override the election timers. Defaults follow the protocol
    /// constants; deployments (and tests) may shrink or stretch them
    /// through config.
    pub fn with_timers(mut self, heartbeat: Duration, stale: Duration, quorum: Duration) -> Self {
        self.heartbeat_interval = heartbeat;
        self.stale_after = stale;
        self.quorum_wait = quorum;
        self
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_emperor(&self) -> bool {
        matches!(self.role, NodeRole::Emperor)
    }

    pub fn current_emperor(&self) -> Option<&NodeId> {
        self.current_emperor.as_ref()
    }

    pub fn is_campaigning(&self) -> bool {
        self.campaign_started.is_some()
    }

    /// Periodic driver. Emperors emit heartbeats; workers watch for
    /// staleness and campaign; campaigners claim victory after the quorum
    /// window passes unchallenged.
    pub fn on_tick(&mut self, now: Instant) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();

        if self.is_emperor() {
            let due = self
                .last_heartbeat_sent
                .is_none_or(|at| now.duration_since(at) >= self.heartbeat_interval);
            if due {
                self.last_heartbeat_sent = Some(now);
                effects.push(ElectionEffect::SendHeartbeat);
            }
            return effects;
        }

        if let Some(started) = self.campaign_started {
            if now.duration_since(started) >= self.quorum_wait {
                // Nobody smaller spoke up.
                self.campaign_started = None;
                self.role = NodeRole::Emperor;
                self.current_emperor = Some(self.node_id.clone());
                self.last_heartbeat_sent = Some(now);
                info!(node = %self.node_id, "election won, assuming emperor role");
                effects.push(ElectionEffect::SendVictory);
                effects.push(ElectionEffect::BecameEmperor);
                effects.push(ElectionEffect::SendHeartbeat);
            }
            return effects;
        }

        if now.duration_since(self.last_emperor_seen) >= self.stale_after {
            debug!(node = %self.node_id, "emperor heartbeat stale, starting election");
            self.campaign_started = Some(now);
            effects.push(ElectionEffect::SendElectionStart);
        }

        effects
    }

    /// EMPEROR_HEARTBEAT from a peer.
    pub fn on_emperor_heartbeat(&mut self, from: NodeId, now: Instant) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        self.last_emperor_seen = now;

        if self.is_emperor() && from != self.node_id {
            // Two emperors: the smaller id keeps the crown.
            if from < self.node_id {
                info!(other = %from, "yielding emperor role to smaller node id");
                self.role = NodeRole::Worker;
                self.current_emperor = Some(from.clone());
                effects.push(ElectionEffect::SteppedDown);
                effects.push(ElectionEffect::EmperorIs(from));
            }
            return effects;
        }

        // A live emperor cancels any campaign.
        self.campaign_started = None;
        if self.current_emperor.as_ref() != Some(&from) {
            self.current_emperor = Some(from.clone());
            effects.push(ElectionEffect::EmperorIs(from));
        }
        effects
    }

    /// ELECTION_START from a candidate peer.
    pub fn on_election_start(&mut self, from: NodeId, now: Instant) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();

        if from < self.node_id {
            // A smaller candidate outranks us; yield.
            if self.campaign_started.take().is_some() {
                debug!(other = %from, "yielding election to smaller node id");
            }
            return effects;
        }

        // We outrank the candidate: answer with our own challenge so it
        // yields, and start campaigning if we were not already.
        if self.campaign_started.is_none() && !self.is_emperor() {
            self.campaign_started = Some(now);
        }
        effects.push(ElectionEffect::SendElectionStart);
        effects
    }

    /// ELECTION_VICTORY from a peer.
    pub fn on_victory(&mut self, from: NodeId, now: Instant) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        self.campaign_started = None;
        self.last_emperor_seen = now;

        if self.is_emperor() && from != self.node_id {
            if from < self.node_id {
                self.role = NodeRole::Worker;
                effects.push(ElectionEffect::SteppedDown);
            } else {
                // We outrank the claimant; keep the crown and let our
                // heartbeat correct it.
                return effects;
            }
        }

        if self.current_emperor.as_ref() != Some(&from) {
            self.current_emperor = Some(from.clone());
            effects.push(ElectionEffect::EmperorIs(from));
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(id: &str) -> ElectionManager {
        ElectionManager::new(NodeId::from_string(id), NodeRole::Worker).with_timers(
            Duration::from_millis(100),
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn stale_emperor_triggers_campaign() {
        let mut m = manager("bbbb");
        let t0 = Instant::now();
        m.on_emperor_heartbeat(NodeId::from_string("aaaa"), t0);
        assert!(m.on_tick(t0 + Duration::from_millis(100)).is_empty());
        let effects = m.on_tick(t0 + Duration::from_millis(301));
        assert_eq!(effects, vec![ElectionEffect::SendElectionStart]);
        assert!(m.is_campaigning());
    }

    #[test]
    fn unchallenged_campaign_wins_after_quorum_wait() {
        let mut m = manager("aaaa");
        let t0 = Instant::now();
        let effects = m.on_tick(t0 + Duration::from_millis(301));
        assert_eq!(effects, vec![ElectionEffect::SendElectionStart]);
        let effects = m.on_tick(t0 + Duration::from_millis(360));
        assert!(effects.contains(&ElectionEffect::SendVictory));
        assert!(effects.contains(&ElectionEffect::BecameEmperor));
        assert!(m.is_emperor());
        assert_eq!(m.current_emperor(), Some(&NodeId::from_string("aaaa")));
    }

    #[test]
    fn smaller_challenger_makes_campaign_yield() {
        let mut m = manager("bbbb");
        let t0 = Instant::now();
        m.on_tick(t0 + Duration::from_millis(301));
        assert!(m.is_campaigning());
        let effects = m.on_election_start(NodeId::from_string("aaaa"), t0 + Duration::from_millis(320));
        assert!(effects.is_empty());
        assert!(!m.is_campaigning());
        // The quorum window passing no longer crowns us.
        assert!(m.on_tick(t0 + Duration::from_millis(400)).is_empty() || !m.is_emperor());
    }

    #[test]
    fn larger_candidate_is_challenged_back() {
        let mut m = manager("aaaa");
        let t0 = Instant::now();
        let effects = m.on_election_start(NodeId::from_string("bbbb"), t0);
        assert_eq!(effects, vec![ElectionEffect::SendElectionStart]);
        assert!(m.is_campaigning());
    }

    #[test]
    fn victory_terminates_local_election() {
        let mut m = manager("bbbb");
        let t0 = Instant::now();
        m.on_tick(t0 + Duration::from_millis(301));
        assert!(m.is_campaigning());
        let effects = m.on_victory(NodeId::from_string("aaaa"), t0 + Duration::from_millis(320));
        assert!(effects.contains(&ElectionEffect::EmperorIs(NodeId::from_string("aaaa"))));
        assert!(!m.is_campaigning());
    }

    #[test]
    fn dual_emperors_resolve_to_smaller_id() {
        let mut m = ElectionManager::new(NodeId::from_string("bbbb"), NodeRole::Emperor);
        let effects = m.on_emperor_heartbeat(NodeId::from_string("aaaa"), Instant::now());
        assert!(effects.contains(&ElectionEffect::SteppedDown));
        assert!(!m.is_emperor());

        let mut m = ElectionManager::new(NodeId::from_string("aaaa"), NodeRole::Emperor);
        let effects = m.on_emperor_heartbeat(NodeId::from_string("bbbb"), Instant::now());
        assert!(effects.is_empty());
        assert!(m.is_emperor());
    }

    #[test]
    fn emperor_emits_heartbeats_on_interval() {
        let mut m = ElectionManager::new(NodeId::from_string("aaaa"), NodeRole::Emperor)
            .with_timers(Duration::from_millis(100), Duration::from_millis(300), Duration::from_millis(50));
        let t0 = Instant::now();
        assert_eq!(m.on_tick(t0), vec![ElectionEffect::SendHeartbeat]);
        assert!(m.on_tick(t0 + Duration::from_millis(50)).is_empty());
        assert_eq!(m.on_tick(t0 + Duration::from_millis(150)), vec![ElectionEffect::SendHeartbeat]);
    }
}
