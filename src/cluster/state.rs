use serde::{Deserialize, Serialize};

use crate::message::Pid;

/// Every peer is in exactly one role at any instant. Peers start as
/// followers and only leave the leader role by yielding to a higher pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Snapshot of the controller state, taken under the controller lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub pid: Pid,
    pub role: NodeRole,
    pub round: u64,
    pub leader: Option<Pid>,
    pub live_peers: Vec<Pid>,
}
