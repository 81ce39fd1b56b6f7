use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::message::Pid;

/// Liveness table: pid to last-seen instant, refreshed by any received
/// traffic and aged by the sweeper at the heartbeat cadence.
///
/// The self entry is kept for symmetry and never expires. Because both the
/// recording and the sweeping happen under the controller lock, a failure is
/// never reported for a peer whose message was processed in the same tick.
pub struct Membership {
    pid: Pid,
    last_seen: HashMap<Pid, Instant>,
    fail_timeout: Duration,
}

impl Membership {
    pub fn new(pid: Pid, fail_timeout: Duration) -> Self {
        let mut last_seen = HashMap::new();
        last_seen.insert(pid, Instant::now());
        Self {
            pid,
            last_seen,
            fail_timeout,
        }
    }

    /// Refresh a peer's last-seen instant. Returns true when the peer was
    /// not in the table before.
    pub fn record(&mut self, pid: Pid) -> bool {
        self.last_seen.insert(pid, Instant::now()).is_none()
    }

    /// Remove every peer whose last message is older than the failure
    /// timeout, returning the removed pids in ascending order.
    pub fn sweep(&mut self) -> Vec<Pid> {
        let mut dead: Vec<Pid> = self
            .last_seen
            .iter()
            .filter(|(pid, seen)| **pid != self.pid && seen.elapsed() >= self.fail_timeout)
            .map(|(pid, _)| *pid)
            .collect();
        dead.sort_unstable();
        for pid in &dead {
            self.last_seen.remove(pid);
        }
        dead
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.last_seen.contains_key(&pid)
    }

    /// Whether any live peer outranks the given pid.
    pub fn has_higher_live(&self, pid: Pid) -> bool {
        self.last_seen.keys().any(|p| *p > pid)
    }

    pub fn live_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.last_seen.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Number of live peers, self included.
    pub fn live_count(&self) -> usize {
        self.last_seen.len()
    }
}
