use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::message::{Message, Pid};

use super::consensus::{majority_value, reconcile_round, ConsensusState, ValueSource};
use super::election::Election;
use super::membership::Membership;
use super::state::{NodeRole, NodeState};

/// Status line cadence, counted in heartbeat ticks.
const STATUS_LOG_TICKS: u64 = 50;

/// Deadline events, delivered back through the controller mailbox so that
/// message and timer effects are applied by one logical thread.
///
/// Role-scoped deadlines carry the epoch current when they were armed; the
/// controller bumps the epoch on every role transition, so a deadline armed
/// for a previous role fires as a no-op. Value windows are keyed by round
/// instead: they outlive role changes but die with their round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Discovery window after the startup HELLO.
    Discovery { epoch: u64 },
    /// Bully challenge went unanswered long enough.
    BullyTimeout { epoch: u64 },
    /// Yielded to a higher peer; its LEADER announcement is overdue.
    LeaderWait { epoch: u64 },
    /// New leader may now query follower rounds.
    LeaderQuery { epoch: u64 },
    /// Round-number query window closed.
    RoundQueryDone { epoch: u64 },
    /// Begin the next consensus round.
    StartRound { epoch: u64 },
    /// Value-collection window for one round closed.
    ValueWindow { round: u64 },
    /// Response-collection window closed; tally and commit or abort.
    ResponseWindow { epoch: u64, round: u64 },
}

/// The per-peer controller. Owns every piece of mutable protocol state and
/// is only ever driven under the cluster lock: the receive loop, the timer
/// mailbox, and the heartbeat ticker all serialize through it.
pub struct Node {
    pid: Pid,
    config: Config,
    role: NodeRole,
    round: u64,
    leader: Option<Pid>,
    epoch: u64,
    membership: Membership,
    election: Election,
    consensus: ConsensusState,
    round_votes: HashMap<Pid, u64>,
    last_decision: Option<(u64, u64)>,
    values: Box<dyn ValueSource>,
    outbox: Option<mpsc::UnboundedSender<Message>>,
    timers: Option<mpsc::UnboundedSender<Timer>>,
    ticks: u64,
}

impl Node {
    pub fn new(pid: Pid, config: Config, values: Box<dyn ValueSource>) -> Self {
        let fail_timeout = Duration::from_millis(config.fail_timeout_ms);
        Self {
            pid,
            role: NodeRole::Follower,
            round: 0,
            leader: None,
            epoch: 0,
            membership: Membership::new(pid, fail_timeout),
            election: Election::new(),
            consensus: ConsensusState::default(),
            round_votes: HashMap::new(),
            last_decision: None,
            values,
            outbox: None,
            timers: None,
            ticks: 0,
            config,
        }
    }

    pub fn set_outbox(&mut self, sender: mpsc::UnboundedSender<Message>) {
        self.outbox = Some(sender);
    }

    pub fn set_timer_sender(&mut self, sender: mpsc::UnboundedSender<Timer>) {
        self.timers = Some(sender);
    }

    pub fn state(&self) -> NodeState {
        NodeState {
            pid: self.pid,
            role: self.role,
            round: self.round,
            leader: self.leader,
            live_peers: self.membership.live_pids(),
        }
    }

    /// The most recent committed round, as `(round, value)`.
    pub fn last_decision(&self) -> Option<(u64, u64)> {
        self.last_decision
    }

    /// Startup discovery: ask whether a leader already exists, and give it
    /// the hello window to answer before challenging anyone.
    pub fn start(&mut self) {
        info!("[{}] searching for an existing leader", self.pid);
        self.send(Message::Hello { from: self.pid });
        self.arm(
            Timer::Discovery { epoch: self.epoch },
            Duration::from_millis(self.config.hello_timeout_ms),
        );
    }

    /// Route one decoded datagram. Messages from ourselves (multicast loops
    /// our own sends back) are dropped before they can touch any state.
    pub fn handle_message(&mut self, msg: Message) {
        let from = msg.sender();
        if from == self.pid {
            debug!("[{}] dropping own datagram", self.pid);
            return;
        }
        if self.membership.record(from) {
            info!("[{}] discovered peer {}", self.pid, from);
        }

        match msg {
            Message::Hello { .. } => self.on_hello(from),
            Message::HelloAck { leader, round, .. } => self.on_hello_ack(leader, round),
            Message::Election { .. } => self.on_election(from),
            Message::Okay { .. } => self.on_ok(from),
            Message::Leader { pid, round, .. } => self.on_leader(pid, round),
            Message::Heartbeat { .. } => {}
            Message::RoundQuery { .. } => self.on_round_query(from),
            Message::RoundResponse { round, .. } => self.on_round_response(from, round),
            Message::RoundUpdate { round, .. } => self.adopt_round(round),
            Message::StartConsensus { round, leader, .. } => self.on_start_consensus(round, leader),
            Message::Value { round, value, .. } => self.on_value(from, round, value),
            Message::Response {
                round, response, ..
            } => self.on_response(from, round, response),
        }
    }

    /// Apply one deadline event. Stale epochs and superseded rounds fall
    /// through as no-ops, which is what cancels timers across transitions.
    pub fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Discovery { epoch } => {
                if epoch != self.epoch || self.role != NodeRole::Follower || self.leader.is_some() {
                    return;
                }
                info!("[{}] no leader answered the hello", self.pid);
                self.start_election();
            }
            Timer::BullyTimeout { epoch } => {
                if epoch != self.epoch || self.role != NodeRole::Candidate {
                    return;
                }
                if self.membership.has_higher_live(self.pid) {
                    // A higher peer is alive but its OK never arrived;
                    // repeat the challenge instead of usurping it.
                    info!("[{}] higher peer still alive, repeating election", self.pid);
                    self.send(Message::Election { from: self.pid });
                    self.arm(
                        Timer::BullyTimeout { epoch: self.epoch },
                        Duration::from_millis(self.config.bully_timeout_ms),
                    );
                } else {
                    self.become_leader();
                }
            }
            Timer::LeaderWait { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                if self.role == NodeRole::Follower
                    && self.leader.is_none()
                    && self.election.awaiting_leader()
                {
                    info!("[{}] promised leader never announced itself", self.pid);
                    self.election.reset();
                    self.start_election();
                }
            }
            Timer::LeaderQuery { epoch } => {
                if epoch != self.epoch || self.role != NodeRole::Leader {
                    return;
                }
                self.round_votes.clear();
                self.round_votes.insert(self.pid, self.round);
                self.send(Message::RoundQuery { from: self.pid });
                self.arm(
                    Timer::RoundQueryDone { epoch: self.epoch },
                    Duration::from_millis(self.config.round_query_timeout_ms),
                );
            }
            Timer::RoundQueryDone { epoch } => {
                if epoch != self.epoch || self.role != NodeRole::Leader {
                    return;
                }
                let reconciled = reconcile_round(&self.round_votes, self.round);
                if reconciled != self.round {
                    info!(
                        "[{}] adopting round {} from follower majority (was {})",
                        self.pid, reconciled, self.round
                    );
                    self.round = reconciled;
                    self.consensus.discard_before(reconciled);
                }
                self.round_votes.clear();
                self.send(Message::RoundUpdate {
                    from: self.pid,
                    round: self.round,
                });
                self.arm(
                    Timer::StartRound { epoch: self.epoch },
                    Duration::from_millis(self.config.leader_consensus_delay_ms),
                );
            }
            Timer::StartRound { epoch } => {
                if epoch != self.epoch || self.role != NodeRole::Leader {
                    return;
                }
                self.start_round();
            }
            Timer::ValueWindow { round } => self.close_value_window(round),
            Timer::ResponseWindow { epoch, round } => {
                if epoch != self.epoch || self.role != NodeRole::Leader {
                    return;
                }
                self.finish_round(round);
            }
        }
    }

    /// One heartbeat tick: announce liveness, then age the table. A dead
    /// leader turns us into a candidate; other deaths only shrink the table.
    pub fn heartbeat_tick(&mut self) {
        self.send(Message::Heartbeat { from: self.pid });

        for failed in self.membership.sweep() {
            warn!("[{}] peer {} considered dead", self.pid, failed);
            if self.leader == Some(failed) {
                info!("[{}] leader {} failed, starting election", self.pid, failed);
                self.leader = None;
                self.start_election();
            }
        }

        self.ticks += 1;
        if self.ticks % STATUS_LOG_TICKS == 0 {
            match self.role {
                NodeRole::Leader => info!(
                    "[{}] leading round {} with {} live peers",
                    self.pid,
                    self.round,
                    self.membership.live_count()
                ),
                _ => info!(
                    "[{}] role {:?}, leader {:?}, round {}",
                    self.pid, self.role, self.leader, self.round
                ),
            }
        }
    }

    /// Begin (or restart) a bully candidacy. Re-entrant: a candidacy that is
    /// already in flight is left alone.
    pub fn start_election(&mut self) {
        if self.election.in_progress() {
            return;
        }
        self.bump_epoch();
        self.role = NodeRole::Candidate;
        self.leader = None;
        self.election.begin();
        info!("[{}] starting election", self.pid);
        self.send(Message::Election { from: self.pid });
        self.arm(
            Timer::BullyTimeout { epoch: self.epoch },
            Duration::from_millis(self.config.bully_timeout_ms),
        );
    }

    fn on_hello(&mut self, from: Pid) {
        if self.role == NodeRole::Leader {
            info!("[{}] answering hello from {}", self.pid, from);
            self.send(Message::HelloAck {
                from: self.pid,
                leader: self.pid,
                round: self.round,
            });
        }
    }

    fn on_hello_ack(&mut self, leader: Pid, round: u64) {
        if self.role == NodeRole::Leader && leader < self.pid {
            debug!("[{}] ignoring hello ack from lower leader {}", self.pid, leader);
            return;
        }
        if self.leader == Some(leader) && self.role == NodeRole::Follower {
            self.adopt_round(round);
            return;
        }
        self.become_follower(leader, Some(round));
    }

    fn on_election(&mut self, from: Pid) {
        if from > self.pid {
            // Outranked: the higher candidate (or something above it) will
            // announce the outcome.
            debug!("[{}] election challenge from higher peer {}", self.pid, from);
            return;
        }
        self.send(Message::Okay { from: self.pid });
        match self.role {
            // A sitting leader restates the standings instead of re-running.
            NodeRole::Leader => self.send(Message::Leader {
                from: self.pid,
                pid: self.pid,
                round: Some(self.round),
            }),
            NodeRole::Follower => self.start_election(),
            NodeRole::Candidate => {}
        }
    }

    fn on_ok(&mut self, from: Pid) {
        if self.role != NodeRole::Candidate {
            debug!("[{}] stray OK from {}", self.pid, from);
            return;
        }
        if self.election.record_ok(from, self.pid) {
            info!("[{}] yielding to higher peer {}", self.pid, from);
            self.bump_epoch();
            self.role = NodeRole::Follower;
            self.arm(
                Timer::LeaderWait { epoch: self.epoch },
                Duration::from_millis(self.config.bully_timeout_ms),
            );
        }
    }

    fn on_leader(&mut self, announced: Pid, round: Option<u64>) {
        if self.leader == Some(announced) && self.role == NodeRole::Follower {
            // Repeated announcement for the current leader: no churn, only
            // round synchronization.
            if let Some(round) = round {
                self.adopt_round(round);
            }
            return;
        }
        if let Some(current) = self.leader {
            if announced < current && self.membership.is_alive(current) {
                debug!(
                    "[{}] ignoring LEADER {} while following higher {}",
                    self.pid, announced, current
                );
                return;
            }
        }
        self.become_follower(announced, round);
    }

    fn on_round_query(&mut self, from: Pid) {
        match self.leader {
            // Answer the leader, or anyone while the leader is unknown; the
            // announcement may simply have been lost on the way here.
            Some(leader) if leader == from => self.send_round_response(),
            None => self.send_round_response(),
            Some(leader) => debug!(
                "[{}] ignoring round query from {} (leader is {})",
                self.pid, from, leader
            ),
        }
    }

    fn send_round_response(&mut self) {
        self.send(Message::RoundResponse {
            from: self.pid,
            round: self.round,
        });
    }

    fn on_round_response(&mut self, from: Pid, round: u64) {
        if self.role != NodeRole::Leader {
            debug!("[{}] round response from {} but not leading", self.pid, from);
            return;
        }
        self.round_votes.insert(from, round);
    }

    fn on_start_consensus(&mut self, round: u64, leader: Pid) {
        if round < self.round {
            debug!(
                "[{}] stale consensus start for round {} from {}",
                self.pid, round, leader
            );
            return;
        }
        self.adopt_round(round);

        let slot = self.consensus.slot(round);
        if slot.value_sent {
            debug!("[{}] duplicate consensus start for round {}", self.pid, round);
            return;
        }
        let value = self.values.value(round);
        slot.values.insert(self.pid, value);
        slot.value_sent = true;
        let arm_window = !slot.window_armed;
        slot.window_armed = true;

        self.send(Message::Value {
            from: self.pid,
            round,
            value,
        });
        if arm_window {
            self.arm(
                Timer::ValueWindow { round },
                Duration::from_millis(self.config.value_process_delay_ms),
            );
        }
    }

    fn on_value(&mut self, from: Pid, round: u64, value: u64) {
        if round < self.round {
            debug!("[{}] late VALUE for round {} from {}", self.pid, round, from);
            return;
        }
        let slot = self.consensus.slot(round);
        if slot.response_done {
            debug!("[{}] VALUE after window close for round {}", self.pid, round);
            return;
        }
        slot.values.insert(from, value);
        // A VALUE can precede its START on a lossy network; it still opens
        // the collection window for that round.
        let arm_window = !slot.window_armed;
        slot.window_armed = true;
        if arm_window {
            self.arm(
                Timer::ValueWindow { round },
                Duration::from_millis(self.config.value_process_delay_ms),
            );
        }
    }

    fn on_response(&mut self, from: Pid, round: u64, response: u64) {
        if self.role != NodeRole::Leader {
            debug!("[{}] RESPONSE from {} but not leading", self.pid, from);
            return;
        }
        if round != self.round {
            debug!(
                "[{}] RESPONSE for round {} outside current round {}",
                self.pid, round, self.round
            );
            return;
        }
        self.consensus.slot(round).responses.insert(from, response);
    }

    /// Open a new consensus round as leader: announce it, contribute our
    /// own value, and start the value-collection window.
    fn start_round(&mut self) {
        let round = self.round;
        info!(
            "[{}] starting consensus round {} ({} live peers)",
            self.pid,
            round,
            self.membership.live_count()
        );
        let value = self.values.value(round);
        self.send(Message::StartConsensus {
            from: self.pid,
            round,
            leader: self.pid,
        });
        self.send(Message::Value {
            from: self.pid,
            round,
            value,
        });

        let slot = self.consensus.slot(round);
        slot.values.insert(self.pid, value);
        slot.value_sent = true;
        slot.window_armed = true;

        self.arm(
            Timer::ValueWindow { round },
            Duration::from_millis(self.config.value_process_delay_ms),
        );
    }

    /// The value window for `round` closed: report the maximum we observed.
    /// Followers broadcast it; the leader records it and opens the response
    /// window.
    fn close_value_window(&mut self, round: u64) {
        if round < self.round {
            return;
        }
        let Some(slot) = self.consensus.get_mut(round) else {
            return;
        };
        if slot.response_done {
            return;
        }
        let Some(&max) = slot.values.values().max() else {
            return;
        };
        slot.response_done = true;
        debug!("[{}] round {} max over observed values: {}", self.pid, round, max);

        if self.role == NodeRole::Leader {
            self.consensus.slot(round).responses.insert(self.pid, max);
            self.arm(
                Timer::ResponseWindow {
                    epoch: self.epoch,
                    round,
                },
                Duration::from_millis(self.config.response_process_delay_ms),
            );
        } else {
            self.send(Message::Response {
                from: self.pid,
                round,
                response: max,
            });
        }
    }

    /// Tally the responses for `round` and commit or abort, then advance the
    /// round counter and schedule the next round.
    fn finish_round(&mut self, round: u64) {
        let n_live = self.membership.live_count();
        let decision = self
            .consensus
            .get(round)
            .and_then(|slot| majority_value(&slot.responses, n_live));

        match decision {
            Some(value) => {
                info!("[{}] round {} committed value {}", self.pid, round, value);
                self.last_decision = Some((round, value));
            }
            None => info!("[{}] round {} aborted: no majority", self.pid, round),
        }

        self.round = round + 1;
        self.consensus.discard_before(self.round);
        self.send(Message::RoundUpdate {
            from: self.pid,
            round: self.round,
        });
        self.arm(
            Timer::StartRound { epoch: self.epoch },
            Duration::from_millis(self.config.consensus_interval_ms),
        );
    }

    fn become_leader(&mut self) {
        self.bump_epoch();
        self.role = NodeRole::Leader;
        self.leader = Some(self.pid);
        self.election.reset();
        self.consensus.clear();
        self.round_votes.clear();
        info!("[{}] assuming leadership at round {}", self.pid, self.round);
        self.send(Message::Leader {
            from: self.pid,
            pid: self.pid,
            round: Some(self.round),
        });
        self.arm(
            Timer::LeaderQuery { epoch: self.epoch },
            Duration::from_millis(self.config.leader_query_delay_ms),
        );
    }

    fn become_follower(&mut self, leader: Pid, round: Option<u64>) {
        let was_leader = self.role == NodeRole::Leader;
        self.bump_epoch();
        self.role = NodeRole::Follower;
        self.leader = Some(leader);
        self.election.reset();
        if was_leader {
            // Any in-flight round of ours is dead with the old role.
            self.consensus.clear();
            self.round_votes.clear();
        }
        if let Some(round) = round {
            self.adopt_round(round);
        }
        info!("[{}] following leader {} at round {}", self.pid, leader, self.round);
    }

    /// Round numbers only move forward; adopting one discards bookkeeping
    /// for everything it supersedes.
    fn adopt_round(&mut self, round: u64) {
        if round > self.round {
            self.round = round;
            self.consensus.discard_before(round);
        }
    }

    fn bump_epoch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn send(&self, msg: Message) {
        if let Some(outbox) = &self.outbox {
            let _ = outbox.send(msg);
        }
    }

    fn arm(&self, timer: Timer, delay: Duration) {
        if let Some(timers) = &self.timers {
            let timers = timers.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = timers.send(timer);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);

    impl ValueSource for Fixed {
        fn value(&mut self, _round: u64) -> u64 {
            self.0
        }
    }

    fn test_node(pid: Pid) -> (Node, mpsc::UnboundedReceiver<Message>) {
        test_node_with_config(pid, Config::default())
    }

    fn test_node_with_config(pid: Pid, config: Config) -> (Node, mpsc::UnboundedReceiver<Message>) {
        let mut node = Node::new(pid, config, Box::new(Fixed(7)));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (timer_tx, _timer_rx) = mpsc::unbounded_channel();
        node.set_outbox(out_tx);
        node.set_timer_sender(timer_tx);
        (node, out_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn make_leader(node: &mut Node) {
        node.start_election();
        node.handle_timer(Timer::BullyTimeout { epoch: node.epoch });
        assert_eq!(node.role, NodeRole::Leader);
    }

    #[tokio::test]
    async fn solo_peer_becomes_leader_after_discovery() {
        let (mut node, mut rx) = test_node(5);

        node.start();
        assert!(matches!(drain(&mut rx)[..], [Message::Hello { from: 5 }]));

        node.handle_timer(Timer::Discovery { epoch: node.epoch });
        assert_eq!(node.role, NodeRole::Candidate);
        assert!(matches!(drain(&mut rx)[..], [Message::Election { from: 5 }]));

        node.handle_timer(Timer::BullyTimeout { epoch: node.epoch });
        assert_eq!(node.role, NodeRole::Leader);
        assert_eq!(node.leader, Some(5));
        assert!(matches!(
            drain(&mut rx)[..],
            [Message::Leader {
                pid: 5,
                round: Some(0),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn solo_leader_commits_its_own_value() {
        let (mut node, mut rx) = test_node(5);
        make_leader(&mut node);

        node.handle_timer(Timer::LeaderQuery { epoch: node.epoch });
        node.handle_timer(Timer::RoundQueryDone { epoch: node.epoch });
        node.handle_timer(Timer::StartRound { epoch: node.epoch });
        node.handle_timer(Timer::ValueWindow { round: 0 });
        node.handle_timer(Timer::ResponseWindow {
            epoch: node.epoch,
            round: 0,
        });

        assert_eq!(node.last_decision(), Some((0, 7)));
        assert_eq!(node.round, 1);
        let sent = drain(&mut rx);
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::RoundUpdate { round: 1, .. })));
    }

    #[tokio::test]
    async fn candidate_yields_to_higher_ok_then_retries() {
        let (mut node, mut rx) = test_node(2);
        node.start_election();
        drain(&mut rx);

        node.handle_message(Message::Okay { from: 5 });
        assert_eq!(node.role, NodeRole::Follower);
        assert!(node.election.awaiting_leader());

        // The promised announcement never arrives.
        node.handle_timer(Timer::LeaderWait { epoch: node.epoch });
        assert_eq!(node.role, NodeRole::Candidate);
        assert!(matches!(drain(&mut rx)[..], [Message::Election { from: 2 }]));
    }

    #[tokio::test]
    async fn ok_from_lower_peer_does_not_cancel_candidacy() {
        let (mut node, _rx) = test_node(5);
        node.start_election();
        node.handle_message(Message::Okay { from: 3 });
        assert_eq!(node.role, NodeRole::Candidate);
    }

    #[tokio::test]
    async fn bully_timeout_repeats_while_higher_peer_lives() {
        let (mut node, mut rx) = test_node(2);
        node.handle_message(Message::Heartbeat { from: 9 });
        node.start_election();
        drain(&mut rx);

        node.handle_timer(Timer::BullyTimeout { epoch: node.epoch });
        assert_eq!(node.role, NodeRole::Candidate);
        assert!(matches!(drain(&mut rx)[..], [Message::Election { from: 2 }]));
    }

    #[tokio::test]
    async fn election_from_lower_peer_gets_ok_and_starts_own_run() {
        let (mut node, mut rx) = test_node(3);
        node.handle_message(Message::Election { from: 1 });

        assert_eq!(node.role, NodeRole::Candidate);
        let sent = drain(&mut rx);
        assert!(matches!(sent[0], Message::Okay { from: 3 }));
        assert!(matches!(sent[1], Message::Election { from: 3 }));
    }

    #[tokio::test]
    async fn election_from_higher_peer_is_left_unanswered() {
        let (mut node, mut rx) = test_node(3);
        node.handle_message(Message::Election { from: 8 });
        assert_eq!(node.role, NodeRole::Follower);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn sitting_leader_answers_challenge_with_announcement() {
        let (mut node, mut rx) = test_node(5);
        make_leader(&mut node);
        drain(&mut rx);

        node.handle_message(Message::Election { from: 1 });
        assert_eq!(node.role, NodeRole::Leader);
        let sent = drain(&mut rx);
        assert!(matches!(sent[0], Message::Okay { from: 5 }));
        assert!(matches!(sent[1], Message::Leader { pid: 5, .. }));
    }

    #[tokio::test]
    async fn hello_ack_adopts_leader_and_round() {
        let (mut node, _rx) = test_node(1);
        let stale_epoch = node.epoch;

        node.handle_message(Message::HelloAck {
            from: 3,
            leader: 3,
            round: 12,
        });
        assert_eq!(node.role, NodeRole::Follower);
        assert_eq!(node.leader, Some(3));
        assert_eq!(node.round, 12);

        // The discovery deadline armed before the ack must now be inert.
        node.handle_timer(Timer::Discovery { epoch: stale_epoch });
        assert_eq!(node.role, NodeRole::Follower);
    }

    #[tokio::test]
    async fn higher_pid_joiner_keeps_the_sitting_leader() {
        let (mut node, _rx) = test_node(7);
        node.start();

        node.handle_message(Message::HelloAck {
            from: 2,
            leader: 2,
            round: 6,
        });
        assert_eq!(node.role, NodeRole::Follower);
        assert_eq!(node.leader, Some(2));
        assert_eq!(node.round, 6);
    }

    #[tokio::test]
    async fn repeated_leader_announcement_causes_no_churn() {
        let (mut node, mut rx) = test_node(1);
        node.handle_message(Message::Leader {
            from: 5,
            pid: 5,
            round: Some(3),
        });
        let epoch = node.epoch;
        drain(&mut rx);

        node.handle_message(Message::Leader {
            from: 5,
            pid: 5,
            round: Some(3),
        });
        assert_eq!(node.epoch, epoch);
        assert_eq!(node.leader, Some(5));
        assert_eq!(node.round, 3);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn lower_leader_announcement_is_ignored() {
        let (mut node, _rx) = test_node(1);
        node.handle_message(Message::Leader {
            from: 5,
            pid: 5,
            round: Some(3),
        });

        node.handle_message(Message::Leader {
            from: 4,
            pid: 4,
            round: Some(9),
        });
        assert_eq!(node.leader, Some(5));
        assert_eq!(node.round, 3);
    }

    #[tokio::test]
    async fn leader_failure_triggers_candidacy() {
        let config = Config {
            fail_timeout_ms: 0,
            ..Config::default()
        };
        let (mut node, mut rx) = test_node_with_config(1, config);
        node.handle_message(Message::HelloAck {
            from: 3,
            leader: 3,
            round: 0,
        });
        drain(&mut rx);

        node.heartbeat_tick();

        assert_eq!(node.role, NodeRole::Candidate);
        assert_eq!(node.leader, None);
        let sent = drain(&mut rx);
        assert!(sent.iter().any(|m| matches!(m, Message::Election { from: 1 })));
    }

    #[tokio::test]
    async fn non_leader_failure_only_updates_the_table() {
        let config = Config {
            fail_timeout_ms: 0,
            ..Config::default()
        };
        let (mut node, _rx) = test_node_with_config(1, config);
        node.membership.record(2);

        node.heartbeat_tick();

        assert_eq!(node.role, NodeRole::Follower);
        assert!(!node.membership.is_alive(2));
    }

    #[tokio::test]
    async fn duplicate_start_emits_exactly_one_value() {
        let (mut node, mut rx) = test_node(2);

        node.handle_message(Message::StartConsensus {
            from: 5,
            round: 1,
            leader: 5,
        });
        node.handle_message(Message::StartConsensus {
            from: 5,
            round: 1,
            leader: 5,
        });

        let values = drain(&mut rx)
            .into_iter()
            .filter(|m| matches!(m, Message::Value { .. }))
            .count();
        assert_eq!(values, 1);
        assert_eq!(node.round, 1);
    }

    #[tokio::test]
    async fn stale_start_consensus_is_dropped() {
        let (mut node, mut rx) = test_node(2);
        node.handle_message(Message::RoundUpdate { from: 5, round: 4 });
        drain(&mut rx);

        node.handle_message(Message::StartConsensus {
            from: 5,
            round: 2,
            leader: 5,
        });
        assert!(drain(&mut rx).is_empty());
        assert_eq!(node.round, 4);
    }

    #[tokio::test]
    async fn value_without_start_still_produces_a_response() {
        let (mut node, mut rx) = test_node(2);

        node.handle_message(Message::Value {
            from: 4,
            round: 0,
            value: 9,
        });
        node.handle_timer(Timer::ValueWindow { round: 0 });

        let sent = drain(&mut rx);
        assert!(matches!(
            sent[..],
            [Message::Response {
                from: 2,
                round: 0,
                response: 9
            }]
        ));
    }

    #[tokio::test]
    async fn follower_response_is_the_max_of_observed_values() {
        let (mut node, mut rx) = test_node(2);

        node.handle_message(Message::StartConsensus {
            from: 5,
            round: 0,
            leader: 5,
        });
        node.handle_message(Message::Value {
            from: 5,
            round: 0,
            value: 3,
        });
        node.handle_message(Message::Value {
            from: 4,
            round: 0,
            value: 91,
        });
        drain(&mut rx);

        node.handle_timer(Timer::ValueWindow { round: 0 });
        let sent = drain(&mut rx);
        assert!(matches!(
            sent[..],
            [Message::Response {
                response: 91,
                round: 0,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn round_update_is_monotonic() {
        let (mut node, _rx) = test_node(2);
        node.handle_message(Message::RoundUpdate { from: 5, round: 9 });
        assert_eq!(node.round, 9);
        node.handle_message(Message::RoundUpdate { from: 5, round: 3 });
        assert_eq!(node.round, 9);
    }

    #[tokio::test]
    async fn round_query_is_answered_only_for_the_known_leader() {
        let (mut node, mut rx) = test_node(2);
        node.handle_message(Message::Leader {
            from: 5,
            pid: 5,
            round: Some(4),
        });
        drain(&mut rx);

        node.handle_message(Message::RoundQuery { from: 5 });
        assert!(matches!(
            drain(&mut rx)[..],
            [Message::RoundResponse { from: 2, round: 4 }]
        ));

        node.handle_message(Message::RoundQuery { from: 4 });
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn full_leader_round_commits_the_majority_response() {
        let (mut node, mut rx) = test_node(5);
        make_leader(&mut node);

        node.handle_timer(Timer::LeaderQuery { epoch: node.epoch });
        node.handle_message(Message::RoundResponse { from: 1, round: 4 });
        node.handle_message(Message::RoundResponse { from: 2, round: 4 });
        node.handle_timer(Timer::RoundQueryDone { epoch: node.epoch });
        assert_eq!(node.round, 4);
        drain(&mut rx);

        node.handle_timer(Timer::StartRound { epoch: node.epoch });
        let sent = drain(&mut rx);
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::StartConsensus { round: 4, .. })));
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::Value { round: 4, value: 7, .. })));

        node.handle_message(Message::Value {
            from: 1,
            round: 4,
            value: 10,
        });
        node.handle_message(Message::Value {
            from: 2,
            round: 4,
            value: 99,
        });
        node.handle_timer(Timer::ValueWindow { round: 4 });

        node.handle_message(Message::Response {
            from: 1,
            round: 4,
            response: 99,
        });
        node.handle_message(Message::Response {
            from: 2,
            round: 4,
            response: 99,
        });
        node.handle_timer(Timer::ResponseWindow {
            epoch: node.epoch,
            round: 4,
        });

        assert_eq!(node.last_decision(), Some((4, 99)));
        assert_eq!(node.round, 5);
    }

    #[tokio::test]
    async fn round_without_majority_aborts_but_still_advances() {
        let (mut node, mut rx) = test_node(5);
        make_leader(&mut node);
        node.handle_message(Message::Heartbeat { from: 1 });
        node.handle_message(Message::Heartbeat { from: 2 });

        node.handle_timer(Timer::StartRound { epoch: node.epoch });
        node.handle_timer(Timer::ValueWindow { round: 0 });
        node.handle_message(Message::Response {
            from: 1,
            round: 0,
            response: 50,
        });
        node.handle_message(Message::Response {
            from: 2,
            round: 0,
            response: 60,
        });
        drain(&mut rx);

        node.handle_timer(Timer::ResponseWindow {
            epoch: node.epoch,
            round: 0,
        });

        assert_eq!(node.last_decision(), None);
        assert_eq!(node.round, 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, Message::RoundUpdate { round: 1, .. })));
    }

    #[tokio::test]
    async fn losing_leadership_discards_round_state() {
        let (mut node, _rx) = test_node(5);
        make_leader(&mut node);
        node.handle_timer(Timer::StartRound { epoch: node.epoch });
        let stale_epoch = node.epoch;

        node.handle_message(Message::Leader {
            from: 9,
            pid: 9,
            round: Some(2),
        });
        assert_eq!(node.role, NodeRole::Follower);
        assert_eq!(node.leader, Some(9));

        // In-flight phase deadlines from the old leadership are inert.
        node.handle_timer(Timer::ResponseWindow {
            epoch: stale_epoch,
            round: 0,
        });
        assert_eq!(node.last_decision(), None);
        assert!(node.consensus.get(0).is_none());
    }

    #[tokio::test]
    async fn leader_answers_hello_with_ack() {
        let (mut node, mut rx) = test_node(5);
        make_leader(&mut node);
        drain(&mut rx);

        node.handle_message(Message::Hello { from: 9 });
        assert!(matches!(
            drain(&mut rx)[..],
            [Message::HelloAck {
                from: 5,
                leader: 5,
                round: 0
            }]
        ));
    }

    #[tokio::test]
    async fn own_datagrams_are_dropped() {
        let (mut node, mut rx) = test_node(5);
        node.handle_message(Message::Election { from: 5 });
        assert_eq!(node.role, NodeRole::Follower);
        assert!(drain(&mut rx).is_empty());
    }
}
