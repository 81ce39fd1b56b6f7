use std::collections::HashMap;

use rand::Rng;

use crate::message::Pid;

/// Supplier of this peer's per-round contribution. Injected so tests can
/// pin the values while production draws them at random.
pub trait ValueSource: Send {
    fn value(&mut self, round: u64) -> u64;
}

/// Default supplier: a random draw squared, scaled by the peer id.
pub struct RandomValue {
    pid: Pid,
}

impl RandomValue {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl ValueSource for RandomValue {
    fn value(&mut self, _round: u64) -> u64 {
        let mut rng = rand::rng();
        let draw = rng.random_range(1..=10u64);
        draw * draw * self.pid
    }
}

/// Per-round bookkeeping: the contributions observed for one round number
/// and which of our own duties for it are already done.
#[derive(Debug, Default)]
pub struct RoundSlot {
    /// VALUE contributions seen for this round, our own included.
    pub values: HashMap<Pid, u64>,
    /// RESPONSE contributions; only the leader collects these.
    pub responses: HashMap<Pid, u64>,
    /// Our own VALUE has been broadcast; duplicate STARTs must not re-send.
    pub value_sent: bool,
    /// The value window closed and our max was reported; late VALUEs drop.
    pub response_done: bool,
    /// A value-window timer is pending for this round.
    pub window_armed: bool,
}

/// All in-flight round slots. Superseded rounds are discarded whenever the
/// local round number advances.
#[derive(Debug, Default)]
pub struct ConsensusState {
    slots: HashMap<u64, RoundSlot>,
}

impl ConsensusState {
    pub fn slot(&mut self, round: u64) -> &mut RoundSlot {
        self.slots.entry(round).or_default()
    }

    pub fn get(&self, round: u64) -> Option<&RoundSlot> {
        self.slots.get(&round)
    }

    pub fn get_mut(&mut self, round: u64) -> Option<&mut RoundSlot> {
        self.slots.get_mut(&round)
    }

    pub fn discard_before(&mut self, round: u64) {
        self.slots.retain(|r, _| *r >= round);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Strict-majority tally over the collected responses. Returns the decided
/// value when at least ⌊n_live/2⌋+1 responses agree on it, `None` otherwise;
/// a tie is never broken arbitrarily, the round simply aborts.
pub fn majority_value(responses: &HashMap<Pid, u64>, n_live: usize) -> Option<u64> {
    if responses.is_empty() {
        return None;
    }
    let threshold = n_live / 2 + 1;
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for &response in responses.values() {
        *counts.entry(response).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(value, _)| value)
        .max()
}

/// Round-number reconciliation for a freshly elected leader: adopt the
/// strict majority of the collected votes when one exists, otherwise keep
/// our own round. The result never regresses below our own round.
pub fn reconcile_round(votes: &HashMap<Pid, u64>, own: u64) -> u64 {
    let threshold = votes.len() / 2 + 1;
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for &round in votes.values() {
        *counts.entry(round).or_insert(0) += 1;
    }
    match counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(round, _)| round)
        .max()
    {
        Some(round) => own.max(round),
        None => own,
    }
}
