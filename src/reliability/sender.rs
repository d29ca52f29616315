//! Send side of the reliability engine.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use log::{debug, trace};
use thiserror::Error;

use super::Unit;
use crate::{
    cos::ClassOfService,
    error::ProtocolViolation,
    message::{AckMessage, SeqNum},
};

/// Retransmission timer settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetransmitPolicy {
    /// Timeout before the first retransmission. Each retry doubles it.
    pub timeout: Duration,
    /// Retransmissions allowed per unit before the stream gives up.
    pub max_attempts: u32,
}

impl RetransmitPolicy {
    fn backoff(&self, attempts: u32) -> Duration {
        self.timeout.saturating_mul(1_u32 << attempts.min(16))
    }
}

/// A unit ready to go on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmit {
    pub seq: SeqNum,
    pub unit: Unit,
    /// Set when the unit has been sent before.
    pub retransmission: bool,
}

/// Effect of an acknowledgment on the send window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Entries removed from the retransmission buffer.
    pub pruned: usize,
    /// Entries queued again because the peer reported them missing.
    pub nacked: usize,
}

/// A unit ran out of retransmission attempts.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("sequence {seq} unacknowledged after {attempts} retransmissions")]
pub struct RetransmitExhausted {
    pub seq: SeqNum,
    pub attempts: u32,
    /// Whether the unit was the FIN.
    pub fin: bool,
}

#[derive(Clone, Copy, Debug)]
struct SentState {
    deadline: Instant,
    attempts: u32,
}

#[derive(Debug)]
struct Entry {
    unit: Unit,
    sent: Option<SentState>,
}

impl Entry {
    fn is_in_flight_data(&self) -> bool { self.sent.is_some() && !self.unit.is_fin() }
}

/// Outbound sequencing, retransmission buffer, and peer credit.
///
/// Every enqueued unit is held in the retransmission buffer, keyed by its
/// sequence number, until an acknowledgment covers it. Units that have not
/// been sent yet wait in FIFO order for credit. A FIN needs no credit once it
/// reaches the head of the queue. On best-effort streams data units are
/// retained only for credit accounting and are never sent twice.
#[derive(Debug)]
pub struct SendWindow {
    reliable: bool,
    flow_controlled: bool,
    policy: RetransmitPolicy,
    next_seq: Option<SeqNum>,
    highest_sent: Option<SeqNum>,
    peer_window: u32,
    entries: BTreeMap<SeqNum, Entry>,
    unsent: VecDeque<SeqNum>,
    retransmit: VecDeque<SeqNum>,
    fin_seq: Option<SeqNum>,
}

impl SendWindow {
    /// Create a send window for a stream with the given class of service.
    ///
    /// `peer_window` is the peer's initial receive window in data units.
    #[must_use]
    pub fn new(cos: &ClassOfService, peer_window: u32, policy: RetransmitPolicy) -> Self {
        Self {
            reliable: cos.is_reliable(),
            flow_controlled: cos.is_flow_controlled(),
            policy,
            next_seq: Some(SeqNum::zero()),
            highest_sent: None,
            peer_window,
            entries: BTreeMap::new(),
            unsent: VecDeque::new(),
            retransmit: VecDeque::new(),
            fin_seq: None,
        }
    }

    /// Sequence numbers that can still be assigned.
    #[must_use]
    pub fn remaining_seqs(&self) -> u64 {
        self.next_seq
            .map_or(0, |next| u64::from(u32::MAX) - u64::from(next.get()) + 1)
    }

    /// Assign the next sequence number to `unit` and queue it for sending.
    ///
    /// Returns `None` once the sequence space is exhausted.
    pub fn enqueue(&mut self, unit: Unit) -> Option<SeqNum> {
        let seq = self.next_seq?;
        self.next_seq = seq.checked_next();
        if unit.is_fin() {
            self.fin_seq = Some(seq);
        }
        self.entries.insert(seq, Entry { unit, sent: None });
        self.unsent.push_back(seq);
        trace!("unit queued: seq={seq}");
        Some(seq)
    }

    /// Apply an acknowledgment from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolViolation::MalformedRanges`] for unordered ranges and
    /// [`ProtocolViolation::UnsentSequence`] when the acknowledgment covers a
    /// sequence number that was never sent.
    pub fn on_ack(&mut self, ack: &AckMessage) -> Result<AckOutcome, ProtocolViolation> {
        if !ack.acks.is_well_formed() || !ack.naks.is_well_formed() {
            return Err(ProtocolViolation::MalformedRanges);
        }
        for seq in ack.seq.into_iter().chain(ack.acks.last()).chain(ack.naks.last()) {
            if self.highest_sent.is_none_or(|highest| seq > highest) {
                return Err(ProtocolViolation::UnsentSequence { seq });
            }
        }

        let mut outcome = AckOutcome::default();
        if let Some(cumulative) = ack.seq {
            let retained = match cumulative.checked_next() {
                Some(next) => self.entries.split_off(&next),
                None => BTreeMap::new(),
            };
            let pruned = std::mem::replace(&mut self.entries, retained);
            outcome.pruned += pruned.len();
        }
        for range in &ack.acks {
            let covered: Vec<SeqNum> = self
                .entries
                .range(range.start()..=range.end())
                .map(|(seq, _)| *seq)
                .collect();
            for seq in covered {
                self.entries.remove(&seq);
                outcome.pruned += 1;
            }
        }
        self.retransmit.retain(|seq| self.entries.contains_key(seq));

        for range in &ack.naks {
            for (seq, entry) in self.entries.range(range.start()..=range.end()) {
                let resendable = entry.sent.is_some() && (self.reliable || entry.unit.is_fin());
                if resendable && !self.retransmit.contains(seq) {
                    self.retransmit.push_back(*seq);
                    outcome.nacked += 1;
                }
            }
        }

        if self.flow_controlled {
            self.peer_window = ack.window;
        }
        if outcome.pruned > 0 || outcome.nacked > 0 {
            debug!(
                "ack applied: pruned={}, nacked={}, window={}",
                outcome.pruned, outcome.nacked, self.peer_window
            );
        }
        Ok(outcome)
    }

    /// Return the next unit to put on the wire, if any.
    ///
    /// Retransmissions go first. New units are released while the number of
    /// sent but unacknowledged data units is below the peer's window.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        while let Some(seq) = self.retransmit.pop_front() {
            if let Some(entry) = self.entries.get_mut(&seq)
                && let Some(sent) = entry.sent.as_mut()
            {
                sent.attempts += 1;
                sent.deadline = now + self.policy.backoff(sent.attempts);
                return Some(Transmit {
                    seq,
                    unit: entry.unit.clone(),
                    retransmission: true,
                });
            }
        }

        let blocked = self.flow_controlled && self.in_flight() >= self.peer_window;
        let &seq = self.unsent.front()?;
        let entry = self.entries.get_mut(&seq)?;
        if blocked && !entry.unit.is_fin() {
            return None;
        }
        self.unsent.pop_front();
        entry.sent = Some(SentState {
            deadline: now + self.policy.timeout,
            attempts: 0,
        });
        self.highest_sent = self.highest_sent.max(Some(seq));
        Some(Transmit {
            seq,
            unit: entry.unit.clone(),
            retransmission: false,
        })
    }

    /// Queue every unit whose retransmission deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns [`RetransmitExhausted`] for the lowest due unit that has used
    /// all of its attempts.
    pub fn on_timeout(&mut self, now: Instant) -> Result<(), RetransmitExhausted> {
        for (seq, entry) in &self.entries {
            let Some(sent) = entry.sent else { continue };
            let resendable = self.reliable || entry.unit.is_fin();
            if !resendable || sent.deadline > now || self.retransmit.contains(seq) {
                continue;
            }
            if sent.attempts >= self.policy.max_attempts {
                return Err(RetransmitExhausted {
                    seq: *seq,
                    attempts: sent.attempts,
                    fin: entry.unit.is_fin(),
                });
            }
            self.retransmit.push_back(*seq);
        }
        Ok(())
    }

    /// Earliest retransmission deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|entry| self.reliable || entry.unit.is_fin())
            .filter_map(|entry| entry.sent.map(|sent| sent.deadline))
            .min()
    }

    /// Sent data units not yet acknowledged.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        let count = self
            .entries
            .values()
            .filter(|entry| entry.is_in_flight_data())
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Peer's most recently advertised window.
    #[must_use]
    pub fn peer_window(&self) -> u32 { self.peer_window }

    /// Number of entries in the retransmission buffer, sent or not.
    #[must_use]
    pub fn retained(&self) -> usize { self.entries.len() }

    /// Whether `seq` is still held for retransmission.
    #[must_use]
    pub fn contains(&self, seq: SeqNum) -> bool { self.entries.contains_key(&seq) }

    /// Whether any sequence number in `first..=last` is still retained.
    #[must_use]
    pub fn holds_any(&self, first: SeqNum, last: SeqNum) -> bool {
        self.entries.range(first..=last).next().is_some()
    }

    /// Whether anything is waiting to be sent or resent.
    #[must_use]
    pub fn has_pending(&self) -> bool { !self.unsent.is_empty() || !self.retransmit.is_empty() }

    /// Whether a FIN was queued and the peer acknowledged it.
    #[must_use]
    pub fn fin_acked(&self) -> bool {
        self.fin_seq
            .is_some_and(|fin| !self.entries.contains_key(&fin))
    }

    /// Whether a FIN has been queued.
    #[must_use]
    pub fn fin_queued(&self) -> bool { self.fin_seq.is_some() }

    /// Drop every retained unit.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.unsent.clear();
        self.retransmit.clear();
    }
}
