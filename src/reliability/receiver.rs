//! Receive side of the reliability engine.

use std::collections::BTreeMap;

use log::trace;

use super::Unit;
use crate::{
    cos::ClassOfService,
    error::ProtocolViolation,
    message::{AckMessage, SeqNum, StreamId},
    range::{Range, RangeList},
};

/// In-order delivery, out-of-order buffering, and acknowledgment state.
#[derive(Debug)]
pub struct ReceiveWindow {
    reliable: bool,
    flow_controlled: bool,
    capacity: u32,
    max_out_of_order: usize,
    expected: Option<SeqNum>,
    buffered: BTreeMap<SeqNum, Unit>,
    ack_due: bool,
}

impl ReceiveWindow {
    /// Create a receive window advertising `capacity` data units.
    #[must_use]
    pub fn new(cos: &ClassOfService, capacity: u32, max_out_of_order: usize) -> Self {
        Self {
            reliable: cos.is_reliable(),
            flow_controlled: cos.is_flow_controlled(),
            capacity: capacity.max(1),
            max_out_of_order,
            expected: Some(SeqNum::zero()),
            buffered: BTreeMap::new(),
            ack_due: false,
        }
    }

    /// Accept a unit from the peer, returning every unit now deliverable in
    /// sequence order.
    ///
    /// Duplicates are dropped but still make an acknowledgment due. On
    /// best-effort streams a unit ahead of the expected sequence number is
    /// delivered at once and the gap is abandoned. An early FIN is held
    /// outside the window and the out-of-order limit, since the peer sends it
    /// without credit.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolViolation::OutOfWindow`] when a flow-controlled peer
    /// sends beyond the advertised window and
    /// [`ProtocolViolation::OutOfOrderLimit`] when an uncontrolled peer
    /// overruns the out-of-order buffer.
    pub fn on_unit(&mut self, seq: SeqNum, unit: Unit) -> Result<Vec<Unit>, ProtocolViolation> {
        self.ack_due = true;
        let Some(expected) = self.expected else {
            return Ok(Vec::new());
        };
        if seq < expected || self.buffered.contains_key(&seq) {
            trace!("duplicate unit dropped: seq={seq}");
            return Ok(Vec::new());
        }

        if seq > expected {
            if !self.reliable {
                trace!("gap abandoned: expected={expected}, seq={seq}");
                return Ok(self.deliver_from(seq, unit));
            }
            if !unit.is_fin() {
                self.check_window(seq, expected)?;
            }
            self.buffered.insert(seq, unit);
            return Ok(Vec::new());
        }

        Ok(self.deliver_from(seq, unit))
    }

    fn deliver_from(&mut self, seq: SeqNum, unit: Unit) -> Vec<Unit> {
        let mut delivered = vec![unit];
        let mut next = seq.checked_next();
        while let Some(candidate) = next
            && let Some(unit) = self.buffered.remove(&candidate)
        {
            delivered.push(unit);
            next = candidate.checked_next();
        }
        self.expected = next;
        delivered
    }

    fn check_window(&self, seq: SeqNum, expected: SeqNum) -> Result<(), ProtocolViolation> {
        if self.flow_controlled {
            let limit = u64::from(expected.get()) + u64::from(self.capacity);
            if u64::from(seq.get()) >= limit {
                return Err(ProtocolViolation::OutOfWindow {
                    seq,
                    expected,
                    window: self.capacity,
                });
            }
        } else if self.buffered_data() >= self.max_out_of_order {
            return Err(ProtocolViolation::OutOfOrderLimit {
                seq,
                limit: self.max_out_of_order,
            });
        }
        Ok(())
    }

    /// Highest sequence number received without gaps.
    #[must_use]
    pub fn highest_contiguous(&self) -> Option<SeqNum> {
        match self.expected {
            Some(expected) => expected.checked_prev(),
            None => Some(SeqNum::new(u32::MAX)),
        }
    }

    /// Data units this side can still accept.
    #[must_use]
    pub fn advertised_window(&self) -> u32 {
        let buffered = u32::try_from(self.buffered_data()).unwrap_or(u32::MAX);
        self.capacity.saturating_sub(buffered)
    }

    fn buffered_data(&self) -> usize {
        self.buffered
            .values()
            .filter(|unit| !unit.is_fin())
            .count()
    }

    /// Whether an acknowledgment should be sent.
    #[must_use]
    pub fn is_ack_due(&self) -> bool { self.ack_due }

    /// Units held out of order.
    #[must_use]
    pub fn buffered_len(&self) -> usize { self.buffered.len() }

    /// Build an acknowledgment and clear the pending flag.
    ///
    /// `fin` carries this side's own FIN sequence number when the ack doubles
    /// as a FIN.
    pub fn build_ack(&mut self, stream_id: StreamId, fin: Option<SeqNum>) -> AckMessage {
        self.ack_due = false;
        let acks = RangeList::from_seqs(self.buffered.keys().copied());
        let naks = if self.reliable {
            self.holes()
        } else {
            RangeList::new()
        };
        AckMessage {
            stream_id,
            seq: self.highest_contiguous(),
            window: self.advertised_window(),
            fin,
            acks,
            naks,
        }
    }

    fn holes(&self) -> RangeList {
        let Some(mut cursor) = self.expected else {
            return RangeList::new();
        };
        let mut holes = Vec::new();
        for &seq in self.buffered.keys() {
            if seq > cursor
                && let Some(end) = seq.checked_prev()
                && let Some(hole) = Range::new(cursor, end)
            {
                holes.push(hole);
            }
            match seq.checked_next() {
                Some(next) => cursor = next,
                None => break,
            }
        }
        RangeList::from_ranges(holes)
    }

    /// Drop every buffered unit.
    pub fn clear(&mut self) { self.buffered.clear(); }
}
