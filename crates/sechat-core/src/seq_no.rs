//! Sequence numbering.
//!
//! Each side counts the messages it originated (`my_out_seq_no`) and the
//! messages it admitted from the peer (`my_in_seq_no`). On the wire both
//! counters are doubled and tagged with the sender's role so that the two
//! directions never collide:
//!
//! ```text
//! in_seq_no  = 2 * my_in_seq_no + x
//! out_seq_no = 2 * (my_out_seq_no - 1) + (1 - x)
//! ```
//!
//! where `x` is 0 for the creator and 1 for the acceptor, and
//! `my_out_seq_no` already counts the message being sent.

use crate::state::SeqNoState;
use crate::{Error, Result};

/// Upper bound on the number of messages served by one resend request.
pub const MAX_RESEND_COUNT: i32 = 1000;

/// Sequence numbers carried by one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireSeqNo {
    /// Sender's in counter, doubled and tagged.
    pub in_seq_no: i32,
    /// Sender's out counter, doubled and tagged.
    pub out_seq_no: i32,
}

impl WireSeqNo {
    /// Encodes the counters of the sender with role `x`.
    pub fn encode(my_in_seq_no: i32, my_out_seq_no: i32, x: i32) -> Self {
        Self {
            in_seq_no: 2 * my_in_seq_no + x,
            out_seq_no: 2 * (my_out_seq_no - 1) + (1 - x),
        }
    }

    /// Position of the message among the sender's originated messages.
    pub fn out_index(&self) -> i32 {
        self.out_seq_no / 2
    }
}

/// Counters of an admitted inbound message, halved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Peer's count of our messages it received.
    pub his_in_seq_no: i32,
    /// Peer's index of this message.
    pub his_out_seq_no: i32,
    /// Peer's layer.
    pub his_layer: i32,
}

/// Counters recorded by a message event and applied to the chat state.
///
/// Events carry the counters as they are after the message, so replaying an
/// event that was already applied is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqNoUpdate {
    /// Local message id of the message.
    pub message_id: i32,
    /// Our in counter.
    pub my_in_seq_no: i32,
    /// Our out counter.
    pub my_out_seq_no: i32,
    /// Peer's in counter.
    pub his_in_seq_no: i32,
    /// Peer's layer, -1 when unknown.
    pub his_layer: i32,
}

/// Result of [`SeqNoState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqNoChange {
    /// The update is not newer than the state.
    Stale,
    /// Counters moved.
    Applied {
        /// Whether the peer acknowledged more of our messages.
        his_in_changed: bool,
    },
}

impl SeqNoState {
    /// Counters after sending one more message.
    pub fn next_outbound(&self) -> SeqNoUpdate {
        SeqNoUpdate {
            message_id: self.message_id + 1,
            my_in_seq_no: self.my_in_seq_no,
            my_out_seq_no: self.my_out_seq_no + 1,
            his_in_seq_no: self.his_in_seq_no,
            his_layer: -1,
        }
    }

    /// Counters after admitting a checked inbound message.
    pub fn next_inbound(&self, admission: Admission) -> SeqNoUpdate {
        SeqNoUpdate {
            message_id: self.message_id + 1,
            my_in_seq_no: admission.his_out_seq_no + 1,
            my_out_seq_no: self.my_out_seq_no,
            his_in_seq_no: admission.his_in_seq_no,
            his_layer: admission.his_layer,
        }
    }

    /// Validates the numbers of an inbound message against our counters.
    ///
    /// # Errors
    /// - `Error::StaleSeqNo` if the message was already admitted
    /// - `Error::SeqNoGap` if earlier peer messages are missing
    /// - `Error::ProtocolViolation` on negative numbers, bad parity, a
    ///   decreasing ack or layer, or an ack of messages we never sent
    pub fn check_inbound(&self, x: i32, seq_no: WireSeqNo, his_layer: i32) -> Result<Admission> {
        if seq_no.in_seq_no < 0 || seq_no.out_seq_no < 0 {
            return Err(Error::ProtocolViolation(format!(
                "invalid sequence numbers {}/{}",
                seq_no.in_seq_no, seq_no.out_seq_no
            )));
        }
        if seq_no.in_seq_no % 2 != 1 - x || seq_no.out_seq_no % 2 != x {
            return Err(Error::ProtocolViolation(format!(
                "bad sequence number parity {}/{}",
                seq_no.in_seq_no, seq_no.out_seq_no
            )));
        }

        let his_in_seq_no = seq_no.in_seq_no / 2;
        let his_out_seq_no = seq_no.out_seq_no / 2;

        if his_out_seq_no < self.my_in_seq_no {
            return Err(Error::StaleSeqNo {
                expected: self.my_in_seq_no,
                received: his_out_seq_no,
            });
        }
        if his_out_seq_no > self.my_in_seq_no {
            return Err(Error::SeqNoGap {
                expected: self.my_in_seq_no,
                received: his_out_seq_no,
            });
        }
        if his_in_seq_no < self.his_in_seq_no {
            return Err(Error::ProtocolViolation(format!(
                "in_seq_no decreased from {} to {}",
                self.his_in_seq_no, his_in_seq_no
            )));
        }
        if his_in_seq_no > self.my_out_seq_no {
            return Err(Error::ProtocolViolation(format!(
                "in_seq_no {} acks more than the {} messages we sent",
                his_in_seq_no, self.my_out_seq_no
            )));
        }
        if his_layer < self.his_layer {
            return Err(Error::ProtocolViolation(format!(
                "layer decreased from {} to {}",
                self.his_layer, his_layer
            )));
        }

        Ok(Admission {
            his_in_seq_no,
            his_out_seq_no,
            his_layer,
        })
    }

    /// Moves the counters to `update` unless the state is already there.
    pub fn apply(&mut self, update: &SeqNoUpdate) -> SeqNoChange {
        if self.message_id >= update.message_id
            && self.my_in_seq_no >= update.my_in_seq_no
            && self.my_out_seq_no >= update.my_out_seq_no
            && self.his_in_seq_no >= update.his_in_seq_no
        {
            return SeqNoChange::Stale;
        }
        self.message_id = update.message_id;
        self.my_in_seq_no = update.my_in_seq_no;
        self.my_out_seq_no = update.my_out_seq_no;
        if update.his_layer != -1 {
            self.his_layer = update.his_layer;
        }
        let his_in_changed = self.his_in_seq_no != update.his_in_seq_no;
        self.his_in_seq_no = update.his_in_seq_no;
        SeqNoChange::Applied { his_in_changed }
    }

    /// Whether our message with the given out index was received by the peer.
    pub fn is_acked(&self, out_index: i32) -> bool {
        out_index < self.his_in_seq_no
    }

    /// Converts a peer resend request into a range of our out indexes.
    ///
    /// Both bounds are wire numbers of our outbound messages. The returned
    /// range is inclusive.
    ///
    /// # Errors
    /// Returns `Error::ProtocolViolation` for an inverted range, a range longer
    /// than [`MAX_RESEND_COUNT`], or messages we never sent.
    pub fn resend_range(&self, start_seq_no: i32, end_seq_no: i32) -> Result<(i32, i32)> {
        if start_seq_no < 0 || end_seq_no < start_seq_no {
            return Err(Error::ProtocolViolation(format!(
                "invalid resend range {}..={}",
                start_seq_no, end_seq_no
            )));
        }
        let start = start_seq_no / 2;
        let end = end_seq_no / 2;
        if end > start + MAX_RESEND_COUNT {
            return Err(Error::ProtocolViolation(format!(
                "won't resend more than {} messages",
                MAX_RESEND_COUNT
            )));
        }
        if end >= self.my_out_seq_no {
            return Err(Error::ProtocolViolation(format!(
                "can't resend message {} that was never sent",
                end
            )));
        }
        Ok((start, end))
    }
}
