use std::ops::Range;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::buffers::outgoing::QueueRef;
use crate::config::ResendPolicy;
use crate::sequence::SequenceNumber;
use crate::wire::message_header::FragmentHeader;
use crate::wire::message_type::{MessageType, NUM_MESSAGE_TYPES};

/// A message waiting in an outbound queue or stored for resend. Fragments of a big message
///  share the payload and each refer to their slice of it.
#[derive(Debug, Clone)]
pub(crate) struct QueuedMessage {
    pub payload: QueueRef,
    pub message_type: MessageType,
    pub fragment: Option<(FragmentHeader, Range<usize>)>,
}

impl QueuedMessage {
    pub fn new(payload: QueueRef, message_type: MessageType) -> QueuedMessage {
        QueuedMessage {
            payload,
            message_type,
            fragment: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.fragment {
            Some((_, range)) => &self.payload.data()[range.clone()],
            None => self.payload.data(),
        }
    }

    pub fn fragment_header(&self) -> Option<FragmentHeader> {
        self.fragment.as_ref().map(|(h, _)| *h)
    }
}

#[derive(Debug)]
struct StoredMessage {
    message: QueuedMessage,
    sequence_number: SequenceNumber,
    num_sends: u32,
    next_resend: Instant,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResendOutcome {
    pub resent: usize,
    pub dropped: usize,
}

/// Send side of the reliability engine: sequence numbers per channel, and reliable messages
///  stored until they are acknowledged. Owned by the network thread.
pub(crate) struct SendChannels {
    next_sequence_numbers: [SequenceNumber; NUM_MESSAGE_TYPES],
    /// indexed by raw message type, only reliable types are ever populated
    stored: Vec<Vec<StoredMessage>>,
    earliest_resend: Option<Instant>,
    window_size: usize,
}

impl SendChannels {
    pub fn new(window_size: u16) -> SendChannels {
        SendChannels {
            next_sequence_numbers: [SequenceNumber::ZERO; NUM_MESSAGE_TYPES],
            stored: (0..NUM_MESSAGE_TYPES).map(|_| Vec::new()).collect(),
            earliest_resend: None,
            window_size: window_size as usize,
        }
    }

    /// Reliable channels accept no new messages while the number of unacknowledged messages
    ///  equals the window size
    pub fn is_window_full(&self, message_type: MessageType) -> bool {
        message_type.is_reliable()
            && self.stored[message_type.to_raw() as usize].len() >= self.window_size
    }

    pub fn assign_sequence_number(&mut self, message_type: MessageType) -> Option<SequenceNumber> {
        if !message_type.has_sequence_number() {
            return None;
        }
        let slot = &mut self.next_sequence_numbers[message_type.to_raw() as usize];
        let result = *slot;
        *slot = result.next();
        Some(result)
    }

    /// Stores a reliable message after it was sent for the first time
    pub fn store(&mut self, message: QueuedMessage, sequence_number: SequenceNumber, now: Instant, policy: &ResendPolicy, avg_rtt: Duration) {
        debug_assert!(message.message_type.is_reliable());

        let next_resend = now + policy.resend_delay(1, avg_rtt);
        trace!("storing {:?} #{} for resend at +{:?}", message.message_type, sequence_number, next_resend - now);
        self.earliest_resend = Some(match self.earliest_resend {
            Some(t) => t.min(next_resend),
            None => next_resend,
        });

        self.stored[message.message_type.to_raw() as usize].push(StoredMessage {
            message,
            sequence_number,
            num_sends: 1,
            next_resend,
        });
    }

    /// Calls `resend` for every stored message whose resend time has come, in the order they
    ///  were stored. Messages that were already sent `max_sends` times are dropped instead.
    pub fn resend_due(&mut self, now: Instant, policy: &ResendPolicy, avg_rtt: Duration, mut resend: impl FnMut(&QueuedMessage, SequenceNumber)) -> ResendOutcome {
        let mut outcome = ResendOutcome::default();

        match self.earliest_resend {
            Some(t) if t <= now => {}
            _ => return outcome,
        }

        let mut earliest: Option<Instant> = None;
        for channel in self.stored.iter_mut() {
            channel.retain_mut(|stored| {
                if stored.next_resend > now {
                    earliest = Some(earliest.map_or(stored.next_resend, |t| t.min(stored.next_resend)));
                    return true;
                }

                if stored.num_sends >= policy.max_sends {
                    debug!("dropping {:?} #{} after {} unacknowledged sends", stored.message.message_type, stored.sequence_number, stored.num_sends);
                    outcome.dropped += 1;
                    return false;
                }

                resend(&stored.message, stored.sequence_number);
                stored.num_sends += 1;
                stored.next_resend = now + policy.resend_delay(stored.num_sends, avg_rtt);
                earliest = Some(earliest.map_or(stored.next_resend, |t| t.min(stored.next_resend)));
                outcome.resent += 1;
                true
            });
        }
        self.earliest_resend = earliest;
        outcome
    }

    /// Removes the stored message for an acknowledgement. Returns `false` for an ack that
    ///  matches no stored message, e.g. a duplicate ack.
    pub fn on_ack(&mut self, sequence_number: SequenceNumber, raw_type: u8) -> bool {
        let Some(channel) = self.stored.get_mut(raw_type as usize) else {
            return false;
        };

        match channel.iter().position(|s| s.sequence_number == sequence_number) {
            Some(idx) => {
                trace!("ack for type {} #{}", raw_type, sequence_number);
                channel.remove(idx);
                if self.stored.iter().all(|c| c.is_empty()) {
                    self.earliest_resend = None;
                }
                true
            }
            None => {
                trace!("ack for type {} #{} matches no stored message", raw_type, sequence_number);
                false
            }
        }
    }

    pub fn num_stored(&self) -> usize {
        self.stored.iter().map(|c| c.len()).sum()
    }

    /// Releases all stored messages, decrementing their in-queue counts
    pub fn clear(&mut self) {
        for channel in self.stored.iter_mut() {
            channel.clear();
        }
        self.earliest_resend = None;
    }
}
