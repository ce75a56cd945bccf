use std::time::Duration;
use bytes::BytesMut;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::trace;
use crate::sequence::SequenceNumber;
use crate::wire::message_header::FragmentHeader;
use crate::wire::message_type::{DeliveryMethod, MessageType, NUM_CHANNELS, NUM_MESSAGE_TYPES};

/// A user message as it was received, with its payload copied out of the datagram
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    pub message_type: MessageType,
    pub sequence_number: Option<SequenceNumber>,
    pub fragment: Option<FragmentHeader>,
    pub data: BytesMut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Classification {
    Accepted,
    Duplicate,
    /// arrived before an earlier message on a reliable ordered channel, held back until the
    ///  gap is filled
    Withheld,
    /// older than the newest message received on a sequenced channel
    Late,
}

/// Receive side of the reliability engine: classifies incoming user messages per channel,
///  withholds early messages on ordered channels, and collects acknowledgements to send.
///  Owned by the network thread.
pub(crate) struct ReceiveChannels {
    next_expected: [SequenceNumber; NUM_MESSAGE_TYPES],
    /// reliable unordered: sequence numbers received ahead of `next_expected`
    early_unordered: FxHashSet<SequenceNumber>,
    /// reliable ordered, per channel
    withheld: Vec<FxHashMap<SequenceNumber, ReceivedMessage>>,
    pending_acks: Vec<(SequenceNumber, u8)>,
    oldest_pending_ack: Option<Instant>,
}

impl ReceiveChannels {
    pub fn new() -> ReceiveChannels {
        ReceiveChannels {
            next_expected: [SequenceNumber::ZERO; NUM_MESSAGE_TYPES],
            early_unordered: Default::default(),
            withheld: (0..NUM_CHANNELS).map(|_| FxHashMap::default()).collect(),
            pending_acks: Vec::new(),
            oldest_pending_ack: None,
        }
    }

    /// Classifies a received user message. `deliver` is called for every message that is
    ///  released to the application as a consequence, in delivery order. Reliable messages are
    ///  acknowledged regardless of their classification, since the ack for an earlier copy may
    ///  have been lost.
    pub fn receive(&mut self, msg: ReceivedMessage, now: Instant, mut deliver: impl FnMut(ReceivedMessage)) -> Classification {
        let MessageType::User { method, channel } = msg.message_type else {
            debug_assert!(false, "only user messages are classified");
            return Classification::Duplicate;
        };

        let Some(sequence_number) = msg.sequence_number else {
            // unreliable messages carry no sequence number
            deliver(msg);
            return Classification::Accepted;
        };

        let raw_type = msg.message_type.to_raw();
        if method.is_reliable() {
            self.queue_ack(sequence_number, raw_type, now);
        }

        let expected = self.next_expected[raw_type as usize];
        let relation = sequence_number.distance(expected);

        let result = match method {
            DeliveryMethod::Unreliable => Classification::Accepted,
            DeliveryMethod::UnreliableSequenced | DeliveryMethod::ReliableSequenced => {
                if relation < 0 {
                    Classification::Late
                }
                else {
                    self.next_expected[raw_type as usize] = sequence_number.next();
                    Classification::Accepted
                }
            }
            DeliveryMethod::ReliableUnordered => {
                if relation < 0 || (relation > 0 && self.early_unordered.contains(&sequence_number)) {
                    Classification::Duplicate
                }
                else if relation > 0 {
                    self.early_unordered.insert(sequence_number);
                    Classification::Accepted
                }
                else {
                    let mut next = sequence_number.next();
                    while self.early_unordered.remove(&next) {
                        next = next.next();
                    }
                    self.next_expected[raw_type as usize] = next;
                    Classification::Accepted
                }
            }
            DeliveryMethod::ReliableOrdered => {
                if relation < 0 {
                    Classification::Duplicate
                }
                else if relation > 0 {
                    let withheld = &mut self.withheld[channel as usize];
                    if withheld.contains_key(&sequence_number) {
                        Classification::Duplicate
                    }
                    else {
                        trace!("withholding {:?} #{}, expecting #{}", msg.message_type, sequence_number, expected);
                        withheld.insert(sequence_number, msg);
                        return Classification::Withheld;
                    }
                }
                else {
                    deliver(msg);

                    let withheld = &mut self.withheld[channel as usize];
                    let mut next = sequence_number.next();
                    while let Some(released) = withheld.remove(&next) {
                        trace!("releasing withheld #{}", next);
                        deliver(released);
                        next = next.next();
                    }
                    self.next_expected[raw_type as usize] = next;
                    return Classification::Accepted;
                }
            }
        };

        if result == Classification::Accepted {
            deliver(msg);
        }
        else {
            trace!("{:?} for {:?} #{}, expecting #{}", result, msg.message_type, sequence_number, expected);
        }
        result
    }

    fn queue_ack(&mut self, sequence_number: SequenceNumber, raw_type: u8, now: Instant) {
        if self.oldest_pending_ack.is_none() {
            self.oldest_pending_ack = Some(now);
        }
        self.pending_acks.push((sequence_number, raw_type));
    }

    pub fn num_pending_acks(&self) -> usize {
        self.pending_acks.len()
    }

    pub fn should_flush_acks(&self, now: Instant, threshold: usize, max_delay: Duration) -> bool {
        if self.pending_acks.len() >= threshold {
            return true;
        }
        match self.oldest_pending_ack {
            Some(t) => now.duration_since(t) >= max_delay,
            None => false,
        }
    }

    pub fn take_acks(&mut self) -> Vec<(SequenceNumber, u8)> {
        self.oldest_pending_ack = None;
        std::mem::take(&mut self.pending_acks)
    }

    pub fn num_withheld(&self) -> usize {
        self.withheld.iter().map(|w| w.len()).sum()
    }

    pub fn clear(&mut self) {
        for w in self.withheld.iter_mut() {
            w.clear();
        }
        self.early_unordered.clear();
        self.pending_acks.clear();
        self.oldest_pending_ack = None;
    }
}
