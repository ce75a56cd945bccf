//! Peer-to-peer messaging over UDP with a choice of delivery guarantees per message.
//!
//! ## Delivery methods
//!
//! * *Unreliable*: no guarantees at all, no overhead beyond the message header
//! * *UnreliableSequenced*: messages may get lost, and messages arriving after a newer message
//!   on the same channel are dropped
//! * *ReliableUnordered*: every message arrives exactly once, in any order
//! * *ReliableSequenced*: like UnreliableSequenced, but the newest message is re-sent until it
//!   is acknowledged
//! * *ReliableOrdered*: every message arrives exactly once, in the order it was sent on its
//!   channel. Messages arriving early are withheld until the gap is filled.
//!
//! Sequenced and ordered delivery have 32 independent channels per delivery method, so that a
//!  lost message on one channel does not hold up messages on others.
//!
//! ## Design
//!
//! * There is no packet-level header: a datagram is a sequence of messages, each with its own
//!   small header. Acknowledgements, pings and the handshake are *library messages* of the
//!   same format, so acks for several messages are batched and can share a datagram with
//!   application data.
//! * Sequence numbers wrap around in a space of 1024 per channel, and the send window is well
//!   below half of that, so wraparound is never ambiguous.
//! * Messages bigger than a datagram are split into fragments, each sent (and for reliable
//!   delivery methods re-sent) as a message of its own and reassembled on the receiving side.
//! * Resend timing adapts to the measured round trip time. It is configured as a table of base
//!   delays and RTT multipliers per send attempt.
//! * All protocol state is owned by a single network thread. The application talks to it
//!   through non-blocking calls: sending enqueues, [peer::Peer::read_message] polls.
//! * Buffers are pooled per [peer::Peer] to avoid allocation per datagram.
//!
//! Explicitly *not* in scope: encryption, NAT traversal, congestion control beyond a simple
//!  configurable byte rate throttle.

pub mod buffers;
pub mod config;
pub mod connection;
pub mod error;
pub mod peer;
pub mod sequence;
pub mod util;
pub mod wire;
