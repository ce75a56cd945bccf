//! Wire format of the protocol. A UDP datagram is a sequence of messages, each consisting of a
//!  [message_header::MessageHeader] followed by its payload, with no packet-level header.
//!  Acknowledgements travel as ordinary library messages, see [library_messages].

pub mod library_messages;
pub mod message_header;
pub mod message_type;
pub mod packet_writer;
