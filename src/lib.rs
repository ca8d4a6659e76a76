//! A reliable, ordered, bidirectional byte stream protocol on top of an unreliable,
//!  message-oriented session layer (e.g. an anonymizing overlay network).
//!
//! ## Design
//!
//! * The session delivers single packets to opaque [destinations](destination::Destination),
//!   possibly out of order, duplicated or not at all. This crate turns that into TCP-like
//!   streams.
//!   * Each side identifies a stream by its own random 32 bit stream id, and the handshake
//!     (a SYN from either side) exchanges them
//!   * Security relevant packets (SYN, CLOSE, RESET, pings) are signed
//! * Data is split into numbered blocks of at most `max_message_size` bytes
//!   * The receiver acks the highest block it received and NACKs the gaps below it
//!   * The sender keeps a congestion window of unacked blocks, retransmits with exponential
//!     backoff based on an RTT estimate, and fast-retransmits repeatedly NACKed blocks
//!   * Acks are delayed a little so that they can be piggybacked on data
//! * The receive side is protected against floods: a byte budget for buffered data, and limits
//!   on how many out-of-order blocks may wait for a gap and how far ahead of the gap they may be
//!   * A full receive buffer chokes the peer until the application reads
//! * Each SYN announces the sender's maximum block size, and both sides send blocks of at most
//!   the smaller of the two
//! * All timeouts (retransmission, delayed acks, connect and close timeouts, keepalives, final
//!   cleanup) are driven by a single shared timer that applies the strategy of each
//!   connection's lifecycle state
//!
//! ## Entry point
//!
//! [ConnectionManager](connection_manager::ConnectionManager) connects, accepts and pings, and
//!  receives all packets from the [Session](session::Session).

pub mod block_id;
pub mod clock;
pub mod connection;
pub mod connection_manager;
pub mod connection_packet_handler;
pub mod destination;
pub mod error;
pub mod options;
pub mod packet;
pub mod packet_queue;
pub mod receive_buffer;
pub mod rtt;
pub mod scheduler;
pub mod send_buffer;
pub mod session;
pub mod signature;
pub mod stream_map;
pub mod timer;

#[cfg(test)]
mod test_util;
