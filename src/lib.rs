//! Reliable chunked messaging over UDP for cluster members.
//!
//! Cluster nodes exchange variable-size application messages over plain UDP datagrams.
//!  Each message is split into fixed-size chunks, transmitted (unicast or broadcast),
//!  and a lightweight reliability protocol on top of the datagrams takes care of
//!  receipts, selective re-transmission of missing chunks, bounded retries and garbage
//!  collection of completed state.
//!
//! ## Design goals
//!
//! * At-least-once delivery for unicast messages, with receiver-side deduplication by
//!   message id within a bounded retention window. Exactly-once is explicitly *not*
//!   promised.
//! * No ordering guarantees across distinct messages. Chunks of one message may arrive
//!   in any order; they are written by index.
//! * Fire-and-forget broadcast within the local broadcast domain, used for discovery
//!   and group-wide control messages. Broadcast messages are never acknowledged.
//! * All sockets, timers and retry state are per node and per message - there is no
//!   connection concept, and a peer can appear, restart or vanish at any time.
//! * Encryption, authentication and congestion control are out of scope.
//!
//! ## Wire format
//!
//! Every datagram starts with the same 55-byte header, all integers little-endian:
//!
//! ```ascii
//!  0: frame type (u8) - matched modulo 16, the high nibble is reserved
//!  1: message id: minting node's cluster identity (u64 time, u64 rand)
//!      followed by the locally unique part (u64 time, u64 rand)
//! 33: destination cluster identity (u64 time, u64 rand) - all-zero means broadcast
//! 49: total payload size (u32)
//! 53: chunk size (u16)
//! ```
//!
//! The frame types and their trailers:
//!
//! | type | name              | trailer                                  | direction        |
//! |------|-------------------|------------------------------------------|------------------|
//! | 1    | Chunk             | index (u32), payload bytes               | sender→receiver  |
//! | 2    | ReceiptRequest    | -                                        | sender→receiver  |
//! | 3    | Receipt           | error code (u16; 0 ok, 1 fail)           | receiver→sender  |
//! | 4    | ChunksNeeded      | count (u16), count x index (u32)         | receiver→sender  |
//! | 5    | ChunkRangesNeeded | count (u16), count x (u32 lo, u32 hi)    | receiver→sender  |
//! | 6    | NoLongerExists    | -                                        | sender→receiver  |
//!
//! Chunk ranges are inclusive on both ends. Chunks are at most 1024 bytes, whole
//!  datagrams at most 16 KiB.
//!
//! ## Sockets
//!
//! Each non-loopback IPv4 interface gets a unicast socket on the first free port in
//!  `9901..=9999` (broadcast-enabled for sending) and a broadcast-receive socket with
//!  address reuse on port 9900. One receiver task runs per socket. Peer addresses are
//!  learned passively from inbound traffic; outbound routing picks the interface that
//!  shares a network prefix with the target, falling back to broadcast when a
//!  destination has never been heard from.

pub mod address_map;
pub mod cluster_message;
pub mod config;
pub mod dispatcher;
pub mod frame;
pub mod identity;
pub mod interfaces;
pub mod receiving_message;
pub mod sending_message;
pub mod transport;

mod receiver;
mod workers;
