//! # gtid-relay-core - Shared Types for the GTID Relay
//!
//! Wire codec and GTID set algebra used by both halves of the replication
//! bridge: the extractor encodes captured transactions into frames, the
//! applier decodes them and reports progress as a merged GTID set.
//!
//! ## Modules
//!
//! - [`codec`] - Transaction frame encoding (bincode + snappy) with strict
//!   full-consumption decoding
//! - [`gtid`] - `uuid:gno` identifiers and interval-based GTID sets with
//!   canonical text serialization

pub mod codec;
pub mod gtid;

pub use codec::{decode, encode, CodecError, Transaction, MAX_FRAME_SIZE};
pub use gtid::{Gtid, GtidError, GtidSet, Interval};
