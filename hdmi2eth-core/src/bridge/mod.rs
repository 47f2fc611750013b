//! Remote bus bridge.
//!
//! Lets a remote peer read and write the local register/memory bus over
//! the control port. A connection carries a stream of requests; each is
//! decoded by [`BridgeCodec`], executed against the [`Bus`], and answered
//! before the next one is read, so responses always leave in request order.
//!
//! ## Exchange
//! ```text
//! Peer ──[READ  addr, burst n]──────────────► Bridge
//! Peer ◄─[OK, n words]──────────────────────  Bridge
//!
//! Peer ──[WRITE addr, burst n, n words]─────► Bridge
//! Peer ◄─[OK, 0 words]──────────────────────  Bridge
//!
//! Peer ──[READ  unmapped addr]──────────────► Bridge
//! Peer ◄─[UNMAPPED, fault_address]──────────  Bridge
//! ```
//!
//! | Module   | Purpose                                        |
//! |----------|------------------------------------------------|
//! | `wire`   | Request / response records and their layout    |
//! | `codec`  | `tokio_util` codecs for both ends              |
//! | `bus`    | Address decoding and bus targets               |
//! | `server` | Listener and per-connection sessions           |
//! | `client` | Async client for tooling and tests             |

pub mod bus;
pub mod client;
pub mod codec;
pub mod server;
pub mod wire;

use thiserror::Error;

pub use bus::{ArbitratedMemory, Bus, BusTarget, RegisterFile};
pub use client::BridgeClient;
pub use codec::{BridgeClientCodec, BridgeCodec};
pub use server::BridgeServer;
pub use wire::{BridgeFlags, Opcode, Request, Response, Status};

/// A bus transaction that could not be carried out.
///
/// Every variant maps to a [`Status`] on the wire and is reported to the
/// peer; none of them affects the connection or other requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusFault {
    /// No registered region covers the address.
    #[error("address {address:#010x} is not mapped")]
    Unmapped { address: u32 },

    /// The address is not word aligned.
    #[error("address {address:#010x} is not word aligned")]
    Misaligned { address: u32 },

    /// The burst runs past the end of its region.
    #[error("burst of {words} words at {address:#010x} leaves its region")]
    BurstOverrun { address: u32, words: u32 },

    /// The region has no target attached, or the target refused.
    #[error("target fault at {address:#010x}")]
    TargetFault { address: u32 },

    /// The request itself is malformed.
    #[error("bad request: {0}")]
    BadRequest(&'static str),
}

impl BusFault {
    /// Status code carried on the wire.
    pub fn status(&self) -> Status {
        match self {
            BusFault::Unmapped { .. } => Status::Unmapped,
            BusFault::Misaligned { .. } => Status::Misaligned,
            BusFault::BurstOverrun { .. } => Status::BurstOverrun,
            BusFault::TargetFault { .. } => Status::TargetFault,
            BusFault::BadRequest(_) => Status::BadRequest,
        }
    }

    /// Faulting address, zero when the fault has none.
    pub fn address(&self) -> u32 {
        match self {
            BusFault::Unmapped { address }
            | BusFault::Misaligned { address }
            | BusFault::BurstOverrun { address, .. }
            | BusFault::TargetFault { address } => *address,
            BusFault::BadRequest(_) => 0,
        }
    }
}
