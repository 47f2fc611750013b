//! # hdmi2eth-core
//!
//! Composition fabric of the HDMI2ETH system-on-chip: two video inputs
//! captured into shared memory, compressed and streamed over Ethernet,
//! with a remote bus bridge for register access.
//!
//! This crate contains:
//! - **Map**: `ResourceMap`, the single source of truth for addresses,
//!   CSR slots, interrupts, ports and constants
//! - **Clock**: `ClockTopology`, timing domains and the crossings between them
//! - **Arbiter**: `Crossbar`, round-robin arbitration of the shared memory
//! - **Network**: station identity, control port and bulk port plumbing
//! - **Bridge**: remote bus bridge over the control port
//! - **Stream**: capture, encoder reader, compressor and stream sender
//! - **Soc**: `Soc`, which builds and runs all of the above
//! - **Error**: `SocError`, typed, `thiserror`-based error hierarchy
//!
//! | Port  | Protocol | Consumer           | Buffer |
//! |-------|----------|--------------------|--------|
//! | 20000 | TCP      | remote bus bridge  | 1      |
//! | 8000  | UDP      | bulk video stream  | 8      |

pub mod arbiter;
pub mod bridge;
pub mod clock;
pub mod error;
pub mod map;
pub mod network;
pub mod soc;
pub mod stream;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use arbiter::{
    ArbiterPort, ClientBuffer, ClientId, ClientStats, Crossbar, CrossbarBuilder, Direction,
};
pub use bridge::{
    BridgeClient, BridgeServer, Bus, BusFault, BusTarget, Request, Response, Status,
};
pub use clock::{ClockSource, ClockTopology, CrossingKind, DomainId, Route, TopologyBuilder};
pub use error::{Result, SocError};
pub use map::{AddressRegion, ResourceMap, ResourceMapBuilder};
pub use network::{
    CONTROL_PORT, MacAddress, NetworkIdentity, NetworkPort, Protocol, STREAM_BUFFER_DEPTH,
    STREAM_PORT,
};
pub use soc::{RunningSoc, Soc, SocParams};
pub use stream::{CaptureBuffer, FrameGeometry, OverflowPolicy, VideoLine};
