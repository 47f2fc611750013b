//! Domain-specific error types for the HDMI2ETH composition fabric.
//!
//! Configuration errors are returned by builders and abort start-up.
//! Bus faults travel back to the remote peer inside bridge responses.
//! Nothing in this crate panics on bad input.

use thiserror::Error;

use crate::clock::DomainId;

/// The canonical error type for the composition fabric.
#[derive(Debug, Error)]
pub enum SocError {
    // ── Configuration Errors ─────────────────────────────────────
    /// Two regions claim the same name.
    #[error("duplicate region name: {0}")]
    DuplicateRegion(String),

    /// A region window intersects a window already registered.
    #[error("region {name} [{base:#010x}+{size:#x}] overlaps {other}")]
    RegionOverlap {
        name: String,
        base: u32,
        size: u32,
        other: String,
    },

    /// A region has zero size or wraps past the end of the address space.
    #[error("region {name} has an invalid extent: base {base:#010x} size {size:#x}")]
    InvalidRegion { name: String, base: u32, size: u32 },

    /// A name was looked up that was never registered.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// A CSR slot, interrupt line or constant is assigned twice.
    #[error("{kind} conflict: {name} collides on {value}")]
    ResourceConflict {
        kind: &'static str,
        name: String,
        value: u64,
    },

    /// Two network ports share a number.
    #[error("network port {0} assigned twice")]
    DuplicatePort(u16),

    /// A domain name is declared twice.
    #[error("duplicate clock domain: {0}")]
    DuplicateDomain(String),

    /// A signal crosses domains without a declared primitive or exemption.
    #[error("undeclared crossing for {signal}: {from} -> {to}")]
    UndeclaredCrossing {
        signal: String,
        from: String,
        to: String,
    },

    /// A false-path exemption names a domain pair with no crossing primitive.
    #[error("false path {from} -> {to} has no crossing primitive")]
    UnprotectedFalsePath { from: String, to: String },

    /// A domain id does not belong to this topology.
    #[error("unknown clock domain id {0:?}")]
    UnknownDomain(DomainId),

    /// A client's buffer drains before the arbiter can serve it.
    #[error(
        "client {client} buffer too small: {depth} entries x {period} cycles < worst-case latency {latency} cycles"
    )]
    BufferUndersized {
        client: String,
        depth: usize,
        period: u64,
        latency: u64,
    },

    /// A memory client name appears twice on the crossbar.
    #[error("duplicate memory client: {0}")]
    DuplicateClient(String),

    /// Some other build-time parameter is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the bridge magic.
    #[error("invalid magic: {0:#06x}")]
    InvalidMagic(u16),

    /// The peer speaks a bridge version we do not.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The bridge answered with a fault.
    #[error("bus fault: {0}")]
    Bus(#[from] crate::bridge::BusFault),

    /// A response did not match the request it answers.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/UDP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// A channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer closed the connection before answering.
    #[error("connection closed by peer")]
    ConnectionClosed,

    // ── Serialization Errors ─────────────────────────────────────
    /// Export of the resource map failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Runtime Errors ───────────────────────────────────────────
    /// The external compressor rejected a frame.
    #[error("compressor error: {0}")]
    Compressor(String),

    /// A domain task panicked or was aborted.
    #[error("domain task failed: {0}")]
    Task(String),
}

/// Convenient alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SocError>;

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SocError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SocError::ChannelClosed
    }
}

impl From<serde_json::Error> for SocError {
    fn from(e: serde_json::Error) -> Self {
        SocError::Encoding(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SocError {
    fn from(e: tokio::task::JoinError) -> Self {
        SocError::Task(e.to_string())
    }
}

impl SocError {
    /// Returns `true` for errors that can only arise while building the SoC.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SocError::DuplicateRegion(_)
                | SocError::RegionOverlap { .. }
                | SocError::InvalidRegion { .. }
                | SocError::UnknownResource(_)
                | SocError::ResourceConflict { .. }
                | SocError::DuplicatePort(_)
                | SocError::DuplicateDomain(_)
                | SocError::UndeclaredCrossing { .. }
                | SocError::UnprotectedFalsePath { .. }
                | SocError::UnknownDomain(_)
                | SocError::BufferUndersized { .. }
                | SocError::DuplicateClient(_)
                | SocError::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = SocError::RegionOverlap {
            name: "encoder".into(),
            base: 0x5000_0000,
            size: 0x2000,
            other: "main_ram".into(),
        };
        let text = e.to_string();
        assert!(text.contains("encoder"));
        assert!(text.contains("0x50000000"));
        assert!(text.contains("main_ram"));

        let e = SocError::BufferUndersized {
            client: "hdmi_in0".into(),
            depth: 4,
            period: 1,
            latency: 80,
        };
        assert!(e.to_string().contains("80"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: SocError = io_err.into();
        assert!(matches!(e, SocError::Connection(_)));
        assert!(!e.is_configuration());
    }

    #[test]
    fn configuration_errors_are_classified() {
        assert!(SocError::DuplicatePort(8000).is_configuration());
        assert!(SocError::DuplicateRegion("csr".into()).is_configuration());
        assert!(!SocError::ChannelClosed.is_configuration());
    }
}
