//! Bridge records.
//!
//! All fields are big-endian.
//!
//! **Request** (12 byte header + write data):
//! ```text
//! magic:    u16  0x4E6F
//! version:  u8   1
//! flags:    u8   PROBE = 0x01
//! opcode:   u8   1 = READ, 2 = WRITE
//! burst:    u8   words to transfer, 1..=255
//! tag:      u16  echoed in the response
//! address:  u32  word aligned
//! data:     [u32; burst]  WRITE only
//! ```
//!
//! **Response** (12 byte header + read data):
//! ```text
//! magic:    u16  0x4E6F
//! version:  u8   1
//! flags:    u8   PROBE_REPLY = 0x02
//! status:   u8   see `Status`
//! count:    u8   data words following
//! tag:      u16
//! fault:    u32  faulting address, 0 on success
//! data:     [u32; count]
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::bridge::BusFault;
use crate::error::SocError;

pub const MAGIC: u16 = 0x4E6F;
pub const VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 12;
/// Largest burst a single record can carry.
pub const MAX_BURST: usize = u8::MAX as usize;
/// Largest record on the wire.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + 4 * MAX_BURST;

bitflags! {
    /// Per-record flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BridgeFlags: u8 {
        /// Discover the bridge without touching the bus.
        const PROBE = 0x01;
        /// Answer to a probe.
        const PROBE_REPLY = 0x02;
    }
}

// ── Opcode ───────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Read = 0x1,
    Write = 0x2,
}

impl TryFrom<u8> for Opcode {
    type Error = SocError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(Opcode::Read),
            0x2 => Ok(Opcode::Write),
            _ => Err(SocError::UnknownVariant {
                type_name: "Opcode",
                value: value as u64,
            }),
        }
    }
}

// ── Status ───────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    Unmapped = 1,
    Misaligned = 2,
    BurstOverrun = 3,
    TargetFault = 4,
    BadRequest = 5,
}

impl TryFrom<u8> for Status {
    type Error = SocError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Unmapped),
            2 => Ok(Status::Misaligned),
            3 => Ok(Status::BurstOverrun),
            4 => Ok(Status::TargetFault),
            5 => Ok(Status::BadRequest),
            _ => Err(SocError::UnknownVariant {
                type_name: "Status",
                value: value as u64,
            }),
        }
    }
}

// ── Request ──────────────────────────────────────────────────────

/// A decoded bridge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read { tag: u16, address: u32, count: u8 },
    Write { tag: u16, address: u32, data: Vec<u32> },
    Probe { tag: u16 },
    /// Well framed but not executable; answered with `BAD_REQUEST`.
    Invalid { tag: u16, reason: &'static str },
}

impl Request {
    pub fn tag(&self) -> u16 {
        match self {
            Request::Read { tag, .. }
            | Request::Write { tag, .. }
            | Request::Probe { tag }
            | Request::Invalid { tag, .. } => *tag,
        }
    }

    /// Number of data words following the header of a request whose
    /// header bytes are `header`.
    pub(crate) fn payload_words(header: &[u8]) -> usize {
        let flags = BridgeFlags::from_bits_truncate(header[3]);
        if header[4] == Opcode::Write as u8 && !flags.contains(BridgeFlags::PROBE) {
            header[5] as usize
        } else {
            0
        }
    }

    /// Parse one complete record (header already validated).
    pub(crate) fn parse(mut frame: &[u8]) -> Self {
        frame.advance(3);
        let flags = BridgeFlags::from_bits_truncate(frame.get_u8());
        let opcode = frame.get_u8();
        let burst = frame.get_u8();
        let tag = frame.get_u16();
        let address = frame.get_u32();

        if flags.contains(BridgeFlags::PROBE) {
            return Request::Probe { tag };
        }
        if burst == 0 {
            return Request::Invalid {
                tag,
                reason: "zero-length burst",
            };
        }
        match Opcode::try_from(opcode) {
            Ok(Opcode::Read) => Request::Read {
                tag,
                address,
                count: burst,
            },
            Ok(Opcode::Write) => Request::Write {
                tag,
                address,
                data: (0..burst).map(|_| frame.get_u32()).collect(),
            },
            Err(_) => Request::Invalid {
                tag,
                reason: "unknown opcode",
            },
        }
    }

    /// Append the wire form to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), SocError> {
        let empty: &[u32] = &[];
        let (flags, opcode, burst, tag, address, data) = match self {
            Request::Read {
                tag,
                address,
                count,
            } => (BridgeFlags::empty(), Opcode::Read as u8, *count, *tag, *address, empty),
            Request::Write { tag, address, data } => {
                let burst = u8::try_from(data.len())
                    .map_err(|_| SocError::ProtocolViolation("write burst exceeds 255 words"))?;
                (
                    BridgeFlags::empty(),
                    Opcode::Write as u8,
                    burst,
                    *tag,
                    *address,
                    data.as_slice(),
                )
            }
            Request::Probe { tag } => (BridgeFlags::PROBE, 0, 0, *tag, 0, empty),
            Request::Invalid { .. } => {
                return Err(SocError::ProtocolViolation("cannot encode an invalid request"));
            }
        };

        dst.reserve(HEADER_SIZE + 4 * data.len());
        dst.put_u16(MAGIC);
        dst.put_u8(VERSION);
        dst.put_u8(flags.bits());
        dst.put_u8(opcode);
        dst.put_u8(burst);
        dst.put_u16(tag);
        dst.put_u32(address);
        for &word in data {
            dst.put_u32(word);
        }
        Ok(())
    }
}

// ── Response ─────────────────────────────────────────────────────

/// A bridge response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub tag: u16,
    pub flags: BridgeFlags,
    pub status: Status,
    pub fault_address: u32,
    pub data: Vec<u32>,
}

impl Response {
    /// Successful read.
    pub fn data(tag: u16, data: Vec<u32>) -> Self {
        Self {
            tag,
            flags: BridgeFlags::empty(),
            status: Status::Ok,
            fault_address: 0,
            data,
        }
    }

    /// Successful write.
    pub fn ack(tag: u16) -> Self {
        Self::data(tag, Vec::new())
    }

    pub fn probe_reply(tag: u16) -> Self {
        Self {
            flags: BridgeFlags::PROBE_REPLY,
            ..Self::ack(tag)
        }
    }

    pub fn fault(tag: u16, fault: &BusFault) -> Self {
        Self {
            tag,
            flags: BridgeFlags::empty(),
            status: fault.status(),
            fault_address: fault.address(),
            data: Vec::new(),
        }
    }

    /// Data words on success, the fault otherwise.
    pub fn into_result(self) -> Result<Vec<u32>, BusFault> {
        let address = self.fault_address;
        match self.status {
            Status::Ok => Ok(self.data),
            Status::Unmapped => Err(BusFault::Unmapped { address }),
            Status::Misaligned => Err(BusFault::Misaligned { address }),
            Status::BurstOverrun => Err(BusFault::BurstOverrun { address, words: 0 }),
            Status::TargetFault => Err(BusFault::TargetFault { address }),
            Status::BadRequest => Err(BusFault::BadRequest("rejected by bridge")),
        }
    }

    pub(crate) fn payload_words(header: &[u8]) -> usize {
        header[5] as usize
    }

    /// Parse one complete record (header already validated).
    pub(crate) fn parse(mut frame: &[u8]) -> Result<Self, SocError> {
        frame.advance(3);
        let flags = BridgeFlags::from_bits_truncate(frame.get_u8());
        let status = Status::try_from(frame.get_u8())?;
        let count = frame.get_u8();
        let tag = frame.get_u16();
        let fault_address = frame.get_u32();
        let data = (0..count).map(|_| frame.get_u32()).collect();
        Ok(Self {
            tag,
            flags,
            status,
            fault_address,
            data,
        })
    }

    /// Append the wire form to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), SocError> {
        let count = u8::try_from(self.data.len())
            .map_err(|_| SocError::ProtocolViolation("response exceeds 255 words"))?;
        dst.reserve(HEADER_SIZE + 4 * self.data.len());
        dst.put_u16(MAGIC);
        dst.put_u8(VERSION);
        dst.put_u8(self.flags.bits());
        dst.put_u8(self.status as u8);
        dst.put_u8(count);
        dst.put_u16(self.tag);
        dst.put_u32(self.fault_address);
        for &word in &self.data {
            dst.put_u32(word);
        }
        Ok(())
    }
}

/// Check magic and version of a header.
pub(crate) fn check_header(header: &[u8]) -> Result<(), SocError> {
    let magic = u16::from_be_bytes([header[0], header[1]]);
    if magic != MAGIC {
        return Err(SocError::InvalidMagic(magic));
    }
    if header[2] != VERSION {
        return Err(SocError::UnsupportedVersion(header[2]));
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_layout() {
        let mut buf = BytesMut::new();
        Request::Write {
            tag: 7,
            address: 0x5000_0010,
            data: vec![0xDEAD_BEEF],
        }
        .encode(&mut buf)
        .unwrap();

        assert_eq!(
            &buf[..],
            &[
                0x4E, 0x6F, 0x01, 0x00, 0x02, 0x01, 0x00, 0x07, 0x50, 0x00, 0x00, 0x10, 0xDE,
                0xAD, 0xBE, 0xEF
            ]
        );
        assert_eq!(Request::payload_words(&buf[..HEADER_SIZE]), 1);
    }

    #[test]
    fn probe_and_invalid_requests() {
        let mut buf = BytesMut::new();
        Request::Probe { tag: 1 }.encode(&mut buf).unwrap();
        assert_eq!(Request::parse(&buf), Request::Probe { tag: 1 });

        // Unknown opcode 0x7 with a burst of one.
        let raw = [0x4E, 0x6F, 0x01, 0x00, 0x07, 0x01, 0x00, 0x02, 0, 0, 0, 0];
        assert!(matches!(
            Request::parse(&raw),
            Request::Invalid { tag: 2, .. }
        ));

        // Read of zero words.
        let raw = [0x4E, 0x6F, 0x01, 0x00, 0x01, 0x00, 0x00, 0x03, 0, 0, 0, 0];
        assert!(matches!(
            Request::parse(&raw),
            Request::Invalid { tag: 3, .. }
        ));

        assert!(Request::Invalid { tag: 0, reason: "x" }
            .encode(&mut BytesMut::new())
            .is_err());
    }

    #[test]
    fn fault_response_round_trip_keeps_address() {
        let fault = BusFault::Unmapped {
            address: 0x7000_0000,
        };
        let mut buf = BytesMut::new();
        Response::fault(9, &fault).encode(&mut buf).unwrap();
        let parsed = Response::parse(&buf).unwrap();
        assert_eq!(parsed.tag, 9);
        assert_eq!(parsed.status, Status::Unmapped);
        assert_eq!(parsed.into_result(), Err(fault));
    }

    #[test]
    fn header_checks() {
        assert!(check_header(&[0x4E, 0x6F, 0x01]).is_ok());
        assert!(matches!(
            check_header(&[0x12, 0x34, 0x01]),
            Err(SocError::InvalidMagic(0x1234))
        ));
        assert!(matches!(
            check_header(&[0x4E, 0x6F, 0x09]),
            Err(SocError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn oversized_write_is_refused() {
        let req = Request::Write {
            tag: 0,
            address: 0,
            data: vec![0; 256],
        };
        assert!(req.encode(&mut BytesMut::new()).is_err());
    }
}
