//! Stream sender: splits encoded frames into datagrams for the bulk port.
//!
//! Every datagram carries a chunk header followed by at most
//! `mtu - ChunkHeader::SIZE` payload bytes. There is no retransmission; a
//! receiver that misses a chunk discards the frame.
//!
//! ## Wire format
//!
//! **Chunk header** (20 bytes, little-endian):
//! ```text
//! source:        u8   capture input index
//! reserved:      u8
//! chunk_index:   u16
//! total_chunks:  u16
//! chunk_len:     u16  payload bytes following
//! frame_number:  u64
//! raw_len:       u32  frame size before compression
//! ```

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SocError};
use crate::network::BulkPortSender;
use crate::stream::compress::EncodedFrame;

/// Link MTU minus IP and UDP headers.
pub const DEFAULT_MTU: usize = 1400;

/// Incomplete frames kept by a [`FrameAssembler`] before the oldest is
/// abandoned.
const MAX_PENDING_FRAMES: usize = 8;

// ── ChunkHeader ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub source: u8,
    pub chunk_index: u16,
    pub total_chunks: u16,
    pub chunk_len: u16,
    pub frame_number: u64,
    pub raw_len: u32,
}

impl ChunkHeader {
    pub const SIZE: usize = 20;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.source);
        dst.put_u8(0);
        dst.put_u16_le(self.chunk_index);
        dst.put_u16_le(self.total_chunks);
        dst.put_u16_le(self.chunk_len);
        dst.put_u64_le(self.frame_number);
        dst.put_u32_le(self.raw_len);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(SocError::ProtocolViolation("stream chunk shorter than its header"));
        }
        let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        let mut number = [0u8; 8];
        number.copy_from_slice(&data[8..16]);
        Ok(Self {
            source: data[0],
            chunk_index: u16_at(2),
            total_chunks: u16_at(4),
            chunk_len: u16_at(6),
            frame_number: u64::from_le_bytes(number),
            raw_len: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
        })
    }
}

// ── StreamSender ─────────────────────────────────────────────────

pub struct StreamSender {
    port: BulkPortSender,
    mtu: usize,
    frames_sent: u64,
}

impl StreamSender {
    pub fn new(port: BulkPortSender) -> Self {
        Self {
            port,
            mtu: DEFAULT_MTU,
            frames_sent: 0,
        }
    }

    /// Override the datagram size. Must leave room for some payload.
    pub fn with_mtu(mut self, mtu: usize) -> Result<Self> {
        payload_capacity(mtu)?;
        self.mtu = mtu;
        Ok(self)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Split `frame` into datagrams and queue them on the bulk port.
    ///
    /// Waits whenever the port's buffer is full.
    pub async fn send_frame(&mut self, frame: &EncodedFrame) -> Result<()> {
        for datagram in fragment(frame, self.mtu)? {
            self.port.send(datagram).await?;
        }
        self.frames_sent += 1;
        Ok(())
    }

    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<EncodedFrame>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                frame = input.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            tokio::select! {
                sent = self.send_frame(&frame) => sent?,
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("stream sender stopped after {} frames", self.frames_sent);
        Ok(())
    }
}

/// Payload bytes a datagram of `mtu` bytes carries after its header.
fn payload_capacity(mtu: usize) -> Result<usize> {
    match mtu.checked_sub(ChunkHeader::SIZE) {
        Some(payload) if payload > 0 && payload <= u16::MAX as usize => Ok(payload),
        _ => Err(SocError::InvalidConfig(format!("unusable stream mtu {mtu}"))),
    }
}

/// Datagrams carrying `frame`, in chunk order.
pub fn fragment(frame: &EncodedFrame, mtu: usize) -> Result<Vec<Bytes>> {
    let payload_max = payload_capacity(mtu)?;
    let total = frame.data.len().div_ceil(payload_max).max(1);
    let total_chunks = u16::try_from(total)
        .map_err(|_| SocError::ProtocolViolation("frame needs more than 65535 chunks"))?;
    let source = u8::try_from(frame.source)
        .map_err(|_| SocError::ProtocolViolation("stream source index exceeds 255"))?;

    let mut datagrams = Vec::with_capacity(total);
    for index in 0..total {
        let start = index * payload_max;
        let end = (start + payload_max).min(frame.data.len());
        let chunk = &frame.data[start..end];
        let mut buf = BytesMut::with_capacity(ChunkHeader::SIZE + chunk.len());
        ChunkHeader {
            source,
            chunk_index: index as u16,
            total_chunks,
            chunk_len: chunk.len() as u16,
            frame_number: frame.number,
            raw_len: frame.raw_len,
        }
        .encode(&mut buf);
        buf.extend_from_slice(chunk);
        datagrams.push(buf.freeze());
    }
    Ok(datagrams)
}

// ── FrameAssembler ───────────────────────────────────────────────

struct Partial {
    header: ChunkHeader,
    chunks: Vec<Option<Bytes>>,
    received: usize,
}

/// Receiver-side reassembly of chunked frames.
#[derive(Default)]
pub struct FrameAssembler {
    pending: BTreeMap<(u64, u8), Partial>,
    abandoned: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames given up on because newer ones crowded them out.
    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }

    /// Feed one datagram; returns a frame once all its chunks are in.
    pub fn push(&mut self, datagram: &[u8]) -> Result<Option<EncodedFrame>> {
        let header = ChunkHeader::decode(datagram)?;
        let payload = &datagram[ChunkHeader::SIZE..];
        if payload.len() != header.chunk_len as usize
            || header.chunk_index >= header.total_chunks
        {
            return Err(SocError::ProtocolViolation("inconsistent stream chunk"));
        }

        let key = (header.frame_number, header.source);
        let partial = self.pending.entry(key).or_insert_with(|| Partial {
            header,
            chunks: vec![None; header.total_chunks as usize],
            received: 0,
        });
        if partial.header.total_chunks != header.total_chunks
            || partial.header.raw_len != header.raw_len
        {
            return Err(SocError::ProtocolViolation(
                "stream chunk disagrees with the rest of its frame",
            ));
        }
        let slot = &mut partial.chunks[header.chunk_index as usize];
        if slot.is_none() {
            *slot = Some(Bytes::copy_from_slice(payload));
            partial.received += 1;
        }

        if partial.received == partial.chunks.len() {
            let Some(done) = self.pending.remove(&key) else {
                return Ok(None);
            };
            let mut data = BytesMut::new();
            for chunk in done.chunks.into_iter().flatten() {
                data.extend_from_slice(&chunk);
            }
            return Ok(Some(EncodedFrame {
                source: done.header.source as usize,
                number: done.header.frame_number,
                raw_len: done.header.raw_len,
                data: data.freeze(),
            }));
        }

        while self.pending.len() > MAX_PENDING_FRAMES {
            self.pending.pop_first();
            self.abandoned += 1;
        }
        Ok(None)
    }
}

// ── Tests ────────────────────────────────────────────────────────
