//! Compressor seam.
//!
//! The video compression core is an external collaborator reached through
//! the [`Compressor`] trait. [`ZstdCompressor`] is the stand-in used when no
//! hardware encoder is attached.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, SocError};
use crate::stream::reader::RawFrame;

/// Default zstd level; favours speed.
pub const DEFAULT_LEVEL: i32 = 1;

/// A compressed frame ready for the stream sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub source: usize,
    pub number: u64,
    /// Size of the frame before compression.
    pub raw_len: u32,
    pub data: Bytes,
}

#[async_trait]
pub trait Compressor: Send {
    fn name(&self) -> &str;

    async fn compress(&mut self, frame: RawFrame) -> Result<EncodedFrame>;
}

// ── ZstdCompressor ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

#[async_trait]
impl Compressor for ZstdCompressor {
    fn name(&self) -> &str {
        "zstd"
    }

    async fn compress(&mut self, frame: RawFrame) -> Result<EncodedFrame> {
        let level = self.level;
        let raw = frame.data.clone();
        let data = tokio::task::spawn_blocking(move || zstd::bulk::compress(&raw, level))
            .await?
            .map_err(|e| SocError::Compressor(format!("zstd encode failed: {e}")))?;
        Ok(EncodedFrame {
            source: frame.source,
            number: frame.number,
            raw_len: frame.data.len() as u32,
            data: Bytes::from(data),
        })
    }
}

/// Undo [`ZstdCompressor`] on a received frame.
pub fn decompress(frame: &EncodedFrame) -> Result<Vec<u8>> {
    zstd::bulk::decompress(&frame.data, frame.raw_len as usize)
        .map_err(|e| SocError::Compressor(format!("zstd decode failed: {e}")))
}

// ── Stage ────────────────────────────────────────────────────────

/// Runs a compressor between the reader and the stream sender.
pub struct CompressorStage<C> {
    compressor: C,
    input: mpsc::Receiver<RawFrame>,
    output: mpsc::Sender<EncodedFrame>,
}

impl<C: Compressor> CompressorStage<C> {
    pub fn new(
        compressor: C,
        input: mpsc::Receiver<RawFrame>,
        output: mpsc::Sender<EncodedFrame>,
    ) -> Self {
        Self {
            compressor,
            input,
            output,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let raw = tokio::select! {
                raw = self.input.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            let encoded = self.compressor.compress(raw).await?;
            trace!(
                "{}: frame {} {} -> {} bytes",
                self.compressor.name(),
                encoded.number,
                encoded.raw_len,
                encoded.data.len()
            );
            tokio::select! {
                sent = self.output.send(encoded) => sent?,
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("{} compressor stopped", self.compressor.name());
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
