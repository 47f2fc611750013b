//! Encoder reader: pulls completed frames out of shared memory and hands
//! them to the compressor.
//!
//! The reader mirrors its output handshake in two level indicators, `valid`
//! (a frame is held and offered downstream) and `ready` (downstream can
//! take one). They are exposed as a [`ReaderStatus`] snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use futures::future;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::arbiter::ArbiterPort;
use crate::clock::{CrossingReceiver, CrossingSender};
use crate::error::Result;
use crate::stream::capture::{FrameGeometry, FrameReady};

/// An uncompressed frame copied out of memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub source: usize,
    pub number: u64,
    pub data: Bytes,
}

/// Live handshake levels of the reader's output.
#[derive(Debug, Default)]
pub struct ReaderIndicators {
    valid: AtomicBool,
    ready: AtomicBool,
    frames: AtomicU64,
}

/// Point-in-time copy of [`ReaderIndicators`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReaderStatus {
    pub valid: bool,
    pub ready: bool,
    pub frames: u64,
}

impl ReaderIndicators {
    pub fn snapshot(&self) -> ReaderStatus {
        ReaderStatus {
            valid: self.valid.load(Ordering::Relaxed),
            ready: self.ready.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
        }
    }
}

/// One capture input as the reader sees it: frame announcements coming in
/// and fetched slots going back.
pub struct ReaderInput {
    pub frames: CrossingReceiver<FrameReady>,
    pub release: CrossingSender<u32>,
}

/// DMA reader feeding the compressor.
///
/// Serves every capture input it is given, rotating between inputs that
/// have frames waiting.
pub struct EncoderReader {
    port: ArbiterPort,
    geometry: FrameGeometry,
    inputs: Vec<ReaderInput>,
    output: mpsc::Sender<RawFrame>,
    indicators: Arc<ReaderIndicators>,
}

impl EncoderReader {
    pub fn new(
        port: ArbiterPort,
        geometry: FrameGeometry,
        inputs: Vec<ReaderInput>,
        output: mpsc::Sender<RawFrame>,
    ) -> Self {
        Self {
            port,
            geometry,
            inputs,
            output,
            indicators: Arc::new(ReaderIndicators::default()),
        }
    }

    pub fn indicators(&self) -> Arc<ReaderIndicators> {
        Arc::clone(&self.indicators)
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.indicators.ready.store(true, Ordering::Relaxed);
        loop {
            let (ready, release) = tokio::select! {
                ready = next_ready(&mut self.inputs) => match ready {
                    Some(ready) => ready,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let frame = self.fetch(&ready).await?;
            tokio::select! {
                sent = release.send(ready.slot) => {
                    if sent.is_err() {
                        debug!("input {} stopped taking slots back", ready.source);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
            self.indicators.valid.store(true, Ordering::Relaxed);
            self.indicators
                .ready
                .store(self.output.capacity() > 0, Ordering::Relaxed);

            tokio::select! {
                sent = self.output.send(frame) => sent?,
                _ = shutdown.cancelled() => break,
            }
            self.indicators.frames.fetch_add(1, Ordering::Relaxed);
            self.indicators.valid.store(false, Ordering::Relaxed);
            self.indicators.ready.store(true, Ordering::Relaxed);
        }
        debug!("encoder reader stopped");
        Ok(())
    }

    /// Copy one frame out of memory, one grant per line.
    async fn fetch(&mut self, ready: &FrameReady) -> Result<RawFrame> {
        let line_bytes = self.geometry.line_bytes as usize;
        let mut data = BytesMut::zeroed(ready.len as usize);
        for (i, chunk) in data.chunks_mut(line_bytes).enumerate() {
            let grant = self.port.acquire().await;
            grant.read(ready.address + (i * line_bytes) as u32, chunk)?;
        }
        trace!("fetched frame {} of input {}", ready.frame, ready.source);
        Ok(RawFrame {
            source: ready.source,
            number: ready.frame,
            data: data.freeze(),
        })
    }
}

/// Next announced frame from any input, with the way back for its slot;
/// `None` once all are closed.
async fn next_ready(inputs: &mut Vec<ReaderInput>) -> Option<(FrameReady, CrossingSender<u32>)> {
    while !inputs.is_empty() {
        let (ready, index, _) =
            future::select_all(inputs.iter_mut().map(|i| Box::pin(i.frames.recv()))).await;
        match ready {
            Some(ready) => {
                let release = inputs[index].release.clone();
                inputs.rotate_left(index + 1);
                return Some((ready, release));
            }
            None => {
                inputs.remove(index);
            }
        }
    }
    None
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::arbiter::{CrossbarBuilder, Direction};
    use crate::clock::{ClockSource, CrossingKind, TopologyBuilder};

    #[tokio::test]
    async fn reads_frame_and_reports_status() {
        let geometry = FrameGeometry {
            line_bytes: 8,
            lines_per_frame: 2,
        };
        let mut xb = CrossbarBuilder::new(256, 1);
        let writer = xb.add_client("hdmi_in0", Direction::Write, None).unwrap();
        let reader = xb.add_client("encoder_reader", Direction::Read, None).unwrap();
        let xbar = xb.build().unwrap();

        let mut w = xbar.take_port(writer).unwrap();
        let grant = w.acquire().await;
        grant.write(0x20, &(0u8..16).collect::<Vec<_>>()).unwrap();
        drop(grant);

        let mut tb = TopologyBuilder::new();
        let pix = tb
            .domain("pix_in0", ClockSource::External { pin: "hdmi_in0".into() })
            .unwrap();
        let sys = tb
            .domain("sys", ClockSource::Oscillator { freq_hz: 100_000_000 })
            .unwrap();
        tb.crossing("frames0", pix, sys, CrossingKind::AsyncFifo { depth: 1 })
            .unwrap();
        tb.crossing("slots0", sys, pix, CrossingKind::AsyncFifo { depth: 4 })
            .unwrap();
        let topo = tb.build().unwrap();
        let (tx, frames) = topo.channel::<FrameReady>("frames0").unwrap();
        let (release, mut released) = topo.channel::<u32>("slots0").unwrap();

        // Capacity one and never drained after the first frame.
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let port = xbar.take_port(reader).unwrap();
        let input = ReaderInput { frames, release };
        let reader = EncoderReader::new(port, geometry, vec![input], out_tx);
        let indicators = reader.indicators();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reader.run(shutdown.clone()));

        let ready = FrameReady {
            source: 0,
            frame: 5,
            slot: 1,
            address: 0x20,
            len: 16,
        };
        tx.send(ready).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.number, 5);
        assert_eq!(&frame.data[..], &(0u8..16).collect::<Vec<_>>()[..]);
        assert_eq!(released.recv().await, Some(1));

        // Fill the output, then offer one more frame: valid with no ready.
        tx.send(FrameReady { frame: 6, ..ready }).await.unwrap();
        tx.send(FrameReady { frame: 7, ..ready }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = indicators.snapshot();
        assert!(status.valid);
        assert!(!status.ready);

        // The held frame is already copied out, so its slot is back.
        assert_eq!(released.try_recv(), Some(1));
        assert_eq!(released.try_recv(), Some(1));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
