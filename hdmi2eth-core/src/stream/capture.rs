//! Capture DMA: video lines from a capture buffer into shared memory.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::arbiter::ArbiterPort;
use crate::clock::{CrossingReceiver, CrossingSender};
use crate::error::{Result, SocError};
use crate::stream::buffer::CaptureBuffer;

// ── Geometry ─────────────────────────────────────────────────────

/// Size of one video frame in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub line_bytes: u32,
    pub lines_per_frame: u32,
}

impl FrameGeometry {
    pub fn frame_bytes(&self) -> u32 {
        self.line_bytes * self.lines_per_frame
    }
}

impl Default for FrameGeometry {
    /// 1280x720, two bytes per pixel.
    fn default() -> Self {
        Self {
            line_bytes: 2560,
            lines_per_frame: 720,
        }
    }
}

/// A ring of frame slots in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    pub base: u32,
    pub slots: u32,
    pub geometry: FrameGeometry,
}

impl Framebuffer {
    pub fn new(base: u32, slots: u32, geometry: FrameGeometry) -> Result<Self> {
        if slots == 0 || geometry.line_bytes == 0 || geometry.lines_per_frame == 0 {
            return Err(SocError::InvalidConfig(
                "framebuffer needs at least one slot of non-empty frames".into(),
            ));
        }
        let end = base as u64 + slots as u64 * geometry.frame_bytes() as u64;
        if end > u32::MAX as u64 {
            return Err(SocError::InvalidConfig(format!(
                "framebuffer at {base:#x} runs past the address space"
            )));
        }
        Ok(Self {
            base,
            slots,
            geometry,
        })
    }

    /// Bytes occupied by every slot.
    pub fn size(&self) -> u32 {
        self.slots * self.geometry.frame_bytes()
    }

    /// Address of the first byte of `slot`.
    pub fn slot_address(&self, slot: u32) -> u32 {
        self.base + (slot % self.slots) * self.geometry.frame_bytes()
    }

    pub fn line_address(&self, slot: u32, line: u32) -> u32 {
        self.slot_address(slot) + line * self.geometry.line_bytes
    }
}

// ── Samples ──────────────────────────────────────────────────────

/// One line of pixels as delivered by a capture front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoLine {
    pub frame: u64,
    pub line: u32,
    pub data: Bytes,
}

impl VideoLine {
    /// Deterministic test-pattern line: diagonal ramp shifted per frame.
    pub fn pattern(geometry: FrameGeometry, frame: u64, line: u32) -> Self {
        let mut data = BytesMut::with_capacity(geometry.line_bytes as usize);
        for x in 0..geometry.line_bytes {
            data.extend_from_slice(&[(x as u64 + line as u64 + frame) as u8]);
        }
        Self {
            frame,
            line,
            data: data.freeze(),
        }
    }
}

/// A complete frame sitting in shared memory.
///
/// The slot stays with the reader until it hands `slot` back over the
/// release crossing; capture never writes a slot it has announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReady {
    /// Index of the capture input that produced it.
    pub source: usize,
    pub frame: u64,
    pub slot: u32,
    pub address: u32,
    pub len: u32,
}

// ── CaptureClient ────────────────────────────────────────────────

/// DMA writer of one video input.
///
/// Owns the framebuffer slots that are not out with the reader. A frame
/// is written into a free slot; announcing it hands the slot over, and
/// the reader returns it once the frame is copied out.
pub struct CaptureClient {
    source: usize,
    port: ArbiterPort,
    input: Arc<CaptureBuffer<VideoLine>>,
    framebuffer: Framebuffer,
    ready: CrossingSender<FrameReady>,
    released: CrossingReceiver<u32>,
    free: Vec<u32>,
    /// Frame being written and the slot it is going into.
    current: Option<(u64, u32)>,
    lines_written: u64,
}

impl CaptureClient {
    pub fn new(
        source: usize,
        port: ArbiterPort,
        input: Arc<CaptureBuffer<VideoLine>>,
        framebuffer: Framebuffer,
        ready: CrossingSender<FrameReady>,
        released: CrossingReceiver<u32>,
    ) -> Self {
        Self {
            source,
            port,
            input,
            free: (0..framebuffer.slots).rev().collect(),
            framebuffer,
            ready,
            released,
            current: None,
            lines_written: 0,
        }
    }

    /// Drain the capture buffer into memory until `shutdown` fires.
    ///
    /// Starting a frame with every slot out, or announcing one, waits for
    /// the reader; meanwhile the capture buffer keeps filling and applies
    /// its overflow policy.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let geometry = self.framebuffer.geometry;
        loop {
            let line = tokio::select! {
                line = self.input.pop() => line,
                _ = shutdown.cancelled() => break,
            };
            if !self.fits(&line) {
                debug!(
                    "{}: skipping malformed line {} of frame {}",
                    self.port.client().name,
                    line.line,
                    line.frame
                );
                continue;
            }

            let slot = match self.current {
                Some((frame, slot)) if frame == line.frame => slot,
                Some((frame, slot)) => {
                    // Never announced, so the slot is still ours.
                    trace!("frame {frame} abandoned incomplete");
                    slot
                }
                None => match self.free_slot(&shutdown).await {
                    Some(slot) => slot,
                    None => break,
                },
            };
            self.current = Some((line.frame, slot));
            self.store(slot, &line).await?;

            if line.line + 1 == geometry.lines_per_frame {
                self.current = None;
                let ready = FrameReady {
                    source: self.source,
                    frame: line.frame,
                    slot,
                    address: self.framebuffer.slot_address(slot),
                    len: geometry.frame_bytes(),
                };
                trace!("frame {} complete at {:#x}", line.frame, ready.address);
                tokio::select! {
                    sent = self.ready.send(ready) => sent?,
                    _ = shutdown.cancelled() => break,
                }
            }
        }
        debug!(
            "{}: capture stopped after {} lines",
            self.port.client().name,
            self.lines_written
        );
        Ok(())
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    fn fits(&self, line: &VideoLine) -> bool {
        let geometry = self.framebuffer.geometry;
        line.line < geometry.lines_per_frame && line.data.len() == geometry.line_bytes as usize
    }

    /// A slot nobody reads from, waiting for the reader if all are out.
    /// `None` once stopped or the reader is gone.
    async fn free_slot(&mut self, shutdown: &CancellationToken) -> Option<u32> {
        if let Some(slot) = self.free.pop() {
            return Some(slot);
        }
        tokio::select! {
            slot = self.released.recv() => slot,
            _ = shutdown.cancelled() => None,
        }
    }

    async fn store(&mut self, slot: u32, line: &VideoLine) -> Result<()> {
        let address = self.framebuffer.line_address(slot, line.line);
        let grant = self.port.acquire().await;
        grant.write(address, &line.data)?;
        drop(grant);
        self.lines_written += 1;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::arbiter::{CrossbarBuilder, Direction};
    use crate::clock::{ClockSource, CrossingKind, TopologyBuilder};
    use crate::stream::buffer::OverflowPolicy;

    const GEOMETRY: FrameGeometry = FrameGeometry {
        line_bytes: 16,
        lines_per_frame: 4,
    };

    #[test]
    fn framebuffer_slots_wrap() {
        let fb = Framebuffer::new(0x100, 2, GEOMETRY).unwrap();
        assert_eq!(fb.size(), 128);
        assert_eq!(fb.slot_address(0), 0x100);
        assert_eq!(fb.slot_address(1), 0x140);
        assert_eq!(fb.slot_address(2), 0x100);
        assert_eq!(fb.line_address(1, 3), 0x170);
        assert!(Framebuffer::new(0, 0, GEOMETRY).is_err());
        assert!(Framebuffer::new(u32::MAX - 10, 1, GEOMETRY).is_err());
    }

    #[test]
    fn pattern_lines_have_geometry_length() {
        let line = VideoLine::pattern(GEOMETRY, 3, 1);
        assert_eq!(line.data.len(), 16);
        assert_eq!(line.data[0], 4);
    }

    struct Rig {
        input: Arc<CaptureBuffer<VideoLine>>,
        frames: CrossingReceiver<FrameReady>,
        release: CrossingSender<u32>,
        reader: ArbiterPort,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    /// One capture client on a two-slot framebuffer at address 0.
    fn rig() -> Rig {
        let mut xb = CrossbarBuilder::new(1024, 1);
        let id = xb.add_client("hdmi_in0", Direction::Write, None).unwrap();
        let reader = xb.add_client("encoder_reader", Direction::Read, None).unwrap();
        let xbar = xb.build().unwrap();

        let mut tb = TopologyBuilder::new();
        let pix = tb
            .domain("pix_in0", ClockSource::External { pin: "hdmi_in0".into() })
            .unwrap();
        let sys = tb
            .domain("sys", ClockSource::Oscillator { freq_hz: 100_000_000 })
            .unwrap();
        tb.crossing("frames0", pix, sys, CrossingKind::AsyncFifo { depth: 4 })
            .unwrap();
        tb.crossing("slots0", sys, pix, CrossingKind::AsyncFifo { depth: 2 })
            .unwrap();
        let topo = tb.build().unwrap();
        let (tx, frames) = topo.channel::<FrameReady>("frames0").unwrap();
        let (release, released) = topo.channel::<u32>("slots0").unwrap();

        let input = Arc::new(
            CaptureBuffer::new("hdmi_in0", 32, OverflowPolicy::DropIncoming).unwrap(),
        );
        let fb = Framebuffer::new(0, 2, GEOMETRY).unwrap();
        let port = xbar.take_port(id).unwrap();
        let client = CaptureClient::new(0, port, Arc::clone(&input), fb, tx, released);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(client.run(shutdown.clone()));
        Rig {
            input,
            frames,
            release,
            reader: xbar.take_port(reader).unwrap(),
            shutdown,
            task,
        }
    }

    fn push_frame(input: &CaptureBuffer<VideoLine>, frame: u64) {
        for line in 0..GEOMETRY.lines_per_frame {
            assert!(input.push(VideoLine::pattern(GEOMETRY, frame, line)));
        }
    }

    async fn next(frames: &mut CrossingReceiver<FrameReady>) -> FrameReady {
        tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn read_line(port: &mut ArbiterPort, address: u32) -> Vec<u8> {
        let grant = port.acquire().await;
        let mut data = vec![0u8; GEOMETRY.line_bytes as usize];
        grant.read(address, &mut data).unwrap();
        data
    }

    #[tokio::test]
    async fn completed_frame_is_announced() {
        let mut rig = rig();
        push_frame(&rig.input, 0);

        let ready = next(&mut rig.frames).await;
        assert_eq!(ready.frame, 0);
        assert_eq!(ready.slot, 0);
        assert_eq!(ready.len, 64);
        let last = read_line(&mut rig.reader, 48).await;
        assert_eq!(&last[..], &VideoLine::pattern(GEOMETRY, 0, 3).data[..]);

        rig.shutdown.cancel();
        rig.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn announced_slots_wait_for_release() {
        let mut rig = rig();
        for frame in 0..3 {
            push_frame(&rig.input, frame);
        }

        let first = next(&mut rig.frames).await;
        let second = next(&mut rig.frames).await;
        assert_eq!((first.slot, second.slot), (0, 1));

        // Both slots are out: frame 2 waits after its first line and
        // frame 0 stays intact.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rig.frames.try_recv().is_none());
        assert_eq!(rig.input.len(), 3);
        let line = read_line(&mut rig.reader, first.address).await;
        assert_eq!(&line[..], &VideoLine::pattern(GEOMETRY, 0, 0).data[..]);

        rig.release.send(first.slot).await.unwrap();
        let third = next(&mut rig.frames).await;
        assert_eq!((third.frame, third.slot), (2, 0));

        rig.shutdown.cancel();
        rig.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn abandoned_frame_keeps_its_slot() {
        let mut rig = rig();
        // Two lines of frame 0, then frame 1 in full, then frame 2.
        for line in 0..2 {
            rig.input.push(VideoLine::pattern(GEOMETRY, 0, line));
        }
        push_frame(&rig.input, 1);
        push_frame(&rig.input, 2);

        let first = next(&mut rig.frames).await;
        let second = next(&mut rig.frames).await;
        assert_eq!((first.frame, first.slot), (1, 0));
        assert_eq!((second.frame, second.slot), (2, 1));

        rig.shutdown.cancel();
        rig.task.await.unwrap().unwrap();
    }
}
