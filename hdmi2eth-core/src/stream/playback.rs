//! Playback DMA: scans a framebuffer out of shared memory, line by line.
//!
//! Both video outputs run from the same pixel clock. Each has its own
//! client on the crossbar and its own line FIFO; the consumer draining the
//! FIFOs lives in the shared output domain.

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::arbiter::ArbiterPort;
use crate::clock::CrossingSender;
use crate::error::Result;
use crate::stream::capture::{Framebuffer, VideoLine};

pub struct PlaybackClient {
    port: ArbiterPort,
    framebuffer: Framebuffer,
    output: CrossingSender<VideoLine>,
    frame: u64,
}

impl PlaybackClient {
    /// `output` is the client's line FIFO into the output domain; its depth
    /// should match the buffer declared on the crossbar.
    pub fn new(
        port: ArbiterPort,
        framebuffer: Framebuffer,
        output: CrossingSender<VideoLine>,
    ) -> Self {
        Self {
            port,
            framebuffer,
            output,
            frame: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.port.client().name
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let lines = self.framebuffer.geometry.lines_per_frame;
        'frames: loop {
            for line in 0..lines {
                let data = self.fetch(line).await?;
                let out = VideoLine {
                    frame: self.frame,
                    line,
                    data,
                };
                tokio::select! {
                    sent = self.output.send(out) => if sent.is_err() {
                        break 'frames;
                    },
                    _ = shutdown.cancelled() => break 'frames,
                }
            }
            self.frame += 1;
        }
        debug!("{}: playback stopped at frame {}", self.name(), self.frame);
        Ok(())
    }

    async fn fetch(&mut self, line: u32) -> Result<Bytes> {
        let mut data = BytesMut::zeroed(self.framebuffer.geometry.line_bytes as usize);
        // Playback always shows slot zero.
        let address = self.framebuffer.line_address(0, line);
        let grant = self.port.acquire().await;
        grant.read(address, &mut data)?;
        Ok(data.freeze())
    }
}

// ── Tests ────────────────────────────────────────────────────────
