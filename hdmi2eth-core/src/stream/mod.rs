//! Bulk video stream path.
//!
//! ```text
//! capture front end ─push─▶ CaptureBuffer ─▶ CaptureClient ──DMA──▶ memory
//!                                               │ FrameReady ▲ slot release
//!                                               ▼ (crossing) │ (crossing)
//!   memory ──DMA──▶ EncoderReader ─▶ Compressor ─▶ StreamSender ─▶ bulk port
//! ```
//!
//! Every hop after the capture buffer is a bounded channel, so a full bulk
//! port stalls the sender, then the compressor, the reader and finally the
//! capture DMA. The capture buffer is the one place where data is lost.
//!
//! A framebuffer slot belongs to either the capture DMA or the reader. The
//! reader hands a slot back only after copying its frame out, so a frame
//! is never overwritten while it is being read.
//!
//! | Module       | Purpose                                          |
//! |--------------|--------------------------------------------------|
//! | [`buffer`]   | Capture FIFO with overflow policy and drop count |
//! | [`capture`]  | Frame geometry, framebuffers, capture DMA        |
//! | [`reader`]   | Encoder reader and its status indicators         |
//! | [`compress`] | `Compressor` seam and the zstd stand-in          |
//! | [`sender`]   | Datagram fragmentation and reassembly            |
//! | [`playback`] | Framebuffer scan-out for the video outputs       |

pub mod buffer;
pub mod capture;
pub mod compress;
pub mod playback;
pub mod reader;
pub mod sender;

pub use buffer::{CaptureBuffer, OverflowPolicy};
pub use capture::{CaptureClient, FrameGeometry, FrameReady, Framebuffer, VideoLine};
pub use compress::{Compressor, CompressorStage, EncodedFrame, ZstdCompressor};
pub use playback::PlaybackClient;
pub use reader::{EncoderReader, RawFrame, ReaderIndicators, ReaderInput, ReaderStatus};
pub use sender::{ChunkHeader, FrameAssembler, StreamSender};
