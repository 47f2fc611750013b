//! SoC runtime service.
//!
//! Builds the SoC from the configuration, starts it on the configured
//! ports and stands in for the board around it: a test-pattern source
//! feeds each capture input and the playback FIFOs are drained the way
//! the output PHYs would. Runs until the stop token fires or a domain
//! fails.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hdmi2eth_core::clock::CrossingReceiver;
use hdmi2eth_core::network::BulkPortStats;
use hdmi2eth_core::stream::ReaderIndicators;
use hdmi2eth_core::{CaptureBuffer, Crossbar, FrameGeometry, RunningSoc, Soc, VideoLine};

use crate::config::SocConfig;

/// Frame rate of the built-in test-pattern source.
pub const PATTERN_FPS: u64 = 30;

/// How often the status summary is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

// ── SocService ───────────────────────────────────────────────────

pub struct SocService {
    config: SocConfig,
    shutdown: CancellationToken,
}

impl SocService {
    pub fn new(config: SocConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the service when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Build, start and run the SoC until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let params = self.config.to_params();
        let geometry = params.geometry;
        let soc = Soc::build(params)?;
        info!("address map fingerprint {}", soc.map().fingerprint());

        let mut running = soc.start(self.shutdown.clone()).await?;
        let mut board = JoinSet::new();

        for input in capture_inputs(&running) {
            board.spawn(pattern_source(input, geometry, self.shutdown.clone()));
        }
        for (k, output) in running.take_playback_outputs().into_iter().enumerate() {
            board.spawn(drain_output(k, output, self.shutdown.clone()));
        }

        let status = tokio::spawn(log_status(
            StatusSource::capture(&running),
            self.shutdown.clone(),
        ));

        let result = running.wait().await;
        self.shutdown.cancel();
        board.join_all().await;
        settle("status", status).await;
        info!("SoC service stopped");
        Ok(result?)
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

// ── Board stand-ins ──────────────────────────────────────────────

/// Push one test-pattern frame per tick into a capture input.
async fn pattern_source(
    input: Arc<CaptureBuffer<VideoLine>>,
    geometry: FrameGeometry,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(1000 / PATTERN_FPS));
    let mut frame = 0u64;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        for line in 0..geometry.lines_per_frame {
            input.push(VideoLine::pattern(geometry, frame, line));
        }
        frame += 1;
    }
    debug!(
        "{}: pattern source stopped after {frame} frames, {} lines dropped",
        input.name(),
        input.drop_count()
    );
}

/// Consume a playback line FIFO.
async fn drain_output(
    head: usize,
    mut output: CrossingReceiver<VideoLine>,
    shutdown: CancellationToken,
) {
    let mut frames = 0u64;
    loop {
        let line = tokio::select! {
            line = output.recv() => line,
            _ = shutdown.cancelled() => break,
        };
        match line {
            Some(line) if line.line == 0 => frames += 1,
            Some(_) => {}
            None => break,
        }
    }
    debug!("hdmi_out{head}: {frames} frames scanned out");
}

/// Wait for a helper task, logging a panic or cancellation.
async fn settle(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!("{name} task aborted: {e}");
    }
}

// ── Status ───────────────────────────────────────────────────────

/// Shared handles the status logger reads from.
struct StatusSource {
    inputs: Vec<Arc<CaptureBuffer<VideoLine>>>,
    crossbar: Crossbar,
    reader: Arc<ReaderIndicators>,
    bulk: Arc<BulkPortStats>,
}

impl StatusSource {
    fn capture(running: &RunningSoc) -> Self {
        Self {
            inputs: capture_inputs(running),
            crossbar: running.crossbar().clone(),
            reader: Arc::clone(running.reader_indicators()),
            bulk: Arc::clone(running.bulk_stats()),
        }
    }
}

fn capture_inputs(running: &RunningSoc) -> Vec<Arc<CaptureBuffer<VideoLine>>> {
    (0..)
        .map_while(|k| running.capture_input(k).cloned())
        .collect()
}

async fn log_status(source: StatusSource, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(STATUS_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let reader = source.reader.snapshot();
        let (datagrams, errors) = (source.bulk.datagrams(), source.bulk.errors());
        info!(
            "encoder: {} frames (valid={}, ready={}), stream: {datagrams} datagrams",
            reader.frames, reader.valid, reader.ready
        );
        if errors > 0 {
            warn!("stream: {errors} send errors");
        }
        for input in &source.inputs {
            debug!(
                "{}: {} accepted, {} dropped",
                input.name(),
                input.accepted(),
                input.drop_count()
            );
        }
        for (client, stats) in source.crossbar.snapshot() {
            debug!(
                "{client}: {} grants, {} bytes, longest wait {}",
                stats.grants, stats.bytes, stats.longest_wait
            );
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
