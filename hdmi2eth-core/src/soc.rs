//! SoC composition.
//!
//! [`Soc::build`] turns [`SocParams`] into the complete, verified fabric:
//! the resource map, the clock topology, the memory crossbar with every
//! client and the bridge's bus. Any conflict is a configuration error and
//! nothing is started. [`Soc::start`] then binds the network ports and
//! spawns one task group per domain; the whole SoC stops together when the
//! shutdown token fires.
//!
//! ## Default layout
//! ```text
//! main_ram   0x40000000  shadow 0xc0000000  crossbar memory, bridge master
//! encoder    0x50000000  shadow 0xd0000000  encoder register window
//! csr        0x60000000  shadow 0xe0000000  CSR banks, 0x800 bytes each
//! ```

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info};

use crate::arbiter::{ClientBuffer, ClientId, Crossbar, CrossbarBuilder, Direction};
use crate::bridge::{ArbitratedMemory, BridgeServer, Bus, RegisterFile};
use crate::clock::{
    ClockSource, ClockTopology, CrossingKind, CrossingReceiver, Route, TopologyBuilder,
};
use crate::error::{Result, SocError};
use crate::map::{ResourceMap, ResourceMapBuilder, SHADOW_OFFSET};
use crate::network::{
    self, BulkPortDriver, BulkPortSender, BulkPortStats, CONTROL_PORT, NetworkIdentity, Protocol,
    STREAM_BUFFER_DEPTH, STREAM_PORT,
};
use crate::stream::{
    CaptureBuffer, CaptureClient, CompressorStage, EncoderReader, FrameGeometry, Framebuffer,
    OverflowPolicy, PlaybackClient, ReaderIndicators, ReaderInput, ReaderStatus, StreamSender,
    VideoLine, ZstdCompressor,
};

pub const MAIN_RAM_BASE: u32 = 0x4000_0000;
pub const ENCODER_BASE: u32 = 0x5000_0000;
pub const ENCODER_SIZE: u32 = 0x2000;
pub const CSR_BASE: u32 = 0x6000_0000;
/// Bytes of address space per CSR bank.
pub const CSR_BANK_SIZE: u32 = 0x800;
const CSR_BANKS: u32 = 32;

/// Capture inputs on the board.
pub const VIDEO_INPUTS: usize = 2;
/// Playback heads on the board.
pub const VIDEO_OUTPUTS: usize = 2;

const INPUT_NAMES: [&str; VIDEO_INPUTS] = ["hdmi_in0", "hdmi_in1"];
const OUTPUT_NAMES: [&str; VIDEO_OUTPUTS] = ["hdmi_out0", "hdmi_out1"];
/// Frame slots per capture framebuffer.
const CAPTURE_SLOTS: u32 = 2;

// ── SocParams ────────────────────────────────────────────────────

/// Everything that shapes a SoC instance.
#[derive(Debug, Clone)]
pub struct SocParams {
    pub identity: NetworkIdentity,
    /// Local address the ports are bound on.
    pub bind_ip: Ipv4Addr,
    pub control_port: u16,
    pub stream_port: u16,
    pub stream_buffer_depth: usize,
    pub stream_destination: SocketAddr,
    pub stream_mtu: usize,
    pub geometry: FrameGeometry,
    /// Lines each capture buffer holds.
    pub capture_fifo_depth: usize,
    pub overflow: OverflowPolicy,
    /// Lines each playback FIFO holds.
    pub playback_fifo_depth: usize,
    /// System cycles one video line lasts.
    pub line_period_cycles: u64,
    pub playback: bool,
    pub max_grant_cycles: u64,
    pub memory_size: u32,
    pub compression_level: i32,
}

impl Default for SocParams {
    fn default() -> Self {
        Self {
            identity: NetworkIdentity::default(),
            bind_ip: Ipv4Addr::UNSPECIFIED,
            control_port: CONTROL_PORT,
            stream_port: STREAM_PORT,
            stream_buffer_depth: STREAM_BUFFER_DEPTH,
            stream_destination: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(192, 168, 1, 15),
                STREAM_PORT,
            )),
            stream_mtu: crate::stream::sender::DEFAULT_MTU,
            geometry: FrameGeometry::default(),
            capture_fifo_depth: 1024,
            overflow: OverflowPolicy::DropIncoming,
            playback_fifo_depth: 64,
            line_period_cycles: 16,
            playback: true,
            max_grant_cycles: 64,
            memory_size: 0x0100_0000,
            compression_level: crate::stream::compress::DEFAULT_LEVEL,
        }
    }
}

impl SocParams {
    /// Shared-memory offset of capture input `k`'s framebuffer.
    fn capture_framebuffer(&self, k: usize) -> Result<Framebuffer> {
        let base = k as u32 * CAPTURE_SLOTS * self.geometry.frame_bytes();
        Framebuffer::new(base, CAPTURE_SLOTS, self.geometry)
    }

    /// Shared-memory offset of playback head `k`'s framebuffer.
    fn playback_framebuffer(&self, k: usize) -> Result<Framebuffer> {
        let captures = VIDEO_INPUTS as u32 * CAPTURE_SLOTS * self.geometry.frame_bytes();
        Framebuffer::new(captures + k as u32 * self.geometry.frame_bytes(), 1, self.geometry)
    }

    fn memory_needed(&self) -> u64 {
        let frames = VIDEO_INPUTS as u64 * CAPTURE_SLOTS as u64
            + if self.playback { VIDEO_OUTPUTS as u64 } else { 0 };
        frames * self.geometry.frame_bytes() as u64
    }
}

// ── Soc ──────────────────────────────────────────────────────────

struct Clients {
    inputs: Vec<ClientId>,
    reader: ClientId,
    outputs: Vec<ClientId>,
}

/// A built, verified SoC that has not been started.
pub struct Soc {
    params: SocParams,
    map: Arc<ResourceMap>,
    topology: Arc<ClockTopology>,
    crossbar: Crossbar,
    bus: Arc<Bus>,
    clients: Clients,
    captures: Vec<Arc<CaptureBuffer<VideoLine>>>,
}

impl Soc {
    pub fn build(params: SocParams) -> Result<Self> {
        if params.memory_needed() > params.memory_size as u64 {
            return Err(SocError::InvalidConfig(format!(
                "framebuffers need {} bytes, memory has {}",
                params.memory_needed(),
                params.memory_size
            )));
        }

        let map = Arc::new(build_map(&params)?);
        let topology = Arc::new(build_topology(&params)?);

        // Crossbar clients.
        let mut xb = CrossbarBuilder::new(params.memory_size as usize, params.max_grant_cycles);
        let capture_buffer = ClientBuffer {
            depth: params.capture_fifo_depth,
            period_cycles: params.line_period_cycles,
        };
        let playback_buffer = ClientBuffer {
            depth: params.playback_fifo_depth,
            period_cycles: params.line_period_cycles,
        };
        let inputs = INPUT_NAMES
            .iter()
            .map(|name| xb.add_client(name, Direction::Write, Some(capture_buffer)))
            .collect::<Result<Vec<_>>>()?;
        let reader = xb.add_client("encoder_reader", Direction::Read, None)?;
        let outputs = if params.playback {
            OUTPUT_NAMES
                .iter()
                .map(|name| xb.add_client(name, Direction::Read, Some(playback_buffer)))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        let etherbone = xb.add_client("etherbone", Direction::ReadWrite, None)?;
        let crossbar = xb.build()?;

        // Bridge bus.
        let mut bus = Bus::new(Arc::clone(&map));
        bus.attach(
            "main_ram",
            Arc::new(ArbitratedMemory::new(crossbar.take_port(etherbone)?, 0)),
        )?;
        bus.attach("encoder", Arc::new(RegisterFile::new(ENCODER_SIZE)))?;
        bus.attach("csr", Arc::new(RegisterFile::new(CSR_BANKS * CSR_BANK_SIZE)))?;

        let captures = INPUT_NAMES
            .iter()
            .map(|name| {
                CaptureBuffer::new(name, params.capture_fifo_depth, params.overflow).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "soc built: {} regions, {} clients, map {}",
            map.regions().len(),
            crossbar.clients().len(),
            &map.fingerprint()[..16]
        );

        Ok(Self {
            params,
            map,
            topology,
            crossbar,
            bus: Arc::new(bus),
            clients: Clients {
                inputs,
                reader,
                outputs,
            },
            captures,
        })
    }

    pub fn params(&self) -> &SocParams {
        &self.params
    }

    pub fn map(&self) -> &Arc<ResourceMap> {
        &self.map
    }

    pub fn topology(&self) -> &ClockTopology {
        &self.topology
    }

    pub fn crossbar(&self) -> &Crossbar {
        &self.crossbar
    }

    /// Capture buffer of input `k`, fed by the capture front end.
    pub fn capture_input(&self, k: usize) -> Option<&Arc<CaptureBuffer<VideoLine>>> {
        self.captures.get(k)
    }

    /// Bind the ports from the parameters and start every domain.
    pub async fn start(self, shutdown: CancellationToken) -> Result<RunningSoc> {
        let control_port = self.map.port("etherbone")?;
        let listener = network::bind_control(self.params.bind_ip, control_port).await?;
        let bulk = network::bind_bulk(
            self.params.bind_ip,
            self.map.port("stream")?,
            self.params.stream_destination,
        )
        .await?;
        self.launch(listener, bulk, shutdown)
    }

    /// Start every domain on already-bound sockets.
    pub fn start_with(
        self,
        listener: TcpListener,
        bulk: UdpSocket,
        shutdown: CancellationToken,
    ) -> Result<RunningSoc> {
        let depth = self.map.port("stream")?.buffer_depth;
        let queue = network::bulk_queue(bulk, depth, self.params.stream_destination);
        self.launch(listener, queue, shutdown)
    }

    fn launch(
        self,
        listener: TcpListener,
        (bulk_tx, bulk_driver, bulk_stats): (BulkPortSender, BulkPortDriver, Arc<BulkPortStats>),
        shutdown: CancellationToken,
    ) -> Result<RunningSoc> {
        let control_addr = listener.local_addr()?;
        let topo = &self.topology;
        let sys = topo.find("sys")?;
        let eth_tx = topo.find("eth_tx")?;
        let mut tasks = JoinSet::new();

        // pix_in*: capture DMA.
        let mut inputs = Vec::with_capacity(VIDEO_INPUTS);
        for (k, &name) in INPUT_NAMES.iter().enumerate() {
            let (ready, frames) = topo.channel(&format!("{name}_frames"))?;
            let (release, released) = topo.channel(&format!("{name}_slots"))?;
            let span = topo.span(ready.domain());
            let client = CaptureClient::new(
                k,
                self.crossbar.take_port(self.clients.inputs[k])?,
                Arc::clone(&self.captures[k]),
                self.params.capture_framebuffer(k)?,
                ready,
                released,
            );
            spawn(&mut tasks, name, span, client.run(shutdown.clone()));
            inputs.push(ReaderInput { frames, release });
        }

        // sys: reader -> compressor -> sender.
        let (raw_tx, raw_rx) = mpsc::channel(1);
        let (encoded_tx, encoded_rx) = mpsc::channel(1);
        let reader = EncoderReader::new(
            self.crossbar.take_port(self.clients.reader)?,
            self.params.geometry,
            inputs,
            raw_tx,
        );
        let indicators = reader.indicators();
        spawn(&mut tasks, "encoder_reader", topo.span(sys), reader.run(shutdown.clone()));

        let compressor = CompressorStage::new(
            ZstdCompressor::new(self.params.compression_level),
            raw_rx,
            encoded_tx,
        );
        spawn(&mut tasks, "encoder", topo.span(sys), compressor.run(shutdown.clone()));

        let sender = StreamSender::new(bulk_tx).with_mtu(self.params.stream_mtu)?;
        spawn(&mut tasks, "stream", topo.span(sys), sender.run(encoded_rx, shutdown.clone()));

        // eth_tx: bulk port driver. Stops once the sender is gone.
        spawn(&mut tasks, "stream_tx", topo.span(eth_tx), async move {
            bulk_driver.run().await;
            Ok(())
        });

        // sys -> pix_out: playback DMA.
        let mut playback = Vec::with_capacity(self.clients.outputs.len());
        for (k, &id) in self.clients.outputs.iter().enumerate() {
            let name = OUTPUT_NAMES[k];
            let (tx, rx) = topo.channel(&format!("{name}_lines"))?;
            let span = topo.span(tx.domain());
            let client = PlaybackClient::new(
                self.crossbar.take_port(id)?,
                self.params.playback_framebuffer(k)?,
                tx,
            );
            spawn(&mut tasks, name, span, client.run(shutdown.clone()));
            playback.push(rx);
        }

        // eth_rx/sys: bridge.
        let server = BridgeServer::new(Arc::clone(&self.bus));
        let token = shutdown.clone();
        spawn(&mut tasks, "etherbone", topo.span(sys), async move {
            server.serve(listener, token).await
        });

        info!(
            "soc started: bridge on {control_addr}, stream to {}",
            self.params.stream_destination
        );
        Ok(RunningSoc {
            tasks,
            shutdown,
            control_addr,
            bulk_stats,
            indicators,
            captures: self.captures,
            playback,
            crossbar: self.crossbar,
            map: self.map,
        })
    }
}

type DomainTask = (&'static str, Result<()>);

fn spawn<F>(tasks: &mut JoinSet<DomainTask>, name: &'static str, span: Span, task: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tasks.spawn(async move { (name, task.await) }.instrument(span));
}

// ── RunningSoc ───────────────────────────────────────────────────

/// Handle to a started SoC.
pub struct RunningSoc {
    tasks: JoinSet<DomainTask>,
    shutdown: CancellationToken,
    control_addr: SocketAddr,
    bulk_stats: Arc<BulkPortStats>,
    indicators: Arc<ReaderIndicators>,
    captures: Vec<Arc<CaptureBuffer<VideoLine>>>,
    playback: Vec<CrossingReceiver<VideoLine>>,
    crossbar: Crossbar,
    map: Arc<ResourceMap>,
}

impl RunningSoc {
    /// Where the bridge accepts connections.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn capture_input(&self, k: usize) -> Option<&Arc<CaptureBuffer<VideoLine>>> {
        self.captures.get(k)
    }

    /// Line FIFOs of the playback heads, for the output domain to drain.
    /// FIFOs left here are dropped by [`RunningSoc::wait`].
    pub fn take_playback_outputs(&mut self) -> Vec<CrossingReceiver<VideoLine>> {
        std::mem::take(&mut self.playback)
    }

    pub fn reader_status(&self) -> ReaderStatus {
        self.indicators.snapshot()
    }

    pub fn reader_indicators(&self) -> &Arc<ReaderIndicators> {
        &self.indicators
    }

    pub fn bulk_stats(&self) -> &Arc<BulkPortStats> {
        &self.bulk_stats
    }

    pub fn crossbar(&self) -> &Crossbar {
        &self.crossbar
    }

    pub fn map(&self) -> &Arc<ResourceMap> {
        &self.map
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for every domain to finish. The first failure stops the rest
    /// and is returned.
    pub async fn wait(mut self) -> Result<()> {
        drop(std::mem::take(&mut self.playback));
        let mut first = None;
        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => None,
                Ok((name, Err(e))) => {
                    error!("{name} failed: {e}");
                    Some(e)
                }
                Err(e) => {
                    error!("domain task aborted: {e}");
                    Some(SocError::from(e))
                }
            };
            if let Some(e) = failure {
                self.shutdown.cancel();
                first.get_or_insert(e);
            }
        }
        info!("soc stopped");
        first.map_or(Ok(()), Err)
    }

    /// Fire the shutdown token and wait for every domain.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.wait().await
    }
}

// ── Resource map ─────────────────────────────────────────────────

fn build_map(params: &SocParams) -> Result<ResourceMap> {
    let mut b = ResourceMapBuilder::new();

    b.register(
        "main_ram",
        MAIN_RAM_BASE,
        params.memory_size,
        Some(MAIN_RAM_BASE + SHADOW_OFFSET),
    )?;
    b.register(
        "encoder",
        ENCODER_BASE,
        ENCODER_SIZE,
        Some(ENCODER_BASE + SHADOW_OFFSET),
    )?;
    b.register(
        "csr",
        CSR_BASE,
        CSR_BANKS * CSR_BANK_SIZE,
        Some(CSR_BASE + SHADOW_OFFSET),
    )?;

    for csr in ["ethphy", "ethcore"] {
        b.add_csr(csr)?;
    }
    if params.playback {
        for name in OUTPUT_NAMES {
            b.add_csr(name)?;
        }
    }
    for name in INPUT_NAMES {
        b.add_csr(name)?;
        b.add_csr(&format!("{name}_edid_mem"))?;
    }
    b.add_csr("encoder_reader")?;
    b.add_csr("encoder")?;

    b.add_interrupt("hdmi_in0", 3)?;
    b.add_interrupt("hdmi_in1", 4)?;

    b.add_port("etherbone", Protocol::Tcp, params.control_port, 1)?;
    b.add_port(
        "stream",
        Protocol::Udp,
        params.stream_port,
        params.stream_buffer_depth,
    )?;

    b.add_constant("mac_address", mac_constant(&params.identity))?;
    b.add_constant("local_ip", u32::from(params.identity.ip) as i64)?;
    b.add_constant("line_bytes", params.geometry.line_bytes as i64)?;
    b.add_constant("lines_per_frame", params.geometry.lines_per_frame as i64)?;
    b.add_constant("capture_fifo_depth", params.capture_fifo_depth as i64)?;
    b.add_constant("csr_bank_size", CSR_BANK_SIZE as i64)?;
    for k in 0..VIDEO_INPUTS {
        let fb = params.capture_framebuffer(k)?;
        let address = (MAIN_RAM_BASE + fb.base) as i64;
        b.add_constant(&format!("{}_framebuffer", INPUT_NAMES[k]), address)?;
    }
    if params.playback {
        for k in 0..VIDEO_OUTPUTS {
            let fb = params.playback_framebuffer(k)?;
            let address = (MAIN_RAM_BASE + fb.base) as i64;
            b.add_constant(&format!("{}_framebuffer", OUTPUT_NAMES[k]), address)?;
        }
    }

    Ok(b.build())
}

fn mac_constant(identity: &NetworkIdentity) -> i64 {
    identity
        .mac
        .octets()
        .iter()
        .fold(0i64, |acc, &b| (acc << 8) | b as i64)
}

// ── Clock topology ───────────────────────────────────────────────

fn build_topology(params: &SocParams) -> Result<ClockTopology> {
    let mut t = TopologyBuilder::new();

    let sys = t.domain("sys", ClockSource::Oscillator { freq_hz: 100_000_000 })?;
    for consumer in ["crossbar", "encoder_reader", "encoder", "etherbone"] {
        t.attach(sys, consumer)?;
    }

    let eth_rx = t.domain("eth_rx", ClockSource::External { pin: "eth_clocks_rx".into() })?;
    let eth_tx = t.domain("eth_tx", ClockSource::External { pin: "eth_clocks_tx".into() })?;
    t.attach(eth_rx, "ethphy_rx")?;
    t.attach(eth_tx, "ethphy_tx")?;

    let link = CrossingKind::AsyncFifo { depth: 64 };
    t.crossing("eth_rx_fifo", eth_rx, sys, link)?;
    t.crossing("eth_tx_fifo", sys, eth_tx, link)?;
    t.crossing(
        "stream_tx",
        sys,
        eth_tx,
        CrossingKind::AsyncFifo {
            depth: params.stream_buffer_depth,
        },
    )?;
    t.path("etherbone_request", eth_rx, sys, Route::Via("eth_rx_fifo".into()))?;
    t.path("etherbone_response", sys, eth_tx, Route::Via("eth_tx_fifo".into()))?;
    t.path("stream", sys, eth_tx, Route::Via("stream_tx".into()))?;
    t.false_path(sys, eth_rx)?;
    t.false_path(sys, eth_tx)?;

    for name in INPUT_NAMES {
        let pix = t.domain(
            &format!("pix_{}", name.trim_start_matches("hdmi_")),
            ClockSource::External {
                pin: format!("{name}_clk"),
            },
        )?;
        t.attach(pix, name)?;
        t.crossing(&format!("{name}_frames"), pix, sys, CrossingKind::Handshake)?;
        t.path(
            &format!("{name}_frame_ready"),
            pix,
            sys,
            Route::Via(format!("{name}_frames")),
        )?;
        let slots = CrossingKind::AsyncFifo {
            depth: CAPTURE_SLOTS as usize,
        };
        t.crossing(&format!("{name}_slots"), sys, pix, slots)?;
        t.path(
            &format!("{name}_slot_release"),
            sys,
            pix,
            Route::Via(format!("{name}_slots")),
        )?;
        t.path(&format!("{name}_edid"), sys, pix, Route::QuasiStatic)?;
        t.false_path(sys, pix)?;
    }

    if params.playback {
        let pix_out = t.domain(
            "pix_out",
            ClockSource::Pll {
                parent: "sys".into(),
                freq_hz: 74_250_000,
            },
        )?;
        for name in OUTPUT_NAMES {
            t.attach(pix_out, name)?;
            let crossing = format!("{name}_lines");
            t.crossing(
                &crossing,
                sys,
                pix_out,
                CrossingKind::AsyncFifo {
                    depth: params.playback_fifo_depth,
                },
            )?;
            t.path(&format!("{name}_pixels"), sys, pix_out, Route::Via(crossing))?;
            t.path(&format!("{name}_timing"), sys, pix_out, Route::QuasiStatic)?;
        }
        t.false_path(sys, pix_out)?;
    }

    t.build()
}

// ── Tests ────────────────────────────────────────────────────────
