//! Integration tests: a running SoC on localhost, driven through the
//! bridge over TCP and observed on the bulk port over UDP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hdmi2eth_core::bridge::Request;
use hdmi2eth_core::network::bulk_queue;
use hdmi2eth_core::stream::compress::decompress;
use hdmi2eth_core::stream::{
    CaptureClient, CompressorStage, EncoderReader, FrameAssembler, Framebuffer, RawFrame,
    ReaderInput, StreamSender, ZstdCompressor,
};
use hdmi2eth_core::{
    BridgeClient, BusFault, CaptureBuffer, ClockSource, CrossbarBuilder, CrossingKind, Direction,
    FrameGeometry, OverflowPolicy, RunningSoc, Soc, SocError, SocParams, Status, TopologyBuilder,
    VideoLine,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────

const GEOMETRY: FrameGeometry = FrameGeometry {
    line_bytes: 256,
    lines_per_frame: 16,
};

fn params(stream_destination: SocketAddr) -> SocParams {
    SocParams {
        geometry: GEOMETRY,
        capture_fifo_depth: 64,
        playback_fifo_depth: 16,
        max_grant_cycles: 4,
        memory_size: 0x10_0000,
        stream_destination,
        stream_mtu: 512,
        ..SocParams::default()
    }
}

/// Start a SoC on ephemeral ports, streaming to `receiver`.
async fn start(params: SocParams) -> RunningSoc {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bulk = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    Soc::build(params)
        .unwrap()
        .start_with(listener, bulk, CancellationToken::new())
        .unwrap()
}

async fn receiver() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

const SMALL: FrameGeometry = FrameGeometry {
    line_bytes: 64,
    lines_per_frame: 4,
};

/// One capture input and the encoder reader, wired as the SoC wires them
/// on a two-slot framebuffer.
fn capture_path(
    depth: usize,
    raw: mpsc::Sender<RawFrame>,
) -> (Arc<CaptureBuffer<VideoLine>>, CaptureClient, EncoderReader) {
    let mut xb = CrossbarBuilder::new(0x1000, 4);
    let writer = xb.add_client("hdmi_in0", Direction::Write, None).unwrap();
    let reader = xb.add_client("encoder_reader", Direction::Read, None).unwrap();
    let xbar = xb.build().unwrap();

    let mut tb = TopologyBuilder::new();
    let pix = tb
        .domain("pix_in0", ClockSource::External { pin: "hdmi_in0_clk".into() })
        .unwrap();
    let sys = tb
        .domain("sys", ClockSource::Oscillator { freq_hz: 100_000_000 })
        .unwrap();
    tb.crossing("hdmi_in0_frames", pix, sys, CrossingKind::Handshake)
        .unwrap();
    tb.crossing("hdmi_in0_slots", sys, pix, CrossingKind::AsyncFifo { depth: 2 })
        .unwrap();
    let topo = tb.build().unwrap();
    let (ready, frames) = topo.channel("hdmi_in0_frames").unwrap();
    let (release, released) = topo.channel("hdmi_in0_slots").unwrap();

    let policy = OverflowPolicy::DropIncoming;
    let input = Arc::new(CaptureBuffer::new("hdmi_in0", depth, policy).unwrap());
    let framebuffer = Framebuffer::new(0, 2, SMALL).unwrap();
    let capture = CaptureClient::new(
        0,
        xbar.take_port(writer).unwrap(),
        Arc::clone(&input),
        framebuffer,
        ready,
        released,
    );
    let reader = EncoderReader::new(
        xbar.take_port(reader).unwrap(),
        SMALL,
        vec![ReaderInput { frames, release }],
        raw,
    );
    (input, capture, reader)
}

fn push_frame(input: &CaptureBuffer<VideoLine>, frame: u64) {
    for line in 0..SMALL.lines_per_frame {
        input.push(VideoLine::pattern(SMALL, frame, line));
    }
}

// ── Bridge ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_bridge_write_then_read() {
    let (_rx, dest) = receiver().await;
    let soc = start(params(dest)).await;

    let mut client = BridgeClient::connect(soc.control_addr()).await.unwrap();
    client.write(0x5000_0010, 0xDEAD_BEEF).await.unwrap();
    assert_eq!(client.read(0x5000_0010).await.unwrap(), 0xDEAD_BEEF);

    // Same register through the shadow window.
    assert_eq!(client.read(0xD000_0010).await.unwrap(), 0xDEAD_BEEF);

    soc.stop().await.unwrap();
}

#[tokio::test]
async fn test_bridge_preserves_request_order() {
    let (_rx, dest) = receiver().await;
    let soc = start(params(dest)).await;
    let mut client = BridgeClient::connect(soc.control_addr()).await.unwrap();

    let requests = vec![
        Request::Write {
            tag: 1,
            address: 0x4000_0100,
            data: vec![1, 2, 3],
        },
        Request::Read {
            tag: 2,
            address: 0x4000_0100,
            count: 3,
        },
        Request::Write {
            tag: 3,
            address: 0x4000_0104,
            data: vec![20],
        },
        Request::Read {
            tag: 4,
            address: 0x4000_0100,
            count: 3,
        },
    ];
    let responses = client.execute_all(requests).await.unwrap();

    let tags: Vec<u16> = responses.iter().map(|r| r.tag).collect();
    assert_eq!(tags, vec![1, 2, 3, 4]);
    assert_eq!(responses[1].data, vec![1, 2, 3]);
    assert_eq!(responses[3].data, vec![1, 20, 3]);

    // Bridge traffic goes through the crossbar like any other client.
    let etherbone = soc.crossbar().client("etherbone").unwrap().id;
    assert_eq!(soc.crossbar().stats(etherbone).grants, 4);

    soc.stop().await.unwrap();
}

#[tokio::test]
async fn test_bridge_reports_faults_and_keeps_going() {
    let (_rx, dest) = receiver().await;
    let soc = start(params(dest)).await;
    let mut client = BridgeClient::connect(soc.control_addr()).await.unwrap();

    let err = client.read(0x1000_0000).await.unwrap_err();
    assert!(matches!(
        err,
        SocError::Bus(BusFault::Unmapped {
            address: 0x1000_0000
        })
    ));

    let responses = client
        .execute_all(vec![Request::Read {
            tag: 9,
            address: 0x5000_0002,
            count: 1,
        }])
        .await
        .unwrap();
    assert_eq!(responses[0].status, Status::Misaligned);
    assert_eq!(responses[0].fault_address, 0x5000_0002);

    // The connection survives faults.
    client.probe().await.unwrap();
    client.write(0x6000_0000, 7).await.unwrap();
    assert_eq!(client.read(0x6000_0000).await.unwrap(), 7);

    soc.stop().await.unwrap();
}

// ── Configuration ────────────────────────────────────────────────

#[test]
fn test_conflicting_ports_are_rejected() {
    let dest = "127.0.0.1:9".parse().unwrap();
    let err = Soc::build(SocParams {
        stream_port: 20000,
        ..params(dest)
    })
    .err()
    .unwrap();
    assert!(matches!(err, SocError::DuplicatePort(20000)));
    assert!(err.is_configuration());
}

#[test]
fn test_undersized_buffer_is_rejected() {
    let dest = "127.0.0.1:9".parse().unwrap();
    let err = Soc::build(SocParams {
        playback_fifo_depth: 1,
        line_period_cycles: 1,
        ..params(dest)
    })
    .err()
    .unwrap();
    match err {
        SocError::BufferUndersized { client, .. } => assert_eq!(client, "hdmi_out0"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_map_export_is_stable() {
    let dest = "127.0.0.1:9".parse().unwrap();
    let a = Soc::build(params(dest)).unwrap();
    let b = Soc::build(params(dest)).unwrap();
    assert_eq!(a.map().fingerprint(), b.map().fingerprint());
    let json = a.map().to_json().unwrap();
    assert!(json.contains("\"encoder\""));
    assert!(json.contains("20000"));
}

// ── Stream ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_captured_frame_reaches_the_bulk_port() {
    let (rx, dest) = receiver().await;
    let soc = start(params(dest)).await;

    let input = soc.capture_input(1).unwrap();
    for line in 0..GEOMETRY.lines_per_frame {
        assert!(input.push(VideoLine::pattern(GEOMETRY, 0, line)));
    }

    let mut asm = FrameAssembler::new();
    let mut buf = vec![0u8; 2048];
    let frame = loop {
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv_from(&mut buf))
            .await
            .expect("no stream datagram")
            .unwrap();
        if let Some(frame) = asm.push(&buf[..n]).unwrap() {
            break frame;
        }
    };
    assert_eq!(frame.source, 1);
    assert_eq!(frame.number, 0);
    assert_eq!(frame.raw_len, GEOMETRY.frame_bytes());

    let raw = decompress(&frame).unwrap();
    let expected: Vec<u8> = (0..GEOMETRY.lines_per_frame)
        .flat_map(|line| VideoLine::pattern(GEOMETRY, 0, line).data.to_vec())
        .collect();
    assert_eq!(raw, expected);
    assert_eq!(soc.bulk_stats().errors(), 0);
    assert_eq!(soc.reader_status().frames, 1);

    soc.stop().await.unwrap();
}

#[test]
fn test_full_capture_buffer_drops_lines() {
    let dest = "127.0.0.1:9".parse().unwrap();
    let soc = Soc::build(SocParams {
        overflow: OverflowPolicy::DropIncoming,
        ..params(dest)
    })
    .unwrap();

    // Not started: nothing drains the buffer.
    let input = soc.capture_input(0).unwrap();
    let depth = input.capacity();
    for i in 0..depth as u32 + 5 {
        input.push(VideoLine::pattern(GEOMETRY, 0, i % GEOMETRY.lines_per_frame));
    }
    assert_eq!(input.len(), depth);
    assert_eq!(input.drop_count(), 5);
    assert_eq!(input.accepted(), depth as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capture_never_overwrites_a_frame_being_read() {
    const FRAMES: u64 = 3000;
    let (raw_tx, mut raw_rx) = mpsc::channel(1);
    let (input, capture, reader) = capture_path(65536, raw_tx);
    let shutdown = CancellationToken::new();
    let capture = tokio::spawn(capture.run(shutdown.clone()));
    let reader = tokio::spawn(reader.run(shutdown.clone()));

    for frame in 0..FRAMES {
        push_frame(&input, frame);
    }

    let line_bytes = SMALL.line_bytes as usize;
    for expected in 0..FRAMES {
        let raw = tokio::time::timeout(Duration::from_secs(10), raw_rx.recv())
            .await
            .expect("capture path stalled")
            .unwrap();
        assert_eq!(raw.number, expected);
        for (l, line) in raw.data.chunks(line_bytes).enumerate() {
            let want = VideoLine::pattern(SMALL, raw.number, l as u32);
            assert_eq!(line, &want.data[..], "frame {} line {l} torn", raw.number);
        }
    }
    assert_eq!(input.drop_count(), 0);

    shutdown.cancel();
    capture.await.unwrap().unwrap();
    reader.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stalled_bulk_port_fills_the_capture_buffer() {
    let (raw_tx, raw_rx) = mpsc::channel(1);
    let (encoded_tx, encoded_rx) = mpsc::channel(1);
    let (input, capture, reader) = capture_path(16, raw_tx);

    // The driver is never run, so the bulk port fills after two datagrams.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (bulk, _driver, _stats) = bulk_queue(socket, 2, "127.0.0.1:9".parse().unwrap());

    let shutdown = CancellationToken::new();
    let compressor = CompressorStage::new(ZstdCompressor::new(1), raw_rx, encoded_tx);
    let mut tasks = JoinSet::new();
    tasks.spawn(capture.run(shutdown.clone()));
    tasks.spawn(reader.run(shutdown.clone()));
    tasks.spawn(compressor.run(shutdown.clone()));
    tasks.spawn(StreamSender::new(bulk).run(encoded_rx, shutdown.clone()));

    for frame in 0..200 {
        push_frame(&input, frame);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Every stage is stalled behind the bulk port, so loss happens here.
    assert!(input.is_full());
    let dropped = input.drop_count();
    assert!(dropped > 0);
    push_frame(&input, 200);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(input.is_full());
    assert_eq!(input.drop_count(), dropped + SMALL.lines_per_frame as u64);

    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        // Stages may see a closed neighbour on the way down.
        let _ = joined.unwrap();
    }
}

#[tokio::test]
async fn test_playback_scans_memory_written_over_the_bridge() {
    let (_rx, dest) = receiver().await;
    let mut soc = start(params(dest)).await;
    let mut outputs = soc.take_playback_outputs();
    assert_eq!(outputs.len(), 2);

    // hdmi_out0's framebuffer follows the four capture slots.
    let fb = soc.map().constant("hdmi_out0_framebuffer").unwrap() as u32;
    let mut client = BridgeClient::connect(soc.control_addr()).await.unwrap();
    client.write(fb, 0x0403_0201).await.unwrap();

    // Lines fetched before the write may still be queued.
    let line = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let line = outputs[0].recv().await.unwrap();
            if line.line == 0 && line.data[..4] == [1, 2, 3, 4] {
                break line;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(line.data.len(), GEOMETRY.line_bytes as usize);

    drop(outputs);
    soc.stop().await.unwrap();
}
