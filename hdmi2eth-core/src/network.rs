//! Network ports over the single physical link.
//!
//! The network stack itself is an external collaborator; here it is the
//! host's socket layer. This module only binds the two fixed ports:
//!
//! | Port          | Protocol | Consumer            |
//! |---------------|----------|---------------------|
//! | control 20000 | TCP      | remote bus bridge   |
//! | bulk 8000     | UDP      | encoded video sink  |
//!
//! The bulk port owns an outbound queue of `buffer_depth` datagrams. When
//! the queue is full, [`BulkPortSender::send`] waits, which is how network
//! backpressure enters the stream path.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, SocError};

/// Well-known port of the remote bus bridge.
pub const CONTROL_PORT: u16 = 20000;
/// Well-known port of the bulk video stream.
pub const STREAM_PORT: u16 = 8000;
/// Outbound datagram queue depth of the bulk port.
pub const STREAM_BUFFER_DEPTH: usize = 8;

// ── NetworkPort ──────────────────────────────────────────────────

/// Transport protocol of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A fixed `(protocol, number, depth)` endpoint bound to one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPort {
    pub name: String,
    pub protocol: Protocol,
    pub number: u16,
    pub buffer_depth: usize,
}

impl fmt::Display for NetworkPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.name, self.protocol, self.number)
    }
}

// ── MacAddress ───────────────────────────────────────────────────

/// 48-bit station address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Build from the low 48 bits of `value`, most significant octet first.
    pub fn from_u64(value: u64) -> Self {
        let b = value.to_be_bytes();
        Self([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = SocError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| SocError::InvalidConfig(format!("short MAC address: {s}")))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| SocError::InvalidConfig(format!("bad MAC octet {part:?} in {s}")))?;
        }
        if parts.next().is_some() {
            return Err(SocError::InvalidConfig(format!("long MAC address: {s}")));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ── NetworkIdentity ──────────────────────────────────────────────

/// Physical identity of the station on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
}

impl Default for NetworkIdentity {
    fn default() -> Self {
        Self {
            mac: MacAddress::from_u64(0x10e2_d500_0000),
            ip: Ipv4Addr::new(192, 168, 1, 42),
        }
    }
}

// ── Control port ─────────────────────────────────────────────────

/// Bind the TCP listener for the control port on `bind_ip`.
pub async fn bind_control(bind_ip: Ipv4Addr, port: &NetworkPort) -> Result<TcpListener> {
    if port.protocol != Protocol::Tcp {
        return Err(SocError::InvalidConfig(format!(
            "control port {port} must be tcp"
        )));
    }
    let addr = SocketAddr::V4(SocketAddrV4::new(bind_ip, port.number));
    Ok(TcpListener::bind(addr).await?)
}

// ── Bulk port ────────────────────────────────────────────────────

/// Counters of the bulk port's transmit side.
#[derive(Debug, Default)]
pub struct BulkPortStats {
    datagrams: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl BulkPortStats {
    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Producer face of the bulk port's outbound queue.
#[derive(Debug, Clone)]
pub struct BulkPortSender {
    tx: mpsc::Sender<Bytes>,
}

impl BulkPortSender {
    /// Queue one datagram, waiting while the outbound buffer is full.
    pub async fn send(&self, datagram: Bytes) -> Result<()> {
        self.tx.send(datagram).await?;
        Ok(())
    }

    /// Free slots in the outbound buffer right now.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer face of the bulk port: drains the queue onto the socket.
pub struct BulkPortDriver {
    rx: mpsc::Receiver<Bytes>,
    socket: UdpSocket,
    destination: SocketAddr,
    stats: Arc<BulkPortStats>,
}

impl BulkPortDriver {
    /// Transmit until every sender is dropped.
    ///
    /// Send failures are counted and skipped: the bulk stream has no
    /// retransmission.
    pub async fn run(mut self) {
        while let Some(datagram) = self.rx.recv().await {
            match self.socket.send_to(&datagram, self.destination).await {
                Ok(n) => {
                    self.stats.datagrams.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    let errors = self.stats.errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors.is_power_of_two() {
                        warn!(
                            "bulk port send to {} failed ({errors} total): {e}",
                            self.destination
                        );
                    }
                }
            }
        }
        debug!("bulk port driver stopped");
    }
}

/// Bind the bulk UDP port and build its outbound queue.
pub async fn bind_bulk(
    bind_ip: Ipv4Addr,
    port: &NetworkPort,
    destination: SocketAddr,
) -> Result<(BulkPortSender, BulkPortDriver, Arc<BulkPortStats>)> {
    if port.protocol != Protocol::Udp {
        return Err(SocError::InvalidConfig(format!("bulk port {port} must be udp")));
    }
    let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(bind_ip, port.number))).await?;
    Ok(bulk_queue(socket, port.buffer_depth, destination))
}

/// Wrap an already-bound socket in a bounded outbound queue.
pub fn bulk_queue(
    socket: UdpSocket,
    depth: usize,
    destination: SocketAddr,
) -> (BulkPortSender, BulkPortDriver, Arc<BulkPortStats>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let stats = Arc::new(BulkPortStats::default());
    let driver = BulkPortDriver {
        rx,
        socket,
        destination,
        stats: Arc::clone(&stats),
    };
    (BulkPortSender { tx }, driver, stats)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_from_u64_and_display() {
        let mac = MacAddress::from_u64(0x10e2_d500_0000);
        assert_eq!(mac.to_string(), "10:e2:d5:00:00:00");
        assert_eq!("10:e2:d5:00:00:00".parse::<MacAddress>().unwrap(), mac);
    }

    #[test]
    fn mac_parse_errors() {
        assert!("10:e2:d5".parse::<MacAddress>().is_err());
        assert!("10:e2:d5:00:00:00:01".parse::<MacAddress>().is_err());
        assert!("zz:e2:d5:00:00:00".parse::<MacAddress>().is_err());
    }

    #[test]
    fn default_identity() {
        let id = NetworkIdentity::default();
        assert_eq!(id.ip, Ipv4Addr::new(192, 168, 1, 42));
        assert_eq!(id.mac.octets()[0], 0x10);
    }

    #[tokio::test]
    async fn bulk_queue_delivers_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();

        let (tx, driver, stats) = bulk_queue(sender_sock, STREAM_BUFFER_DEPTH, dest);
        let driver = tokio::spawn(driver.run());

        tx.send(Bytes::from_static(b"frame-0")).await.unwrap();
        tx.send(Bytes::from_static(b"frame-1")).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"frame-0");
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"frame-1");

        drop(tx);
        driver.await.unwrap();
        assert_eq!(stats.datagrams(), 2);
        assert_eq!(stats.bytes(), 14);
    }

    #[tokio::test]
    async fn bulk_queue_is_bounded() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = sock.local_addr().unwrap();
        // Driver never started: the queue fills at its depth.
        let (tx, _driver, _stats) = bulk_queue(sock, 2, dest);
        tx.send(Bytes::from_static(b"a")).await.unwrap();
        tx.send(Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(tx.capacity(), 0);
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), tx.send(Bytes::new())).await;
        assert!(blocked.is_err());
    }
}
