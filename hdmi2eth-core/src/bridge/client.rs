//! Host side of the bridge.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::trace;

use crate::bridge::BridgeFlags;
use crate::bridge::codec::BridgeClientCodec;
use crate::bridge::wire::{Request, Response};
use crate::error::{Result, SocError};

/// A connection to a bridge.
///
/// Requests carry tags assigned from a wrapping counter; every response
/// is checked against the tag of the request it answers.
pub struct BridgeClient<S = TcpStream> {
    framed: Framed<S, BridgeClientCodec>,
    next_tag: u16,
}

impl BridgeClient<TcpStream> {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> BridgeClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, BridgeClientCodec),
            next_tag: 0,
        }
    }

    fn tag(&mut self) -> u16 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    pub async fn read(&mut self, address: u32) -> Result<u32> {
        let words = self.read_burst(address, 1).await?;
        Ok(words[0])
    }

    /// Read `count` consecutive words starting at `address`.
    pub async fn read_burst(&mut self, address: u32, count: u8) -> Result<Vec<u32>> {
        let tag = self.tag();
        let resp = self
            .round_trip(Request::Read {
                tag,
                address,
                count,
            })
            .await?;
        let data = resp.into_result()?;
        if data.len() != count as usize {
            return Err(SocError::ProtocolViolation("read returned wrong word count"));
        }
        Ok(data)
    }

    pub async fn write(&mut self, address: u32, value: u32) -> Result<()> {
        self.write_burst(address, &[value]).await
    }

    pub async fn write_burst(&mut self, address: u32, data: &[u32]) -> Result<()> {
        let tag = self.tag();
        let resp = self
            .round_trip(Request::Write {
                tag,
                address,
                data: data.to_vec(),
            })
            .await?;
        resp.into_result()?;
        Ok(())
    }

    /// Check that the peer is a bridge. Touches no bus state.
    pub async fn probe(&mut self) -> Result<()> {
        let tag = self.tag();
        let resp = self.round_trip(Request::Probe { tag }).await?;
        if !resp.flags.contains(BridgeFlags::PROBE_REPLY) {
            return Err(SocError::ProtocolViolation("probe answered without PROBE_REPLY"));
        }
        Ok(())
    }

    /// Send every request before reading any response, then collect the
    /// responses in order. Faults are returned as responses, not errors.
    pub async fn execute_all(&mut self, requests: Vec<Request>) -> Result<Vec<Response>> {
        let tags: Vec<u16> = requests.iter().map(Request::tag).collect();
        for request in requests {
            self.framed.feed(request).await?;
        }
        SinkExt::<Request>::flush(&mut self.framed).await?;

        let mut responses = Vec::with_capacity(tags.len());
        for tag in tags {
            responses.push(self.receive(tag).await?);
        }
        Ok(responses)
    }

    async fn round_trip(&mut self, request: Request) -> Result<Response> {
        let tag = request.tag();
        trace!("bridge request {tag}: {request:?}");
        self.framed.send(request).await?;
        self.receive(tag).await
    }

    async fn receive(&mut self, tag: u16) -> Result<Response> {
        let resp = self
            .framed
            .next()
            .await
            .ok_or(SocError::ConnectionClosed)??;
        if resp.tag != tag {
            return Err(SocError::ProtocolViolation("response tag does not match request"));
        }
        Ok(resp)
    }
}

// ── Tests ────────────────────────────────────────────────────────
