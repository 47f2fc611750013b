//! Bridge listener on the control port.
//!
//! Every accepted connection gets its own session task. A session executes
//! requests strictly in arrival order and answers each before reading the
//! next, so responses on a connection come back in request order.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::bridge::bus::Bus;
use crate::bridge::codec::BridgeCodec;
use crate::error::Result;

/// Serves the [`Bus`] to remote hosts.
#[derive(Clone)]
pub struct BridgeServer {
    bus: Arc<Bus>,
}

impl BridgeServer {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Accept connections until `shutdown` fires, then wait for the open
    /// sessions to wind down.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!("bridge listening on {local}");

        let mut sessions = JoinSet::new();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay on {peer}: {e}");
            }

            info!("host connected from {peer}");
            let bus = Arc::clone(&self.bus);
            let token = shutdown.child_token();
            sessions.spawn(
                async move {
                    match session(&bus, stream, &token).await {
                        Ok(served) => info!("session closed after {served} requests"),
                        Err(e) => warn!("session ended: {e}"),
                    }
                }
                .instrument(info_span!("bridge", %peer)),
            );

            while let Some(done) = sessions.try_join_next() {
                if let Err(e) = done {
                    warn!("bridge session task failed: {e}");
                }
            }
        }

        while sessions.join_next().await.is_some() {}
        info!("bridge on {local} stopped");
        Ok(())
    }
}

/// Run one bridge session over `stream` until the peer closes it, a
/// framing error occurs, or `shutdown` fires. Returns the number of
/// requests answered.
pub async fn session<S>(bus: &Bus, stream: S, shutdown: &CancellationToken) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, BridgeCodec);
    let mut served = 0;

    loop {
        let next = tokio::select! {
            next = framed.next() => next,
            _ = shutdown.cancelled() => break,
        };
        let Some(request) = next.transpose()? else {
            break;
        };
        let response = bus.execute(request).await;
        framed.send(response).await?;
        served += 1;
    }

    Ok(served)
}

// ── Tests ────────────────────────────────────────────────────────
