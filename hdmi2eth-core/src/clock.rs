//! Clock-domain topology.
//!
//! Every timing domain of the SoC (core logic, video input pixel clocks,
//! the shared video output pixel clock, network PHY rx/tx) is declared up
//! front, together with every primitive that carries data between two
//! domains and every signal path that crosses a boundary.
//!
//! [`TopologyBuilder::build`] verifies the declaration:
//!
//! - a path between distinct domains is routed through a declared crossing
//!   going the same way, or is whitelisted as quasi-static;
//! - a false-path exemption names a domain pair that a crossing connects.
//!
//! At runtime a domain is a group of tokio tasks running under the
//! domain's tracing span, and a crossing is a bounded channel obtained from
//! [`ClockTopology::channel`], which only hands out channels for declared
//! crossings.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Result, SocError};

// ── Identifiers ──────────────────────────────────────────────────

/// Index of a domain inside its topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DomainId(usize);

/// Reference a domain is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClockSource {
    /// Free-running on-board oscillator.
    Oscillator { freq_hz: u64 },
    /// PLL output derived from another domain's reference.
    Pll { parent: String, freq_hz: u64 },
    /// Clock recovered from an external pin (video link, PHY).
    External { pin: String },
}

/// A named timing domain and the clients clocked by it.
#[derive(Debug, Clone, Serialize)]
pub struct ClockDomain {
    pub id: DomainId,
    pub name: String,
    pub source: ClockSource,
    /// Clients sharing this domain. Two playback clients on one PLL
    /// appear here as two consumers of a single domain.
    pub consumers: Vec<String>,
}

/// Kind of primitive used to cross between domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrossingKind {
    /// Request/acknowledge handshake, one word in flight.
    Handshake,
    /// Multi-flop synchronizer for single-bit levels.
    Synchronizer { stages: u8 },
    /// Dual-clock FIFO of the given depth.
    AsyncFifo { depth: usize },
}

impl CrossingKind {
    /// Entries a software channel for this primitive may hold.
    pub fn depth(self) -> usize {
        match self {
            CrossingKind::Handshake | CrossingKind::Synchronizer { .. } => 1,
            CrossingKind::AsyncFifo { depth } => depth.max(1),
        }
    }
}

/// A declared domain-crossing primitive.
#[derive(Debug, Clone, Serialize)]
pub struct Crossing {
    pub name: String,
    pub from: DomainId,
    pub to: DomainId,
    pub kind: CrossingKind,
}

/// How a signal path gets from its source domain to its sink domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Plain wiring. Only legal inside one domain.
    Direct,
    /// Through the named crossing primitive.
    Via(String),
    /// Configuration value written once and held; excluded from timing.
    QuasiStatic,
}

#[derive(Debug, Clone)]
struct SignalPath {
    name: String,
    from: DomainId,
    to: DomainId,
    route: Route,
}

// ── TopologyBuilder ──────────────────────────────────────────────

/// Declarative builder for a [`ClockTopology`].
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    domains: Vec<ClockDomain>,
    crossings: Vec<Crossing>,
    paths: Vec<SignalPath>,
    false_paths: Vec<(DomainId, DomainId)>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a new domain.
    pub fn domain(&mut self, name: &str, source: ClockSource) -> Result<DomainId> {
        if self.domains.iter().any(|d| d.name == name) {
            return Err(SocError::DuplicateDomain(name.to_string()));
        }
        let id = DomainId(self.domains.len());
        self.domains.push(ClockDomain {
            id,
            name: name.to_string(),
            source,
            consumers: Vec::new(),
        });
        Ok(id)
    }

    /// Clock `consumer` from `domain`.
    pub fn attach(&mut self, domain: DomainId, consumer: &str) -> Result<&mut Self> {
        let d = self
            .domains
            .get_mut(domain.0)
            .ok_or(SocError::UnknownDomain(domain))?;
        d.consumers.push(consumer.to_string());
        Ok(self)
    }

    /// Declare a crossing primitive from `from` to `to`.
    pub fn crossing(
        &mut self,
        name: &str,
        from: DomainId,
        to: DomainId,
        kind: CrossingKind,
    ) -> Result<&mut Self> {
        self.check(from)?;
        self.check(to)?;
        if from == to {
            return Err(SocError::InvalidConfig(format!(
                "crossing {name} stays inside one domain"
            )));
        }
        if self.crossings.iter().any(|c| c.name == name) {
            return Err(SocError::InvalidConfig(format!("duplicate crossing {name}")));
        }
        self.crossings.push(Crossing {
            name: name.to_string(),
            from,
            to,
            kind,
        });
        Ok(self)
    }

    /// Declare a signal path.
    pub fn path(
        &mut self,
        name: &str,
        from: DomainId,
        to: DomainId,
        route: Route,
    ) -> Result<&mut Self> {
        self.check(from)?;
        self.check(to)?;
        self.paths.push(SignalPath {
            name: name.to_string(),
            from,
            to,
            route,
        });
        Ok(self)
    }

    /// Exclude `from -> to` from standard timing closure.
    pub fn false_path(&mut self, from: DomainId, to: DomainId) -> Result<&mut Self> {
        self.check(from)?;
        self.check(to)?;
        self.false_paths.push((from, to));
        Ok(self)
    }

    /// Verify every declaration and freeze the topology.
    pub fn build(self) -> Result<ClockTopology> {
        let topo = ClockTopology {
            domains: self.domains,
            crossings: self.crossings,
            false_paths: self.false_paths,
        };

        for path in &self.paths {
            if path.from == path.to {
                continue;
            }
            let covered = match &path.route {
                Route::Direct => false,
                Route::QuasiStatic => true,
                Route::Via(name) => topo
                    .crossings
                    .iter()
                    .any(|c| &c.name == name && c.from == path.from && c.to == path.to),
            };
            if !covered {
                return Err(SocError::UndeclaredCrossing {
                    signal: path.name.clone(),
                    from: topo.name_of(path.from).to_string(),
                    to: topo.name_of(path.to).to_string(),
                });
            }
        }

        for &(from, to) in &topo.false_paths {
            if !topo.connected(from, to) {
                return Err(SocError::UnprotectedFalsePath {
                    from: topo.name_of(from).to_string(),
                    to: topo.name_of(to).to_string(),
                });
            }
        }

        Ok(topo)
    }

    fn check(&self, id: DomainId) -> Result<()> {
        if id.0 < self.domains.len() {
            Ok(())
        } else {
            Err(SocError::UnknownDomain(id))
        }
    }
}

// ── ClockTopology ────────────────────────────────────────────────

/// A verified set of domains and crossings.
#[derive(Debug, Clone, Serialize)]
pub struct ClockTopology {
    domains: Vec<ClockDomain>,
    crossings: Vec<Crossing>,
    false_paths: Vec<(DomainId, DomainId)>,
}

impl ClockTopology {
    pub fn domains(&self) -> &[ClockDomain] {
        &self.domains
    }

    pub fn domain(&self, id: DomainId) -> Result<&ClockDomain> {
        self.domains.get(id.0).ok_or(SocError::UnknownDomain(id))
    }

    /// Find a domain by name.
    pub fn find(&self, name: &str) -> Result<DomainId> {
        self.domains
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.id)
            .ok_or_else(|| SocError::UnknownResource(name.to_string()))
    }

    /// The domain clocking `consumer`, if any.
    pub fn domain_of(&self, consumer: &str) -> Option<DomainId> {
        self.domains
            .iter()
            .find(|d| d.consumers.iter().any(|c| c == consumer))
            .map(|d| d.id)
    }

    pub fn crossings(&self) -> &[Crossing] {
        &self.crossings
    }

    pub fn false_paths(&self) -> &[(DomainId, DomainId)] {
        &self.false_paths
    }

    /// Whether some crossing links `a` and `b`, in either direction.
    pub fn connected(&self, a: DomainId, b: DomainId) -> bool {
        self.crossings
            .iter()
            .any(|c| (c.from == a && c.to == b) || (c.from == b && c.to == a))
    }

    /// Timing-ignore constraints, one per line, for the constraint tooling.
    pub fn render_false_paths(&self) -> String {
        self.false_paths
            .iter()
            .map(|&(from, to)| format!("TIG {} -> {}\n", self.name_of(from), self.name_of(to)))
            .collect()
    }

    /// Tracing span for tasks running in `id`.
    pub fn span(&self, id: DomainId) -> tracing::Span {
        tracing::info_span!("domain", name = self.name_of(id))
    }

    /// Open the bounded channel backing the crossing `name`.
    pub fn channel<T>(&self, name: &str) -> Result<(CrossingSender<T>, CrossingReceiver<T>)> {
        let crossing = self
            .crossings
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| SocError::UnknownResource(format!("crossing {name}")))?;
        let (tx, rx) = mpsc::channel(crossing.kind.depth());
        Ok((
            CrossingSender {
                tx,
                from: crossing.from,
            },
            CrossingReceiver {
                rx,
                to: crossing.to,
            },
        ))
    }

    fn name_of(&self, id: DomainId) -> &str {
        self.domains.get(id.0).map_or("?", |d| d.name.as_str())
    }
}

impl fmt::Display for ClockTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.domains {
            writeln!(f, "{} [{}]", d.name, d.consumers.join(", "))?;
        }
        for c in &self.crossings {
            writeln!(
                f,
                "  {}: {} -> {} ({:?})",
                c.name,
                self.name_of(c.from),
                self.name_of(c.to),
                c.kind
            )?;
        }
        Ok(())
    }
}

// ── Crossing channels ────────────────────────────────────────────

/// Producer side of a crossing, owned by the source domain.
#[derive(Debug)]
pub struct CrossingSender<T> {
    tx: mpsc::Sender<T>,
    from: DomainId,
}

impl<T> Clone for CrossingSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            from: self.from,
        }
    }
}

impl<T> CrossingSender<T> {
    /// Hand `value` across, waiting until the far side is ready.
    pub async fn send(&self, value: T) -> Result<()> {
        self.tx.send(value).await?;
        Ok(())
    }

    /// Hand `value` across only if there is room now.
    pub fn try_send(&self, value: T) -> std::result::Result<(), T> {
        self.tx.try_send(value).map_err(|e| match e {
            mpsc::error::TrySendError::Full(v) | mpsc::error::TrySendError::Closed(v) => v,
        })
    }

    pub fn domain(&self) -> DomainId {
        self.from
    }
}

/// Consumer side of a crossing, owned by the sink domain.
#[derive(Debug)]
pub struct CrossingReceiver<T> {
    rx: mpsc::Receiver<T>,
    to: DomainId,
}

impl<T> CrossingReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a value only if one is already waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn domain(&self) -> DomainId {
        self.to
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> (TopologyBuilder, DomainId, DomainId, DomainId) {
        let mut b = TopologyBuilder::new();
        let sys = b
            .domain("sys", ClockSource::Oscillator { freq_hz: 75_000_000 })
            .unwrap();
        let pix = b
            .domain(
                "pix_out",
                ClockSource::Pll {
                    parent: "sys".into(),
                    freq_hz: 74_250_000,
                },
            )
            .unwrap();
        let eth_rx = b
            .domain(
                "eth_rx",
                ClockSource::External {
                    pin: "eth_clocks.rx".into(),
                },
            )
            .unwrap();
        (b, sys, pix, eth_rx)
    }

    #[test]
    fn routed_and_quasi_static_paths_verify() {
        let (mut b, sys, pix, eth_rx) = base();
        b.crossing("out.fifo", sys, pix, CrossingKind::AsyncFifo { depth: 512 })
            .unwrap();
        b.crossing("eth.rx", eth_rx, sys, CrossingKind::AsyncFifo { depth: 64 })
            .unwrap();
        b.path("out.pixels", sys, pix, Route::Via("out.fifo".into()))
            .unwrap();
        b.path("out.timing", sys, pix, Route::QuasiStatic).unwrap();
        b.path("rx.frames", eth_rx, sys, Route::Via("eth.rx".into()))
            .unwrap();
        b.path("sys.local", sys, sys, Route::Direct).unwrap();
        b.false_path(sys, pix).unwrap();
        b.false_path(pix, sys).unwrap();

        let topo = b.build().unwrap();
        assert_eq!(topo.false_paths().len(), 2);
        assert!(topo.render_false_paths().contains("TIG sys -> pix_out"));
    }

    #[test]
    fn direct_cross_domain_path_is_rejected() {
        let (mut b, sys, pix, _) = base();
        b.path("out.pixels", sys, pix, Route::Direct).unwrap();
        let err = b.build().unwrap_err();
        assert!(matches!(
            err,
            SocError::UndeclaredCrossing { ref signal, .. } if signal == "out.pixels"
        ));
    }

    #[test]
    fn path_through_wrong_direction_is_rejected() {
        let (mut b, sys, pix, _) = base();
        b.crossing("out.fifo", sys, pix, CrossingKind::AsyncFifo { depth: 16 })
            .unwrap();
        b.path("back", pix, sys, Route::Via("out.fifo".into())).unwrap();
        assert!(matches!(
            b.build(),
            Err(SocError::UndeclaredCrossing { .. })
        ));
    }

    #[test]
    fn false_path_without_primitive_is_rejected() {
        let (mut b, sys, _, eth_rx) = base();
        b.false_path(eth_rx, sys).unwrap();
        assert!(matches!(
            b.build(),
            Err(SocError::UnprotectedFalsePath { .. })
        ));
    }

    #[test]
    fn shared_domain_has_two_consumers() {
        let (mut b, _, pix, _) = base();
        b.attach(pix, "hdmi_out0").unwrap();
        b.attach(pix, "hdmi_out1").unwrap();
        let topo = b.build().unwrap();
        assert_eq!(topo.domain_of("hdmi_out0"), Some(pix));
        assert_eq!(topo.domain_of("hdmi_out1"), Some(pix));
        assert_eq!(topo.domain(pix).unwrap().consumers.len(), 2);
    }

    #[test]
    fn duplicate_domain_and_self_crossing() {
        let (mut b, sys, _, _) = base();
        assert!(matches!(
            b.domain("sys", ClockSource::Oscillator { freq_hz: 1 }),
            Err(SocError::DuplicateDomain(_))
        ));
        assert!(b.crossing("loop", sys, sys, CrossingKind::Handshake).is_err());
        assert!(matches!(
            b.attach(DomainId(99), "ghost"),
            Err(SocError::UnknownDomain(_))
        ));
    }

    #[tokio::test]
    async fn channels_only_for_declared_crossings() {
        let (mut b, sys, pix, _) = base();
        b.crossing("out.fifo", sys, pix, CrossingKind::AsyncFifo { depth: 2 })
            .unwrap();
        let topo = b.build().unwrap();

        assert!(topo.channel::<u32>("nope").is_err());

        let (tx, mut rx) = topo.channel::<u32>("out.fifo").unwrap();
        assert_eq!(tx.domain(), sys);
        assert_eq!(rx.domain(), pix);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        // Depth is 2: a third value is refused without waiting.
        assert_eq!(tx.try_send(3), Err(3));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }
}
