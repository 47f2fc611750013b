//! Memory arbiter and crossbar.
//!
//! A fixed set of [`MemoryClient`]s share one memory device. Each client
//! owns exactly one [`ArbiterPort`]; [`ArbiterPort::acquire`] resolves to a
//! [`Grant`], the only handle through which memory can be read or written.
//! At most one grant is live at any instant.
//!
//! ## Policy
//!
//! Round-robin over the clients currently requesting: after client `k` is
//! served, the search for the next owner starts at `k + 1`. A client that
//! keeps requesting therefore waits for at most `N - 1` other grants.
//!
//! ## Buffer sizing
//!
//! Buffered clients (capture and playback FIFOs) declare a depth and the
//! number of cycles one entry lasts. [`CrossbarBuilder::build`] rejects any
//! client whose buffer would run dry before the worst-case arbitration
//! latency, `N × max_grant_cycles`. An undersized buffer is an integration
//! error, not something the arbiter compensates for at runtime.
//!
//! [`CycleArbiter`] runs the same policy one cycle at a time for
//! deterministic analysis of grant counts and waits.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::bridge::BusFault;
use crate::error::{Result, SocError};

// ── MemoryClient ─────────────────────────────────────────────────

/// Index of a client on its crossbar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(usize);

impl ClientId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Direction of a client's DMA traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Read,
    Write,
    /// Both, e.g. a bus bridge.
    ReadWrite,
}

/// Local buffer decoupling a client's fixed rate from arbitration latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientBuffer {
    /// Entries the buffer holds.
    pub depth: usize,
    /// Cycles one entry takes to produce or consume at the client's rate.
    pub period_cycles: u64,
}

impl ClientBuffer {
    /// Cycles the client survives without being served.
    pub fn slack_cycles(&self) -> u64 {
        self.depth as u64 * self.period_cycles
    }
}

/// A DMA-capable producer or consumer on the crossbar.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryClient {
    pub id: ClientId,
    pub name: String,
    pub direction: Direction,
    pub buffer: Option<ClientBuffer>,
}

// ── RoundRobin ───────────────────────────────────────────────────

/// Round-robin pointer shared by both arbiter flavours.
#[derive(Debug, Clone)]
struct RoundRobin {
    clients: usize,
    last: Option<usize>,
}

impl RoundRobin {
    fn new(clients: usize) -> Self {
        Self {
            clients,
            last: None,
        }
    }

    /// Pick the first requester after the last winner.
    fn pick(&mut self, requesting: &[bool]) -> Option<usize> {
        let start = self.last.map_or(0, |l| (l + 1) % self.clients);
        let winner = (0..self.clients)
            .map(|i| (start + i) % self.clients)
            .find(|&k| requesting[k])?;
        self.last = Some(winner);
        Some(winner)
    }
}

// ── Statistics ───────────────────────────────────────────────────

/// Per-client arbitration counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    /// Grants received.
    pub grants: u64,
    /// Bytes moved under those grants.
    pub bytes: u64,
    /// Other grants issued while this client was waiting, current episode.
    pub waiting: u64,
    /// Longest wait observed, in grants issued to others.
    pub longest_wait: u64,
    /// Waits that exceeded the round-robin bound.
    pub starvation_events: u64,
}

fn record_handover(stats: &mut [ClientStats], requesting: &[bool], winner: usize) {
    let bound = stats.len() as u64 - 1;
    for (k, s) in stats.iter_mut().enumerate() {
        if k == winner {
            s.grants += 1;
            s.waiting = 0;
        } else if requesting[k] {
            s.waiting += 1;
            s.longest_wait = s.longest_wait.max(s.waiting);
            if s.waiting == bound + 1 {
                s.starvation_events += 1;
            }
        } else {
            s.waiting = 0;
        }
    }
}

// ── CrossbarBuilder ──────────────────────────────────────────────

/// Collects the fixed client set before the crossbar exists.
#[derive(Debug)]
pub struct CrossbarBuilder {
    clients: Vec<MemoryClient>,
    memory_size: usize,
    max_grant_cycles: u64,
}

impl CrossbarBuilder {
    /// A crossbar in front of `memory_size` bytes where no grant lasts
    /// longer than `max_grant_cycles`.
    pub fn new(memory_size: usize, max_grant_cycles: u64) -> Self {
        Self {
            clients: Vec::new(),
            memory_size,
            max_grant_cycles,
        }
    }

    /// Register a client and return its id.
    pub fn add_client(
        &mut self,
        name: &str,
        direction: Direction,
        buffer: Option<ClientBuffer>,
    ) -> Result<ClientId> {
        if self.clients.iter().any(|c| c.name == name) {
            return Err(SocError::DuplicateClient(name.to_string()));
        }
        let id = ClientId(self.clients.len());
        self.clients.push(MemoryClient {
            id,
            name: name.to_string(),
            direction,
            buffer,
        });
        Ok(id)
    }

    /// Worst-case cycles between a request and its grant.
    pub fn worst_case_latency(&self) -> u64 {
        self.clients.len() as u64 * self.max_grant_cycles
    }

    /// Check every buffer against the worst-case latency and build.
    pub fn build(self) -> Result<Crossbar> {
        if self.clients.is_empty() {
            return Err(SocError::InvalidConfig("crossbar has no clients".into()));
        }
        if self.max_grant_cycles == 0 {
            return Err(SocError::InvalidConfig(
                "max_grant_cycles must be at least one".into(),
            ));
        }

        let latency = self.worst_case_latency();
        for client in &self.clients {
            if let Some(buf) = client.buffer {
                if buf.slack_cycles() < latency {
                    return Err(SocError::BufferUndersized {
                        client: client.name.clone(),
                        depth: buf.depth,
                        period: buf.period_cycles,
                        latency,
                    });
                }
            }
        }

        let n = self.clients.len();
        debug!(
            "crossbar: {n} clients, {} bytes, worst-case latency {latency} cycles",
            self.memory_size
        );
        Ok(Crossbar {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    rr: RoundRobin::new(n),
                    requesting: vec![false; n],
                    owner: None,
                    memory: vec![0; self.memory_size],
                    stats: vec![ClientStats::default(); n],
                }),
                wakers: (0..n).map(|_| Notify::new()).collect(),
                taken: (0..n).map(|_| AtomicBool::new(false)).collect(),
                clients: self.clients,
                max_grant_cycles: self.max_grant_cycles,
            }),
        })
    }
}

// ── Crossbar ─────────────────────────────────────────────────────

struct State {
    rr: RoundRobin,
    requesting: Vec<bool>,
    owner: Option<usize>,
    memory: Vec<u8>,
    stats: Vec<ClientStats>,
}

impl State {
    /// Give the device to the next requester, if any, and wake it.
    fn hand_over(&mut self, wakers: &[Notify]) {
        debug_assert!(self.owner.is_none());
        if let Some(next) = self.rr.pick(&self.requesting) {
            record_handover(&mut self.stats, &self.requesting, next);
            self.requesting[next] = false;
            self.owner = Some(next);
            wakers[next].notify_one();
        }
    }
}

struct Shared {
    state: Mutex<State>,
    wakers: Vec<Notify>,
    taken: Vec<AtomicBool>,
    clients: Vec<MemoryClient>,
    max_grant_cycles: u64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, me: usize) {
        let mut state = self.lock();
        if state.owner == Some(me) {
            state.owner = None;
            state.hand_over(&self.wakers);
        }
    }

    /// Withdraw an abandoned request, passing the grant on if it had
    /// already been handed to us.
    fn cancel(&self, me: usize) {
        let mut state = self.lock();
        state.requesting[me] = false;
        if state.owner == Some(me) {
            state.owner = None;
            state.hand_over(&self.wakers);
        }
    }
}

/// The shared memory device and its arbiter.
#[derive(Clone)]
pub struct Crossbar {
    shared: Arc<Shared>,
}

impl Crossbar {
    /// Take the port of `id`. Each port can be taken exactly once.
    pub fn take_port(&self, id: ClientId) -> Result<ArbiterPort> {
        let taken = self
            .shared
            .taken
            .get(id.0)
            .ok_or_else(|| SocError::UnknownResource(format!("memory client {}", id.0)))?;
        if taken.swap(true, Ordering::SeqCst) {
            return Err(SocError::InvalidConfig(format!(
                "port of memory client {} already taken",
                self.shared.clients[id.0].name
            )));
        }
        Ok(ArbiterPort {
            shared: Arc::clone(&self.shared),
            id,
        })
    }

    /// Look a client up by name.
    pub fn client(&self, name: &str) -> Option<&MemoryClient> {
        self.shared.clients.iter().find(|c| c.name == name)
    }

    pub fn clients(&self) -> &[MemoryClient] {
        &self.shared.clients
    }

    pub fn stats(&self, id: ClientId) -> ClientStats {
        self.shared.lock().stats[id.0]
    }

    /// Counters of every client, in id order.
    pub fn snapshot(&self) -> Vec<(String, ClientStats)> {
        let state = self.shared.lock();
        self.shared
            .clients
            .iter()
            .map(|c| (c.name.clone(), state.stats[c.id.0]))
            .collect()
    }

    pub fn memory_size(&self) -> usize {
        self.shared.lock().memory.len()
    }

    pub fn max_grant_cycles(&self) -> u64 {
        self.shared.max_grant_cycles
    }
}

impl fmt::Debug for Crossbar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crossbar")
            .field("clients", &self.shared.clients.len())
            .field("max_grant_cycles", &self.shared.max_grant_cycles)
            .finish()
    }
}

// ── ArbiterPort ──────────────────────────────────────────────────

/// A client's private face of the crossbar.
pub struct ArbiterPort {
    shared: Arc<Shared>,
    id: ClientId,
}

impl ArbiterPort {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn client(&self) -> &MemoryClient {
        &self.shared.clients[self.id.0]
    }

    /// Wait for exclusive access to the memory device.
    ///
    /// Cancel-safe: dropping the future before it resolves withdraws the
    /// request and passes on a grant that raced with the drop.
    pub async fn acquire(&mut self) -> Grant<'_> {
        let me = self.id.0;
        let mut pending = PendingRequest {
            shared: &self.shared,
            me,
            armed: true,
        };

        {
            let mut state = self.shared.lock();
            state.requesting[me] = true;
            if state.owner.is_none() {
                state.hand_over(&self.shared.wakers);
            }
        }

        loop {
            if self.shared.lock().owner == Some(me) {
                break;
            }
            self.shared.wakers[me].notified().await;
        }

        pending.armed = false;
        trace!("grant -> {}", self.client().name);
        Grant { port: &*self }
    }
}

impl fmt::Debug for ArbiterPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArbiterPort")
            .field("client", &self.client().name)
            .finish()
    }
}

struct PendingRequest<'a> {
    shared: &'a Shared,
    me: usize,
    armed: bool,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel(self.me);
        }
    }
}

// ── Grant ────────────────────────────────────────────────────────

/// Exclusive access to the memory device. Released on drop.
pub struct Grant<'a> {
    port: &'a ArbiterPort,
}

impl Grant<'_> {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut state = self.port.shared.lock();
        let range = Self::span(&state.memory, addr, buf.len())?;
        buf.copy_from_slice(&state.memory[range]);
        state.stats[self.port.id.0].bytes += buf.len() as u64;
        Ok(())
    }

    /// Copy `data` into memory starting at `addr`.
    pub fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
        let mut state = self.port.shared.lock();
        let range = Self::span(&state.memory, addr, data.len())?;
        state.memory[range].copy_from_slice(data);
        state.stats[self.port.id.0].bytes += data.len() as u64;
        Ok(())
    }

    /// Hand the device back explicitly.
    pub fn release(self) {}

    fn span(memory: &[u8], addr: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= memory.len() => Ok(start..end),
            _ => Err(BusFault::Unmapped { address: addr }.into()),
        }
    }
}

impl Drop for Grant<'_> {
    fn drop(&mut self) {
        self.port.shared.release(self.port.id.0);
    }
}

// ── CycleArbiter ─────────────────────────────────────────────────

/// Cycle-stepped model of the crossbar's arbitration.
///
/// Each [`step`](Self::step) is one clock cycle. A grant holds the device
/// for `grant_cycles` cycles; requests are sampled when the device is free.
#[derive(Debug, Clone)]
pub struct CycleArbiter {
    rr: RoundRobin,
    grant_cycles: u64,
    owner: Option<(usize, u64)>,
    stats: Vec<ClientStats>,
    cycle: u64,
}

impl CycleArbiter {
    pub fn new(clients: usize, grant_cycles: u64) -> Self {
        Self {
            rr: RoundRobin::new(clients),
            grant_cycles: grant_cycles.max(1),
            owner: None,
            stats: vec![ClientStats::default(); clients],
            cycle: 0,
        }
    }

    /// Advance one cycle with the given request lines, one per client;
    /// return the owner.
    pub fn step(&mut self, requesting: &[bool]) -> Result<Option<ClientId>> {
        if requesting.len() != self.stats.len() {
            return Err(SocError::InvalidConfig(format!(
                "{} request lines for {} clients",
                requesting.len(),
                self.stats.len()
            )));
        }
        self.cycle += 1;

        if let Some((owner, remaining)) = self.owner {
            if remaining > 1 {
                self.owner = Some((owner, remaining - 1));
                return Ok(Some(ClientId(owner)));
            }
            self.owner = None;
        }

        let Some(winner) = self.rr.pick(requesting) else {
            return Ok(None);
        };
        record_handover(&mut self.stats, requesting, winner);
        self.owner = Some((winner, self.grant_cycles));
        Ok(Some(ClientId(winner)))
    }

    pub fn stats(&self, id: ClientId) -> ClientStats {
        self.stats[id.0]
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Total starvation events across all clients.
    pub fn starvation_events(&self) -> u64 {
        self.stats.iter().map(|s| s.starvation_events).sum()
    }
}

// ── Tests ────────────────────────────────────────────────────────
