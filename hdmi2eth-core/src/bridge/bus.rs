//! Bus decoding for bridge requests.
//!
//! The [`Bus`] resolves a request's address through the [`ResourceMap`]
//! and forwards it to the [`BusTarget`] attached to that region. Register
//! and peripheral implementations live behind the trait; two targets ship
//! with the crate: [`RegisterFile`], a plain word store, and
//! [`ArbitratedMemory`], which reaches the shared memory device through its
//! own crossbar port like any other memory client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::arbiter::ArbiterPort;
use crate::bridge::BusFault;
use crate::bridge::wire::{Request, Response};
use crate::error::{Result, SocError};
use crate::map::ResourceMap;

// ── BusTarget ────────────────────────────────────────────────────

/// A peripheral reachable through the bridge.
///
/// Offsets are byte offsets from the start of the region and always word
/// aligned. Bursts are bounds-checked by the [`Bus`] before they arrive.
#[async_trait]
pub trait BusTarget: Send + Sync {
    async fn read(&self, offset: u32) -> std::result::Result<u32, BusFault>;

    async fn write(&self, offset: u32, value: u32) -> std::result::Result<(), BusFault>;

    async fn read_burst(
        &self,
        offset: u32,
        count: usize,
    ) -> std::result::Result<Vec<u32>, BusFault> {
        let mut words = Vec::with_capacity(count);
        for i in 0..count as u32 {
            words.push(self.read(offset + 4 * i).await?);
        }
        Ok(words)
    }

    async fn write_burst(&self, offset: u32, data: &[u32]) -> std::result::Result<(), BusFault> {
        for (i, &word) in data.iter().enumerate() {
            self.write(offset + 4 * i as u32, word).await?;
        }
        Ok(())
    }
}

// ── RegisterFile ─────────────────────────────────────────────────

/// Word-addressed register storage.
#[derive(Debug)]
pub struct RegisterFile {
    words: Mutex<Vec<u32>>,
}

impl RegisterFile {
    /// Storage for `size` bytes, rounded down to whole words.
    pub fn new(size: u32) -> Self {
        Self {
            words: Mutex::new(vec![0; size as usize / 4]),
        }
    }

    /// Direct local read, bypassing the bridge.
    pub fn peek(&self, offset: u32) -> Option<u32> {
        let words = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        words.get(offset as usize / 4).copied()
    }
}

#[async_trait]
impl BusTarget for RegisterFile {
    async fn read(&self, offset: u32) -> std::result::Result<u32, BusFault> {
        self.peek(offset)
            .ok_or(BusFault::TargetFault { address: offset })
    }

    async fn write(&self, offset: u32, value: u32) -> std::result::Result<(), BusFault> {
        let mut words = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = words
            .get_mut(offset as usize / 4)
            .ok_or(BusFault::TargetFault { address: offset })?;
        *slot = value;
        Ok(())
    }
}

// ── ArbitratedMemory ─────────────────────────────────────────────

/// Shared memory reached through a crossbar port.
///
/// One grant covers a whole burst. Words are little-endian in memory.
pub struct ArbitratedMemory {
    port: AsyncMutex<ArbiterPort>,
    /// Device address of the region's first byte.
    base: u32,
}

impl ArbitratedMemory {
    pub fn new(port: ArbiterPort, base: u32) -> Self {
        Self {
            port: AsyncMutex::new(port),
            base,
        }
    }
}

#[async_trait]
impl BusTarget for ArbitratedMemory {
    async fn read(&self, offset: u32) -> std::result::Result<u32, BusFault> {
        Ok(self.read_burst(offset, 1).await?[0])
    }

    async fn write(&self, offset: u32, value: u32) -> std::result::Result<(), BusFault> {
        self.write_burst(offset, &[value]).await
    }

    async fn read_burst(
        &self,
        offset: u32,
        count: usize,
    ) -> std::result::Result<Vec<u32>, BusFault> {
        let mut bytes = vec![0u8; 4 * count];
        let mut port = self.port.lock().await;
        let grant = port.acquire().await;
        grant
            .read(self.base + offset, &mut bytes)
            .map_err(|_| BusFault::TargetFault { address: offset })?;
        drop(grant);
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    async fn write_burst(&self, offset: u32, data: &[u32]) -> std::result::Result<(), BusFault> {
        let bytes: Vec<u8> = data.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut port = self.port.lock().await;
        let grant = port.acquire().await;
        grant
            .write(self.base + offset, &bytes)
            .map_err(|_| BusFault::TargetFault { address: offset })
    }
}

// ── Bus ──────────────────────────────────────────────────────────

/// Address decoder in front of the bus targets.
pub struct Bus {
    map: Arc<ResourceMap>,
    targets: HashMap<String, Arc<dyn BusTarget>>,
}

impl Bus {
    pub fn new(map: Arc<ResourceMap>) -> Self {
        Self {
            map,
            targets: HashMap::new(),
        }
    }

    /// Attach `target` behind the registered region `region`.
    pub fn attach(&mut self, region: &str, target: Arc<dyn BusTarget>) -> Result<&mut Self> {
        self.map.lookup(region)?;
        if self.targets.contains_key(region) {
            return Err(SocError::ResourceConflict {
                kind: "bus target",
                name: region.to_string(),
                value: 0,
            });
        }
        self.targets.insert(region.to_string(), target);
        Ok(self)
    }

    pub fn map(&self) -> &ResourceMap {
        &self.map
    }

    /// Execute one request and produce its response.
    pub async fn execute(&self, request: Request) -> Response {
        let tag = request.tag();
        let outcome = match request {
            Request::Probe { .. } => return Response::probe_reply(tag),
            Request::Invalid { reason, .. } => Err(BusFault::BadRequest(reason)),
            Request::Read { address, count, .. } => match self.route(address, count as usize) {
                Ok((target, offset)) => target.read_burst(offset, count as usize).await,
                Err(fault) => Err(fault),
            },
            Request::Write { address, data, .. } => match self.route(address, data.len()) {
                Ok((target, offset)) => {
                    target.write_burst(offset, &data).await.map(|()| Vec::new())
                }
                Err(fault) => Err(fault),
            },
        };

        match outcome {
            Ok(data) => Response::data(tag, data),
            Err(fault) => {
                debug!("bridge request {tag} faulted: {fault}");
                Response::fault(tag, &fault)
            }
        }
    }

    /// Find the target and offset for a `words`-long access at `address`.
    fn route(
        &self,
        address: u32,
        words: usize,
    ) -> std::result::Result<(&dyn BusTarget, u32), BusFault> {
        if address % 4 != 0 {
            return Err(BusFault::Misaligned { address });
        }
        let (region, offset) = self
            .map
            .resolve(address)
            .ok_or(BusFault::Unmapped { address })?;
        if offset as u64 + 4 * words as u64 > region.size as u64 {
            return Err(BusFault::BurstOverrun {
                address,
                words: words as u32,
            });
        }
        let target = self
            .targets
            .get(&region.name)
            .ok_or(BusFault::TargetFault { address })?;
        Ok((target.as_ref(), offset))
    }
}

// ── Tests ────────────────────────────────────────────────────────
