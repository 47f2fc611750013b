//! Address and resource map.
//!
//! The map is assembled once through [`ResourceMapBuilder`] and then frozen
//! into a [`ResourceMap`] that every component borrows (usually behind an
//! `Arc`). All conflicts are rejected while building:
//!
//! - region names are unique and no two address windows intersect, where a
//!   region contributes its primary window and, if present, its shadow window;
//! - CSR slots, interrupt lines and network port numbers are unique;
//! - constants are unique by name.
//!
//! The frozen map is exported as JSON for the integration tooling, together
//! with a blake3 fingerprint of its canonical form.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SocError};
use crate::network::{NetworkPort, Protocol};

/// Offset between a region and its uncached alias in the default layout.
pub const SHADOW_OFFSET: u32 = 0x8000_0000;

// ── AddressRegion ────────────────────────────────────────────────

/// A named, non-overlapping range of the local address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRegion {
    pub name: String,
    pub base: u32,
    pub size: u32,
    /// Secondary base through which the same storage is reachable.
    pub shadow: Option<u32>,
}

impl AddressRegion {
    /// Every window `(start, end)` the region occupies, end exclusive.
    fn windows(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        std::iter::once(self.base)
            .chain(self.shadow)
            .map(|start| (start as u64, start as u64 + self.size as u64))
    }

    /// Offset of `addr` inside the region, through either window.
    pub fn offset_of(&self, addr: u32) -> Option<u32> {
        let addr = addr as u64;
        self.windows()
            .find(|&(start, end)| addr >= start && addr < end)
            .map(|(start, _)| (addr - start) as u32)
    }

    /// Whether `addr` falls in the primary or shadow window.
    pub fn contains(&self, addr: u32) -> bool {
        self.offset_of(addr).is_some()
    }

    fn overlaps(&self, other: &AddressRegion) -> bool {
        self.windows().any(|(a_start, a_end)| {
            other
                .windows()
                .any(|(b_start, b_end)| a_start < b_end && b_start < a_end)
        })
    }
}

impl fmt::Display for AddressRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:#010x}+{:#x}", self.name, self.base, self.size)?;
        if let Some(shadow) = self.shadow {
            write!(f, " (shadow {shadow:#010x})")?;
        }
        Ok(())
    }
}

// ── ResourceMapBuilder ───────────────────────────────────────────

/// Append-only builder for the resource map.
#[derive(Debug, Default)]
pub struct ResourceMapBuilder {
    regions: Vec<AddressRegion>,
    csr: BTreeMap<String, u32>,
    interrupts: BTreeMap<String, u32>,
    ports: Vec<NetworkPort>,
    constants: BTreeMap<String, i64>,
}

impl ResourceMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a memory-mapped region.
    pub fn register(
        &mut self,
        name: &str,
        base: u32,
        size: u32,
        shadow: Option<u32>,
    ) -> Result<&mut Self> {
        let region = AddressRegion {
            name: name.to_string(),
            base,
            size,
            shadow,
        };

        if size == 0 || region.windows().any(|(_, end)| end > 1 << 32) {
            return Err(SocError::InvalidRegion {
                name: region.name,
                base,
                size,
            });
        }
        if self.regions.iter().any(|r| r.name == name) {
            return Err(SocError::DuplicateRegion(region.name));
        }
        // A shadow window must not alias the region's own primary window.
        if region.shadow.is_some_and(|s| {
            let (s, b) = (s as u64, base as u64);
            s < b + size as u64 && b < s + size as u64
        }) {
            return Err(SocError::RegionOverlap {
                name: region.name.clone(),
                base,
                size,
                other: region.name,
            });
        }
        if let Some(other) = self.regions.iter().find(|r| r.overlaps(&region)) {
            return Err(SocError::RegionOverlap {
                name: region.name,
                base,
                size,
                other: other.name.clone(),
            });
        }

        self.regions.push(region);
        Ok(self)
    }

    /// Assign the next free CSR slot to `name` and return it.
    pub fn add_csr(&mut self, name: &str) -> Result<u32> {
        if let Some(&slot) = self.csr.get(name) {
            return Err(SocError::ResourceConflict {
                kind: "csr",
                name: name.to_string(),
                value: slot as u64,
            });
        }
        let slot = self.csr.values().max().map_or(0, |max| max + 1);
        self.csr.insert(name.to_string(), slot);
        Ok(slot)
    }

    /// Bind `name` to interrupt line `line`.
    pub fn add_interrupt(&mut self, name: &str, line: u32) -> Result<&mut Self> {
        if self.interrupts.contains_key(name) || self.interrupts.values().any(|&l| l == line) {
            return Err(SocError::ResourceConflict {
                kind: "interrupt",
                name: name.to_string(),
                value: line as u64,
            });
        }
        self.interrupts.insert(name.to_string(), line);
        Ok(self)
    }

    /// Reserve a network port number for one consumer.
    pub fn add_port(
        &mut self,
        name: &str,
        protocol: Protocol,
        number: u16,
        buffer_depth: usize,
    ) -> Result<&mut Self> {
        if self.ports.iter().any(|p| p.number == number) {
            return Err(SocError::DuplicatePort(number));
        }
        if self.ports.iter().any(|p| p.name == name) {
            return Err(SocError::ResourceConflict {
                kind: "port",
                name: name.to_string(),
                value: number as u64,
            });
        }
        if buffer_depth == 0 {
            return Err(SocError::InvalidConfig(format!(
                "port {name} needs a buffer depth of at least one"
            )));
        }
        self.ports.push(NetworkPort {
            name: name.to_string(),
            protocol,
            number,
            buffer_depth,
        });
        Ok(self)
    }

    /// Record a platform constant for the exported map.
    pub fn add_constant(&mut self, name: &str, value: i64) -> Result<&mut Self> {
        if self.constants.contains_key(name) {
            return Err(SocError::ResourceConflict {
                kind: "constant",
                name: name.to_string(),
                value: value as u64,
            });
        }
        self.constants.insert(name.to_string(), value);
        Ok(self)
    }

    /// Freeze the map.
    pub fn build(self) -> ResourceMap {
        let mut regions = self.regions;
        regions.sort_by_key(|r| r.base);
        ResourceMap {
            regions,
            csr: self.csr,
            interrupts: self.interrupts,
            ports: self.ports,
            constants: self.constants,
        }
    }
}

// ── ResourceMap ──────────────────────────────────────────────────

/// The frozen, validated resource map.
#[derive(Debug, Clone)]
pub struct ResourceMap {
    regions: Vec<AddressRegion>,
    csr: BTreeMap<String, u32>,
    interrupts: BTreeMap<String, u32>,
    ports: Vec<NetworkPort>,
    constants: BTreeMap<String, i64>,
}

impl ResourceMap {
    /// Look a region up by name.
    pub fn lookup(&self, name: &str) -> Result<&AddressRegion> {
        self.regions
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| SocError::UnknownResource(name.to_string()))
    }

    /// Find the region covering `addr` and the offset inside it.
    pub fn resolve(&self, addr: u32) -> Option<(&AddressRegion, u32)> {
        self.regions
            .iter()
            .find_map(|r| r.offset_of(addr).map(|offset| (r, offset)))
    }

    pub fn regions(&self) -> &[AddressRegion] {
        &self.regions
    }

    pub fn port(&self, name: &str) -> Result<&NetworkPort> {
        self.ports
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SocError::UnknownResource(name.to_string()))
    }

    pub fn ports(&self) -> &[NetworkPort] {
        &self.ports
    }

    pub fn csr_slot(&self, name: &str) -> Option<u32> {
        self.csr.get(name).copied()
    }

    pub fn interrupt(&self, name: &str) -> Option<u32> {
        self.interrupts.get(name).copied()
    }

    pub fn constant(&self, name: &str) -> Option<i64> {
        self.constants.get(name).copied()
    }

    /// blake3 digest of the canonical layout, as lowercase hex.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for r in &self.regions {
            hasher.update(r.name.as_bytes());
            hasher.update(&r.base.to_le_bytes());
            hasher.update(&r.size.to_le_bytes());
            hasher.update(&r.shadow.unwrap_or(0).to_le_bytes());
        }
        for (name, slot) in &self.csr {
            hasher.update(name.as_bytes());
            hasher.update(&slot.to_le_bytes());
        }
        for (name, line) in &self.interrupts {
            hasher.update(name.as_bytes());
            hasher.update(&line.to_le_bytes());
        }
        for p in &self.ports {
            hasher.update(p.name.as_bytes());
            hasher.update(&p.number.to_le_bytes());
        }
        for (name, value) in &self.constants {
            hasher.update(name.as_bytes());
            hasher.update(&value.to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Snapshot of the map for the integration tooling.
    pub fn export(&self) -> MapExport {
        MapExport {
            regions: self.regions.clone(),
            csr: self.csr.clone(),
            interrupts: self.interrupts.clone(),
            ports: self.ports.clone(),
            constants: self.constants.clone(),
            fingerprint: self.fingerprint(),
        }
    }

    /// Pretty JSON rendering of [`export`](Self::export).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }
}

/// Serialisable form of the resource map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapExport {
    pub regions: Vec<AddressRegion>,
    pub csr: BTreeMap<String, u32>,
    pub interrupts: BTreeMap<String, u32>,
    pub ports: Vec<NetworkPort>,
    pub constants: BTreeMap<String, i64>,
    pub fingerprint: String,
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ResourceMapBuilder {
        let mut b = ResourceMapBuilder::new();
        b.register("main_ram", 0x4000_0000, 0x0400_0000, None).unwrap();
        b.register("encoder", 0x5000_0000, 0x2000, Some(0xd000_0000))
            .unwrap();
        b
    }

    #[test]
    fn lookup_and_resolve() {
        let map = builder().build();
        let enc = map.lookup("encoder").unwrap();
        assert_eq!(enc.base, 0x5000_0000);

        let (region, offset) = map.resolve(0x5000_0010).unwrap();
        assert_eq!(region.name, "encoder");
        assert_eq!(offset, 0x10);

        // Same storage through the shadow window.
        let (region, offset) = map.resolve(0xd000_0010).unwrap();
        assert_eq!(region.name, "encoder");
        assert_eq!(offset, 0x10);

        assert!(map.resolve(0x5000_2000).is_none());
        assert!(matches!(
            map.lookup("sdram"),
            Err(SocError::UnknownResource(_))
        ));
    }

    #[test]
    fn rejects_overlap() {
        let mut b = builder();
        let err = b.register("rogue", 0x5000_1000, 0x2000, None).unwrap_err();
        assert!(matches!(err, SocError::RegionOverlap { ref other, .. } if other == "encoder"));
    }

    #[test]
    fn rejects_overlap_with_shadow_window() {
        let mut b = builder();
        let err = b.register("rogue", 0xd000_1000, 0x100, None).unwrap_err();
        assert!(matches!(err, SocError::RegionOverlap { .. }));

        // A new shadow landing on an existing primary window.
        let err = b
            .register("alias", 0x6000_0000, 0x100, Some(0x4000_0000))
            .unwrap_err();
        assert!(matches!(err, SocError::RegionOverlap { ref other, .. } if other == "main_ram"));
    }

    #[test]
    fn rejects_duplicate_and_degenerate_regions() {
        let mut b = builder();
        assert!(matches!(
            b.register("encoder", 0x7000_0000, 0x10, None),
            Err(SocError::DuplicateRegion(_))
        ));
        assert!(matches!(
            b.register("empty", 0x7000_0000, 0, None),
            Err(SocError::InvalidRegion { .. })
        ));
        assert!(matches!(
            b.register("wrap", 0xffff_f000, 0x2000, None),
            Err(SocError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn adjacent_regions_are_accepted() {
        let mut b = builder();
        b.register("after", 0x5000_2000, 0x1000, None).unwrap();
        let map = b.build();
        assert_eq!(map.resolve(0x5000_2000).unwrap().0.name, "after");
        assert_eq!(map.resolve(0x5000_1ffc).unwrap().0.name, "encoder");
    }

    #[test]
    fn csr_interrupt_and_port_conflicts() {
        let mut b = ResourceMapBuilder::new();
        assert_eq!(b.add_csr("ethphy").unwrap(), 0);
        assert_eq!(b.add_csr("ethcore").unwrap(), 1);
        assert!(b.add_csr("ethphy").is_err());

        b.add_interrupt("hdmi_in0", 3).unwrap();
        assert!(b.add_interrupt("hdmi_in1", 3).is_err());

        b.add_port("etherbone", Protocol::Tcp, 20000, 1).unwrap();
        assert!(matches!(
            b.add_port("stream", Protocol::Udp, 20000, 8),
            Err(SocError::DuplicatePort(20000))
        ));
    }

    #[test]
    fn export_carries_fingerprint() {
        let mut b = builder();
        b.add_constant("HDMI_WIDTH", 1280).unwrap();
        let map = b.build();
        let json = map.to_json().unwrap();
        let parsed: MapExport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.regions.len(), 2);
        assert_eq!(parsed.constants["HDMI_WIDTH"], 1280);
        assert_eq!(parsed.fingerprint, map.fingerprint());
        assert_eq!(parsed.fingerprint.len(), 64);

        let mut other = builder();
        other.add_constant("HDMI_WIDTH", 1920).unwrap();
        assert_ne!(other.build().fingerprint(), map.fingerprint());
    }
}
