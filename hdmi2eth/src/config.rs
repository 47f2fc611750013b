//! Configuration for the SoC runtime.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use hdmi2eth_core::{FrameGeometry, MacAddress, NetworkIdentity, OverflowPolicy, SocParams};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocConfig {
    /// Station identity and ports.
    pub network: NetworkConfig,
    /// Capture and playback settings.
    pub video: VideoConfig,
    /// Shared-memory arbitration.
    pub arbiter: ArbiterConfig,
    pub encoder: EncoderConfig,
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    /// Local address the ports are bound on.
    pub bind_ip: Ipv4Addr,
    /// TCP port of the remote bus bridge.
    pub control_port: u16,
    /// UDP port of the bulk video stream.
    pub stream_port: u16,
    /// Datagrams the bulk port queues before the sender waits.
    pub stream_buffer_depth: usize,
    /// Where stream datagrams are sent.
    pub stream_destination: SocketAddr,
    /// Largest datagram, header included.
    pub stream_mtu: usize,
}

/// Video configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub line_bytes: u32,
    pub lines_per_frame: u32,
    /// Lines each capture buffer holds.
    pub capture_fifo_depth: usize,
    /// What a full capture buffer does with the next line.
    pub overflow: OverflowPolicy,
    /// Lines each playback FIFO holds.
    pub playback_fifo_depth: usize,
    /// System cycles per video line.
    pub line_period_cycles: u64,
    /// Scan the playback framebuffers out to both outputs.
    pub playback: bool,
}

/// Arbiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Longest single grant, in system cycles.
    pub max_grant_cycles: u64,
    /// Shared memory size in bytes.
    pub memory_size: u32,
}

/// Encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// zstd compression level.
    pub compression_level: i32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        let p = SocParams::default();
        Self {
            mac: p.identity.mac,
            ip: p.identity.ip,
            bind_ip: p.bind_ip,
            control_port: p.control_port,
            stream_port: p.stream_port,
            stream_buffer_depth: p.stream_buffer_depth,
            stream_destination: p.stream_destination,
            stream_mtu: p.stream_mtu,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        let p = SocParams::default();
        Self {
            line_bytes: p.geometry.line_bytes,
            lines_per_frame: p.geometry.lines_per_frame,
            capture_fifo_depth: p.capture_fifo_depth,
            overflow: p.overflow,
            playback_fifo_depth: p.playback_fifo_depth,
            line_period_cycles: p.line_period_cycles,
            playback: p.playback,
        }
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        let p = SocParams::default();
        Self {
            max_grant_cycles: p.max_grant_cycles,
            memory_size: p.memory_size,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            compression_level: SocParams::default().compression_level,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SocConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Convert into the parameters the core builds a SoC from.
    pub fn to_params(&self) -> SocParams {
        SocParams {
            identity: NetworkIdentity {
                mac: self.network.mac,
                ip: self.network.ip,
            },
            bind_ip: self.network.bind_ip,
            control_port: self.network.control_port,
            stream_port: self.network.stream_port,
            stream_buffer_depth: self.network.stream_buffer_depth,
            stream_destination: self.network.stream_destination,
            stream_mtu: self.network.stream_mtu,
            geometry: FrameGeometry {
                line_bytes: self.video.line_bytes,
                lines_per_frame: self.video.lines_per_frame,
            },
            capture_fifo_depth: self.video.capture_fifo_depth,
            overflow: self.video.overflow,
            playback_fifo_depth: self.video.playback_fifo_depth,
            line_period_cycles: self.video.line_period_cycles,
            playback: self.video.playback,
            max_grant_cycles: self.arbiter.max_grant_cycles,
            memory_size: self.arbiter.memory_size,
            compression_level: self.encoder.compression_level,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = SocConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("control_port = 20000"));
        assert!(text.contains("stream_port = 8000"));
        assert!(text.contains("mac = \"10:e2:d5:00:00:00\""));
        assert!(text.contains("overflow = \"drop_incoming\""));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = SocConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: SocConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.stream_buffer_depth, 8);
        assert_eq!(parsed.video.capture_fifo_depth, 1024);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: SocConfig = toml::from_str(
            "[video]\nplayback = false\noverflow = \"overwrite_oldest\"\n\n\
             [logging]\nlevel = \"debug\"\n",
        )
        .unwrap();
        let params = parsed.to_params();
        assert!(!params.playback);
        assert_eq!(params.overflow, OverflowPolicy::OverwriteOldest);
        assert_eq!(params.control_port, 20000);
        assert_eq!(parsed.logging.level, "debug");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = SocConfig::load(Path::new("/nonexistent/hdmi2eth.toml"));
        assert_eq!(cfg.network.control_port, 20000);
    }
}
