//! # hdmi2eth: SoC runtime
//!
//! Runs the HDMI2ETH fabric on the host: builds the SoC from a TOML
//! configuration, serves the remote bus bridge on the control port and
//! streams captured video on the bulk port.
//!
//! Without real video front ends, each capture input is fed by a
//! test-pattern source and the playback FIFOs are drained at the output.

pub mod config;
pub mod service;
