// SPDX-License-Identifier: MIT OR Apache-2.0

//! Static configuration of physical and virtual devices.
//!
//! A [`HalConfig`] is normally read from a TOML file:
//!
//! ```toml
//! [[pdevices]]
//! number_of_slots = 64
//! permit_powerdown = true
//!
//! [pdevices.timeouts]
//! init_ack_ms = 500
//! ```
//!
//! Every field that is left out takes the value the firmware is normally started with.

/* ---------------------------------------------------------------------------------------------- */

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/* ---------------------------------------------------------------------------------------------- */

/// Firmware handshake timeouts, in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait for the first acknowledge after the core is started.
    pub init_ack_ms: u64,
    /// Wait for a mailbox command (live start/stop, PID table update, init parameters).
    pub mailbox_ack_ms: u64,
    /// Wait for a TP sync handshake.
    pub tp_sync_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> TimeoutConfig {
        TimeoutConfig {
            init_ack_ms: 2000,
            mailbox_ack_ms: 100,
            tp_sync_ms: 1,
        }
    }
}

impl TimeoutConfig {
    pub fn init_ack(&self) -> Duration {
        Duration::from_millis(self.init_ack_ms)
    }

    pub fn mailbox_ack(&self) -> Duration {
        Duration::from_millis(self.mailbox_ack_ms)
    }

    pub fn tp_sync(&self) -> Duration {
        Duration::from_millis(self.tp_sync_ms)
    }
}

/// Resources of one physical transport processor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PDeviceConfig {
    pub number_of_vdevices: u32,
    pub number_of_slots: u32,
    pub number_of_section_filters: u32,
    pub number_of_dma_structures: u32,
    pub number_of_indexers: u32,
    pub number_of_status_blks: u32,
    pub number_of_live_channels: u32,
    pub number_of_software_injectors: u32,

    /// Whether the firmware may power the core down, saving its shared memory.
    pub permit_powerdown: bool,
    /// Bypass the secure coprocessor (no key-ladder driver in the system).
    pub secure_coprocessor_bypass: bool,
    pub software_leaky_pid: bool,
    /// Slow-rate stream timeout handed to the firmware when `software_leaky_pid` is set.
    pub software_leaky_pid_timeout: u32,
    /// Low nibble is written into the firmware config as the timer counter divider.
    pub timer_counter_divider: u32,

    /// Status blocks the event queue may hold before the oldest are dropped.
    pub event_queue_depth: usize,

    pub timeouts: TimeoutConfig,
}

impl Default for PDeviceConfig {
    fn default() -> PDeviceConfig {
        PDeviceConfig {
            number_of_vdevices: 8,
            number_of_slots: 128,
            number_of_section_filters: 128,
            number_of_dma_structures: 128,
            number_of_indexers: 16,
            number_of_status_blks: 128,
            number_of_live_channels: 1,
            number_of_software_injectors: 4,
            permit_powerdown: false,
            secure_coprocessor_bypass: true,
            software_leaky_pid: false,
            software_leaky_pid_timeout: 0xFFFF_FFFF,
            timer_counter_divider: 0,
            event_queue_depth: 64,
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// The transport stream flavour a vDevice demultiplexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Dvb,
    A3,
    Dss,
}

impl TransportProtocol {
    /// Packet size on the wire, before any tagging.
    pub fn packet_size(self) -> u8 {
        match self {
            TransportProtocol::Dvb | TransportProtocol::A3 => 188,
            TransportProtocol::Dss => 130,
        }
    }
}

/// Allocation parameters of a vDevice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VDeviceConfig {
    pub number_of_slots: u32,
    pub number_of_section_filters: u32,
    pub protocol: TransportProtocol,
    pub packet_size: u8,
    /// Input stream feeding the vDevice, `None` until it is connected.
    pub stream_id: Option<u32>,
    /// Discard sections failing their CRC on every section slot of the vDevice.
    pub force_discard_on_crc_error: bool,
}

impl Default for VDeviceConfig {
    fn default() -> VDeviceConfig {
        VDeviceConfig {
            number_of_slots: 32,
            number_of_section_filters: 32,
            protocol: TransportProtocol::Dvb,
            packet_size: 188,
            stream_id: None,
            force_discard_on_crc_error: false,
        }
    }
}

/// The configuration of every physical device managed by a [`Hal`](crate::hal::Hal).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalConfig {
    pub pdevices: Vec<PDeviceConfig>,
}

impl HalConfig {
    pub fn from_toml_str(text: &str) -> Result<HalConfig> {
        Ok(toml::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<HalConfig> {
        let text = fs::read_to_string(path)?;
        HalConfig::from_toml_str(&text)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
