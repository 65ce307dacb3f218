// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transport stream input block (frontend) feeding packets to the transport processor.
//!
//! The HAL tells the frontend which PIDs to let through for each input stream, so that packets
//! nobody collects are dropped before they reach the transport processor.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::Debug;

use crate::error::{Error, Result};

/* ---------------------------------------------------------------------------------------------- */

/// Stream ID of a vDevice that is not connected to any input.
pub const STREAM_ID_NONE: u32 = 0x0000_FFFF;

/// Part of the stream ID the firmware compares against packet tags.
pub const STREAM_TAG_MASK: u32 = 0x0000_FFFF;

/// Power states of the frontend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TsInputPowerState {
    Running,
    Sleeping,
    Powerdown,
}

/// An arrival time in 27 MHz ticks, split the way packet tags carry it: a 33-bit count of 300-tick
/// periods plus the remainder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Clk27MHz {
    pub div300_bit32: u32,
    pub div300_bit31to0: u32,
    pub modulus300: u16,
}

impl Clk27MHz {
    /// Decodes the two tag words the input block prefixes to each packet.
    ///
    /// DLNA TTS tags are recognised by an all-ones low half-word and carry a big-endian 27 MHz
    /// counter in the second word. Anything else is an STFE tag.
    pub fn from_tag(word0: u32, word1: u32) -> Clk27MHz {
        if word0 & 0xFFFF == 0xFFFF {
            let counter = word1.swap_bytes();
            Clk27MHz {
                div300_bit32: 0,
                div300_bit31to0: counter / 300,
                modulus300: (counter % 300) as u16,
            }
        } else {
            Clk27MHz {
                div300_bit32: (word1 & 0x200) >> 9,
                div300_bit31to0: ((word1 & 0x1FF) << 23) | (word0 >> 9),
                modulus300: (word0 & 0x1FF) as u16,
            }
        }
    }

    /// The full 42-bit tick count.
    pub fn ticks(&self) -> u64 {
        let base = (u64::from(self.div300_bit32) << 32) | u64::from(self.div300_bit31to0);
        base * 300 + u64::from(self.modulus300)
    }
}

/// Timer value of an input, as returned by [`TsInput::get_timer`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputTimer {
    pub clock: Clk27MHz,
    pub system_time_us: u64,
    /// Whether the input is a timestamping input block.
    pub is_tsin: bool,
}

/// Operations the HAL needs from the frontend.
pub trait TsInput: Debug + Send + Sync {
    /// Starts (`set`) or stops letting `pid` through on `stream_id`, on behalf of `pdevice`.
    ///
    /// Calls are reference counted by the frontend, so each `set` must be balanced by a clear.
    fn set_clear_pid(&self, pdevice: u8, stream_id: u32, pid: u16, set: bool) -> Result<()>;

    fn map_hw(&self) -> Result<()>;

    fn unmap_hw(&self) -> Result<()>;

    fn set_power_state(&self, state: TsInputPowerState) -> Result<()>;

    /// Tells the frontend a transport processor came up or is going down.
    fn notify_pdevice_power_state(&self, pdevice: u8, power_on: bool) -> Result<()>;

    fn get_timer(&self, stream_id: u32) -> Result<InputTimer>;
}

/// A frontend that accepts everything, for systems where inputs are configured elsewhere.
#[derive(Debug, Default)]
pub struct NullTsInput;

impl TsInput for NullTsInput {
    fn set_clear_pid(&self, _pdevice: u8, _stream_id: u32, _pid: u16, _set: bool) -> Result<()> {
        Ok(())
    }

    fn map_hw(&self) -> Result<()> {
        Ok(())
    }

    fn unmap_hw(&self) -> Result<()> {
        Ok(())
    }

    fn set_power_state(&self, _state: TsInputPowerState) -> Result<()> {
        Ok(())
    }

    fn notify_pdevice_power_state(&self, _pdevice: u8, _power_on: bool) -> Result<()> {
        Ok(())
    }

    fn get_timer(&self, _stream_id: u32) -> Result<InputTimer> {
        Err(Error::FeatureNotSupported)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
