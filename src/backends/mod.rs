// SPDX-License-Identifier: MIT OR Apache-2.0

//! Backends give the HAL access to a transport processor: its shared memory, clocks, firmware,
//! mailboxes and DMA-able memory.
//!
//! A hardware backend wraps the platform device. [`SimulatedTp`](simulated::SimulatedTp) is a
//! software transport processor that speaks the same shared-memory protocol, used for tests and
//! for running the HAL without hardware.

/* ---------------------------------------------------------------------------------------------- */

pub mod simulated;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::regions::{SharedMemory, TpRegion};

/* ---------------------------------------------------------------------------------------------- */

/// Memory the transport processor can DMA into, and the address it knows it by.
#[derive(Clone, Debug)]
pub struct DmaAllocation {
    /// Address the firmware uses. Only the low 32 bits are ever visible to it.
    pub device_address: u32,
    pub memory: Arc<SharedMemory>,
}

impl DmaAllocation {
    pub fn len(&self) -> u64 {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Called from interrupt context whenever the TP-to-host mailbox has something for the host.
pub type InterruptCallback = Box<dyn Fn() + Send + Sync>;

/// The capability set of one transport processor.
pub trait TpBackend: Debug + Send + Sync {
    /// The dDEM region holding the firmware interface block and every table it points to.
    fn shared_memory(&self) -> Arc<SharedMemory>;

    fn enable_clocks(&self) -> Result<()>;

    fn disable_clocks(&self) -> Result<()>;

    /// Loads the firmware image into the core. The core stays halted.
    fn load_firmware(&self) -> Result<()>;

    /// Starts the core, or resumes it if it was halted with its firmware still loaded.
    fn start(&self) -> Result<()>;

    /// Stops the core, keeping its firmware and shared memory. Used before gating clocks.
    fn halt(&self) -> Result<()>;

    /// Halts the core and puts it back into its reset state.
    fn reset(&self) -> Result<()>;

    /// Raises bits in the host-to-TP mailbox. Any acknowledge still pending from an earlier
    /// command is discarded.
    fn post_mailbox(&self, bits: u32) -> Result<()>;

    /// Waits for the firmware to acknowledge the last mailbox command, or for the first
    /// acknowledge after the core was started.
    fn wait_for_ack(&self, timeout: Duration) -> Result<()>;

    /// Reads and clears the TP-to-host mailbox.
    fn read_interrupt_status(&self) -> u32;

    /// Gives the firmware a chance to look at shared memory and blocks until it has done so, or
    /// until `timeout` elapses. Used to pace handshakes that poll a shared-memory word.
    fn wait_for_update(&self, timeout: Duration);

    /// Current value of the timer counter the firmware uses for packet timestamps.
    fn read_timer_counter(&self) -> u32;

    /// Cycles the core has executed since it was started.
    fn cycle_count(&self) -> u64;

    fn allocate_dma(&self, size: usize) -> Result<DmaAllocation>;

    fn free_dma(&self, device_address: u32);

    fn set_interrupt_callback(&self, callback: Option<InterruptCallback>);
}

/* ---------------------------------------------------------------------------------------------- */
