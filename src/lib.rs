// SPDX-License-Identifier: MIT OR Apache-2.0

//! A hardware abstraction layer for the TANGO transport-processor demultiplexer.
//!
//! A transport processor (TP) is a small core running firmware that filters MPEG transport
//! streams. The host and the firmware talk through a block of shared memory, the _interface_,
//! holding tables of slots, section filters, DMA descriptors, indexers and status blocks, plus a
//! mailbox and an interrupt line. This crate owns that interface and exposes it as a tree of
//! objects:
//!
//! 1. A __pDevice__ is one physical transport processor;
//! 2. A __vDevice__ is a partition of a pDevice, demultiplexing one input stream;
//! 3. A __session__ groups the objects a client allocates on a vDevice;
//! 4. __Slots__ collect the packets of one PID, __filters__ select sections or PES units,
//!    __buffers__ receive the output, __indexes__ report start codes and transport events,
//!    __signals__ wake readers, __data entries__ insert packets, and __software injectors__ play
//!    host memory through the TP.
//!
//! Every object is named by a [`Handle`](objman::Handle). The generic verbs
//! [`allocate`](hal::Hal::allocate), [`associate`](hal::Hal::associate),
//! [`disassociate`](hal::Hal::disassociate) and [`deallocate`](hal::Hal::deallocate) work on all
//! of them; kind-specific operations are prefixed with the kind, as in
//! [`slot_set_pid`](hal::Hal::slot_set_pid) or [`buffer_read`](hal::Hal::buffer_read).
//!
//! The firmware side is reached through a [`TpBackend`](backends::TpBackend). The crate comes with
//! [`SimulatedTp`](backends::simulated::SimulatedTp), a software transport processor that is good
//! enough to drive every engine of the HAL from tests. The TS input block feeding the TPs is
//! reached through [`TsInput`](tsinput::TsInput).
//!
//! ## Configuration
//!
//! Resource counts and timeouts come from a [`HalConfig`](config::HalConfig), which can be read
//! from TOML:
//!
//! ```toml
//! [[pdevices]]
//! number_of_vdevices = 4
//! number_of_slots = 64
//! permit_powerdown = true
//!
//! [pdevices.timeouts]
//! tp_sync_ms = 50
//! ```
//!
//! Fields left out take their defaults.
//!
//! ## Example
//!
//! Collecting the packets of one PID into a buffer and reading them back:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stpti_hal::backends::simulated::SimulatedTp;
//! use stpti_hal::backends::TpBackend;
//! use stpti_hal::config::{HalConfig, VDeviceConfig};
//! use stpti_hal::hal::{
//!     AllocParams, BufferConfig, EventHandler, Hal, ReadQuantisation, SlotConfig, SlotMode,
//! };
//! use stpti_hal::tsinput::NullTsInput;
//!
//! #[derive(Debug)]
//! struct Events;
//!
//! impl EventHandler for Events {}
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HalConfig::load("/etc/stpti.toml")?;
//!     let tp: Arc<dyn TpBackend> = Arc::new(SimulatedTp::new()?);
//!     let hal = Hal::new(&config, vec![tp], Arc::new(NullTsInput))?;
//!
//!     let pdevice = hal.pdevice_handle(0)?;
//!     let vdevice = hal.allocate(
//!         pdevice,
//!         AllocParams::VDevice {
//!             config: VDeviceConfig::default(),
//!             handler: Arc::new(Events),
//!         },
//!     )?;
//!     let session = hal.allocate(vdevice, AllocParams::Session)?;
//!
//!     let slot = hal.allocate(
//!         session,
//!         AllocParams::Slot(SlotConfig {
//!             mode: SlotMode::Raw,
//!             ..SlotConfig::default()
//!         }),
//!     )?;
//!     let buffer = hal.allocate(session, AllocParams::Buffer(BufferConfig::default()))?;
//!     hal.associate(slot, buffer)?;
//!     hal.slot_set_pid(slot, 0x100)?;
//!
//!     let signal = hal.allocate(session, AllocParams::Signal)?;
//!     hal.associate(signal, buffer)?;
//!     hal.buffer_set_threshold(buffer, 188)?;
//!
//!     let ready = hal.signal_wait(signal, Some(1000))?;
//!     let mut packet = [0u8; 188];
//!     let read = hal.buffer_read(ready, ReadQuantisation::AsUnits, None, 0, &mut packet, &mut [])?;
//!     hal.buffer_set_read_offset(ready, read.next_read_offset)?;
//!
//!     hal.deallocate(session, true)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Shared memory
//!
//! The interface tables are laid out with the `tp_struct!` macro, which generates typed accessors
//! over a [`TpRegion`](regions::TpRegion). All accesses are volatile and little-endian. Records the
//! firmware reads while the host writes them are published and retired through
//! [`regions::structured`], which orders the writes around the record's state word.
//!
//! ## Testing
//!
//! With the `test-mocks` feature, [`mocks`] provides mockall mocks of
//! [`TsInput`](tsinput::TsInput) and [`EventHandler`](hal::EventHandler).

/* ---------------------------------------------------------------------------------------------- */

#![cfg_attr(feature = "_unsafe-op-in-unsafe-fn", deny(unsafe_op_in_unsafe_fn))]
#![cfg_attr(not(feature = "_unsafe-op-in-unsafe-fn"), allow(unused_unsafe))]

pub mod backends;
pub mod config;
pub mod error;
pub mod hal;
pub mod interface;
pub mod objman;
pub mod partition;
pub mod regions;
pub mod sync;
pub mod tsinput;

#[cfg(any(test, feature = "test-mocks"))]
pub mod mocks;

/* ---------------------------------------------------------------------------------------------- */
