// SPDX-License-Identifier: MIT OR Apache-2.0

//! The demux HAL proper.
//!
//! A [`Hal`] owns one [`PDevice`](pdevice::PDevice) per transport processor. Every object the HAL
//! hands out is named by a [`Handle`]; handles are resolved against the state of the pDevice they
//! belong to, under that pDevice's readers-writer lock. Operations that change anything the
//! firmware can see take the write lock for their whole duration, so a multi-step change (moving a
//! slot between PID chains, reprogramming a filter on every slot it is attached to) is never
//! observed half done by another caller.
//!
//! The generic verbs [`Hal::allocate`], [`Hal::associate`], [`Hal::disassociate`] and
//! [`Hal::deallocate`] apply to every kind of object. Kind-specific operations live next to the
//! engine that implements them and are prefixed with the kind: [`Hal::slot_set_pid`],
//! [`Hal::buffer_read`], [`Hal::signal_wait`], and so on.

/* ---------------------------------------------------------------------------------------------- */

pub mod buffer;
pub mod dataentry;
pub mod event;
pub mod filter;
pub mod index;
pub mod injector;
pub mod pdevice;
pub mod signal;
pub mod slot;
pub mod vdevice;
mod zone;

use std::sync::Arc;

use log::{debug, warn};

use crate::backends::TpBackend;
use crate::config::{HalConfig, VDeviceConfig};
use crate::error::{Error, Result};
use crate::objman::{self, Handle, Links, ObjectCallbacks, ObjectKind};
use crate::tsinput::TsInput;

pub use buffer::{BufferConfig, BufferStatus, ReadQuantisation, ReadResult, UnitMetadata};
pub use dataentry::{DataEntryConfig, DataEntryParams};
pub use event::{EventHandler, EventRecord, EventType};
pub use filter::{FilterType, FilterUpdate, SectionMetadata};
pub use index::{IndexEventData, StartCode};
pub use injector::{InjectionTags, InjectorConfig};
pub use pdevice::{PDevice, PDeviceCapability, PDeviceState, PowerState, TpStatus};
pub use slot::{SecondaryPidMode, SlotConfig, SlotEvent, SlotFeature, SlotMode, SlotState};
pub use vdevice::{StreamStatistics, VDeviceCapability, VDeviceFeature};

/* ---------------------------------------------------------------------------------------------- */

/// PID value of a slot that is not collecting anything.
pub const PID_INVALID: u16 = 0xE000;

/// PID value matching every packet of the stream.
pub const PID_WILDCARD: u16 = 0x2000;

/// Firmware "no slot / no DMA / no indexer" index.
pub(crate) const NO_INDEX: u16 = 0xFFFF;

/// What to create, and how.
#[derive(Clone, Debug)]
pub enum AllocParams {
    VDevice {
        config: VDeviceConfig,
        handler: Arc<dyn EventHandler>,
    },
    Session,
    Container,
    SoftwareInjector(InjectorConfig),
    Buffer(BufferConfig),
    Filter(FilterType),
    Signal,
    Index,
    Slot(SlotConfig),
    DataEntry(DataEntryConfig),
}

impl AllocParams {
    pub fn kind(&self) -> ObjectKind {
        match self {
            AllocParams::VDevice { .. } => ObjectKind::VDevice,
            AllocParams::Session => ObjectKind::Session,
            AllocParams::Container => ObjectKind::Container,
            AllocParams::SoftwareInjector(_) => ObjectKind::SoftwareInjector,
            AllocParams::Buffer(_) => ObjectKind::Buffer,
            AllocParams::Filter(_) => ObjectKind::Filter,
            AllocParams::Signal => ObjectKind::Signal,
            AllocParams::Index => ObjectKind::Index,
            AllocParams::Slot(_) => ObjectKind::Slot,
            AllocParams::DataEntry(_) => ObjectKind::DataEntry,
        }
    }

    /// The kind of object this one must be created under.
    fn parent_kind(&self) -> ObjectKind {
        match self.kind() {
            ObjectKind::VDevice => ObjectKind::PDevice,
            ObjectKind::Session => ObjectKind::VDevice,
            _ => ObjectKind::Session,
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Every transport processor in the system, and the objects allocated on them.
#[derive(Debug)]
pub struct Hal {
    pdevices: Vec<PDevice>,
}

impl Hal {
    /// Brings up one pDevice per entry of `config.pdevices`, each on the backend at the same
    /// position in `backends`.
    pub fn new(
        config: &HalConfig,
        backends: Vec<Arc<dyn TpBackend>>,
        ts_input: Arc<dyn TsInput>,
    ) -> Result<Hal> {
        if config.pdevices.len() != backends.len() || backends.len() > usize::from(u8::MAX) {
            return Err(Error::BadParameter);
        }

        let pdevices = config
            .pdevices
            .iter()
            .zip(backends)
            .enumerate()
            .map(|(i, (config, backend))| {
                PDevice::new(i as u8, config.clone(), backend, Arc::clone(&ts_input))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Hal { pdevices })
    }

    pub fn number_of_pdevices(&self) -> usize {
        self.pdevices.len()
    }

    /// The root handle of a pDevice, parent of its vDevices.
    pub fn pdevice_handle(&self, index: u8) -> Result<Handle> {
        self.pdevices
            .get(usize::from(index))
            .map(PDevice::handle)
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn pdevice(&self, handle: Handle) -> Result<&PDevice> {
        self.pdevices
            .get(usize::from(handle.pdevice_index()))
            .ok_or(Error::InvalidHandle)
    }

    /// Runs `f` with the owning pDevice locked for reading.
    pub(crate) fn with_read<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&PDeviceState) -> Result<R>,
    ) -> Result<R> {
        let pdevice = self.pdevice(handle)?;
        let state = pdevice.state().read();
        f(&state)
    }

    /// Runs `f` with the owning pDevice locked for writing.
    pub(crate) fn with_write<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut PDeviceState) -> Result<R>,
    ) -> Result<R> {
        let pdevice = self.pdevice(handle)?;
        let mut state = pdevice.state().write();
        f(&mut state)
    }

    /// Creates an object under `parent`.
    ///
    /// vDevices are created under a pDevice, sessions under a vDevice, and everything else under
    /// a session.
    pub fn allocate(&self, parent: Handle, params: AllocParams) -> Result<Handle> {
        if parent.kind() != params.parent_kind() {
            return Err(Error::BadParameter);
        }
        self.with_write(parent, |state| state.allocate(parent, params))
    }

    pub fn associate(&self, a: Handle, b: Handle) -> Result<()> {
        self.with_write(a, |state| objman::associate(state, a, b))
    }

    /// Disassociates `a` from `b`, or from everything it is associated with when `b` is `None`.
    pub fn disassociate(&self, a: Handle, b: Option<Handle>) -> Result<()> {
        self.with_write(a, |state| objman::disassociate(state, a, b))
    }

    /// Destroys an object. With `force`, its associations and children go first; without, an
    /// object that still has any is [`Error::DeviceBusy`].
    pub fn deallocate(&self, handle: Handle, force: bool) -> Result<()> {
        if handle.kind() == ObjectKind::PDevice {
            return Err(Error::BadParameter);
        }
        self.with_write(handle, |state| objman::deallocate(state, handle, force))
    }

    /// The objects `handle` is associated with, in association order.
    pub fn associated(&self, handle: Handle) -> Result<Vec<Handle>> {
        self.with_read(handle, |state| {
            state.check_handle(handle)?;
            Ok(state.links.associated(handle))
        })
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl PDeviceState {
    pub(crate) fn allocate(&mut self, parent: Handle, params: AllocParams) -> Result<Handle> {
        self.check_handle(parent)?;
        let kind = params.kind();

        let handle = match params {
            AllocParams::VDevice { config, handler } => {
                self.vdevice_allocate(parent, config, handler)?
            }
            AllocParams::Session => {
                let handle = self.sessions.insert(())?;
                self.links.add_child(parent, handle);
                handle
            }
            AllocParams::Container => {
                let handle = self.containers.insert(())?;
                self.links.add_child(parent, handle);
                handle
            }
            AllocParams::SoftwareInjector(config) => self.injector_allocate(parent, config)?,
            AllocParams::Buffer(config) => self.buffer_allocate(parent, config)?,
            AllocParams::Filter(filter_type) => self.filter_allocate(parent, filter_type)?,
            AllocParams::Signal => self.signal_allocate(parent)?,
            AllocParams::Index => self.index_allocate(parent)?,
            AllocParams::Slot(config) => self.slot_allocate(parent, config)?,
            AllocParams::DataEntry(config) => self.data_entry_allocate(parent, config)?,
        };

        debug!("Allocated {:?} under {:?}", handle, parent);
        debug_assert_eq!(handle.kind(), kind);
        Ok(handle)
    }

    /// Removes an object whose allocation failed half way through.
    pub(crate) fn discard(&mut self, handle: Handle) {
        let removed = match handle.kind() {
            ObjectKind::VDevice => self.vdevices.remove(handle).map(drop),
            ObjectKind::Session => self.sessions.remove(handle),
            ObjectKind::Container => self.containers.remove(handle),
            ObjectKind::SoftwareInjector => self.injectors.remove(handle).map(drop),
            ObjectKind::Buffer => self.buffers.remove(handle).map(drop),
            ObjectKind::Filter => self.filters.remove(handle).map(drop),
            ObjectKind::Signal => self.signals.remove(handle).map(drop),
            ObjectKind::Index => self.indexes.remove(handle).map(drop),
            ObjectKind::Slot => self.slots.remove(handle).map(drop),
            ObjectKind::DataEntry => self.data_entries.remove(handle).map(drop),
            ObjectKind::PDevice => Ok(()),
        };
        if removed.is_err() {
            warn!("Discarding unknown object {:?}", handle);
        }
        self.links.forget(handle);
    }
}

impl ObjectCallbacks for PDeviceState {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }

    fn check_handle(&self, handle: Handle) -> Result<()> {
        let live = match handle.kind() {
            ObjectKind::PDevice => handle == self.handle,
            ObjectKind::VDevice => self.vdevices.contains(handle),
            ObjectKind::Session => self.sessions.contains(handle),
            ObjectKind::Container => self.containers.contains(handle),
            ObjectKind::SoftwareInjector => self.injectors.contains(handle),
            ObjectKind::Buffer => self.buffers.contains(handle),
            ObjectKind::Filter => self.filters.contains(handle),
            ObjectKind::Signal => self.signals.contains(handle),
            ObjectKind::Index => self.indexes.contains(handle),
            ObjectKind::Slot => self.slots.contains(handle),
            ObjectKind::DataEntry => self.data_entries.contains(handle),
        };
        if live {
            Ok(())
        } else {
            Err(Error::InvalidHandle)
        }
    }

    fn associator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        // Containers hold anything.
        if handle.kind() == ObjectKind::Container || other.kind() == ObjectKind::Container {
            return Ok(());
        }

        match handle.kind() {
            ObjectKind::Buffer => self.buffer_associator(handle, other),
            ObjectKind::Filter => self.filter_associator(handle, other),
            ObjectKind::Signal => self.signal_associator(handle, other),
            ObjectKind::Index => self.index_associator(handle, other),
            ObjectKind::Slot => self.slot_associator(handle, other),
            ObjectKind::DataEntry => self.data_entry_associator(handle, other),
            _ => Err(Error::BadParameter),
        }
    }

    fn disassociator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        if handle.kind() == ObjectKind::Container || other.kind() == ObjectKind::Container {
            return Ok(());
        }

        match handle.kind() {
            ObjectKind::Buffer => self.buffer_disassociator(handle, other),
            ObjectKind::Filter => self.filter_disassociator(handle, other),
            ObjectKind::Signal => self.signal_disassociator(handle, other),
            ObjectKind::Index => self.index_disassociator(handle, other),
            ObjectKind::Slot => self.slot_disassociator(handle, other),
            ObjectKind::DataEntry => self.data_entry_disassociator(handle, other),
            _ => {
                warn!("{:?} cannot be associated with {:?}", handle, other);
                Ok(())
            }
        }
    }

    fn deallocator(&mut self, handle: Handle) -> Result<()> {
        debug!("Deallocating {:?}", handle);
        match handle.kind() {
            ObjectKind::PDevice => Err(Error::BadParameter),
            ObjectKind::VDevice => self.vdevice_deallocate(handle),
            ObjectKind::Session => self.sessions.remove(handle),
            ObjectKind::Container => self.containers.remove(handle),
            ObjectKind::SoftwareInjector => self.injector_deallocate(handle),
            ObjectKind::Buffer => self.buffer_deallocate(handle),
            ObjectKind::Filter => self.filter_deallocate(handle),
            ObjectKind::Signal => self.signal_deallocate(handle),
            ObjectKind::Index => self.index_deallocate(handle),
            ObjectKind::Slot => self.slot_deallocate(handle),
            ObjectKind::DataEntry => self.data_entry_deallocate(handle),
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Scaffolding shared by the engine tests: a HAL on a simulated transport processor.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backends::simulated::SimulatedTp;
    use crate::config::{PDeviceConfig, TimeoutConfig};
    use crate::tsinput::NullTsInput;

    #[derive(Debug, Default)]
    pub struct NoEvents;

    impl EventHandler for NoEvents {}

    pub fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    pub fn small_pdevice() -> PDeviceConfig {
        PDeviceConfig {
            number_of_vdevices: 2,
            number_of_slots: 16,
            number_of_section_filters: 16,
            number_of_dma_structures: 8,
            number_of_indexers: 4,
            number_of_status_blks: 8,
            number_of_software_injectors: 2,
            timeouts: TimeoutConfig {
                tp_sync_ms: 100,
                ..TimeoutConfig::default()
            },
            ..PDeviceConfig::default()
        }
    }

    /// A vDevice that fits twice into [`small_pdevice`].
    pub fn small_vdevice() -> VDeviceConfig {
        VDeviceConfig {
            number_of_slots: 8,
            number_of_section_filters: 8,
            ..VDeviceConfig::default()
        }
    }

    pub struct Rig {
        pub tp: Arc<SimulatedTp>,
        pub hal: Hal,
        pub pdevice: Handle,
        pub vdevice: Handle,
        pub session: Handle,
    }

    pub fn rig_with(pdevice: PDeviceConfig, vdevice: VDeviceConfig, ts_input: Arc<dyn TsInput>) -> Rig {
        rig_with_handler(pdevice, vdevice, ts_input, Arc::new(NoEvents))
    }

    pub fn rig_with_handler(
        pdevice: PDeviceConfig,
        vdevice: VDeviceConfig,
        ts_input: Arc<dyn TsInput>,
        handler: Arc<dyn EventHandler>,
    ) -> Rig {
        init_logging();
        let tp = Arc::new(SimulatedTp::new().unwrap());
        let config = HalConfig {
            pdevices: vec![pdevice],
        };
        let hal = Hal::new(&config, vec![tp.clone() as Arc<dyn TpBackend>], ts_input).unwrap();
        let pdevice = hal.pdevice_handle(0).unwrap();
        let vdevice = hal
            .allocate(
                pdevice,
                AllocParams::VDevice {
                    config: vdevice,
                    handler,
                },
            )
            .unwrap();
        let session = hal.allocate(vdevice, AllocParams::Session).unwrap();

        Rig {
            tp,
            hal,
            pdevice,
            vdevice,
            session,
        }
    }

    pub fn rig() -> Rig {
        rig_with(small_pdevice(), small_vdevice(), Arc::new(NullTsInput))
    }

    impl Rig {
        pub fn slot(&self, mode: SlotMode) -> Handle {
            self.hal
                .allocate(
                    self.session,
                    AllocParams::Slot(SlotConfig {
                        mode,
                        ..SlotConfig::default()
                    }),
                )
                .unwrap()
        }

        pub fn buffer(&self, size: u32) -> Handle {
            self.hal
                .allocate(
                    self.session,
                    AllocParams::Buffer(BufferConfig {
                        size,
                        ..BufferConfig::default()
                    }),
                )
                .unwrap()
        }

        pub fn filter(&self, filter_type: FilterType) -> Handle {
            self.hal
                .allocate(self.session, AllocParams::Filter(filter_type))
                .unwrap()
        }

        /// DMA index the firmware knows a buffer by.
        pub fn dma_index(&self, buffer: Handle) -> u16 {
            self.hal
                .with_read(buffer, |s| Ok(s.buffers.get(buffer)?.buffer_index))
                .unwrap()
                .expect("buffer not associated")
        }

        pub fn slot_index(&self, slot: Handle) -> u16 {
            self.hal
                .with_read(slot, |s| Ok(s.slots.get(slot)?.slot_index))
                .unwrap()
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
