// SPDX-License-Identifier: MIT OR Apache-2.0

//! The physical device: one transport processor, its firmware, and everything allocated on it.
//!
//! [`PDeviceState`] holds the host-side mirror of every object together with the [`Tp`] view of
//! shared memory. It is the unit of locking: a [`PDevice`] wraps it in a readers-writer lock and
//! owns the event task that turns firmware status blocks into [`EventHandler`] calls.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::backends::TpBackend;
use crate::config::PDeviceConfig;
use crate::error::{Error, Result};
use crate::hal::buffer::Buffer;
use crate::hal::dataentry::DataEntry;
use crate::hal::event::{self, EventMsg};
use crate::hal::filter::Filter;
use crate::hal::index::Index;
use crate::hal::injector::SoftwareInjector;
use crate::hal::signal::Signal;
use crate::hal::slot::{self, Slot};
use crate::hal::vdevice::VDevice;
use crate::hal::{Hal, NO_INDEX, PID_INVALID};
use crate::interface::{
    firmware_config, mailbox_h2tp, mailbox_tp2h, read_version, sync_clear, version_is_compatible,
    InterfaceBlock, StatusBlock, Tp, TpLayout, ACTIVITY_COUNTER_RESET, MAX_NUMBER_OF_VDEVICES,
    NUMBER_OF_PLAYBACK_CHANNELS, NUMBER_OF_STARTABLE_PLAYBACK_CHANNELS, PES_MARKER_INIT_DATA,
    SHARED_MEMORY_INTERFACE_CHECKSUM, SIGNALLING_QUEUE_LENGTH, SYNC_TP_SYNCHRONISED,
};
use crate::objman::{Arena, Handle, IndexList, Links, ObjectKind};
use crate::partition::PartitionedResource;
use crate::regions::{BackedByTpSubregion, TpRegion};
use crate::sync::MessageQueue;
use crate::tsinput::TsInput;

/* ---------------------------------------------------------------------------------------------- */

/// Limit on objects that have no firmware-side table of their own.
const OBJECT_LIMIT: usize = 1024;

/// Where the firmware is in its life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TpStatus {
    NoFirmware,
    Stopped,
    AwaitingInitialisation,
    Running,
    Sleeping,
    Powerdown,
}

/// Power states a caller may ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    Started,
    Sleeping,
    Stopped,
    Powerdown,
}

/// Resources the running firmware actually provides.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PDeviceCapability {
    pub number_of_vdevices: u32,
    pub number_of_slots: u32,
    pub number_of_section_filters: u32,
    pub number_of_dma_structures: u32,
    pub number_of_indexers: u32,
    pub number_of_status_blks: u32,
    pub number_of_software_injectors: u32,
    pub number_of_pids: u32,
}

/* ---------------------------------------------------------------------------------------------- */

pub struct PDeviceState {
    pub(crate) index: u8,
    pub(crate) handle: Handle,
    pub(crate) config: PDeviceConfig,
    pub(crate) backend: Arc<dyn TpBackend>,
    pub(crate) ts_input: Arc<dyn TsInput>,

    pub(crate) status: TpStatus,
    pub(crate) tp: Option<Tp>,
    pub(crate) backup: Option<Vec<u8>>,
    pub(crate) sw_leaky_pid_enabled: bool,

    pub(crate) links: Links,
    pub(crate) vdevices: Arena<VDevice>,
    pub(crate) sessions: Arena<()>,
    pub(crate) containers: Arena<()>,
    pub(crate) injectors: Arena<SoftwareInjector>,
    pub(crate) buffers: Arena<Buffer>,
    pub(crate) filters: Arena<Filter>,
    pub(crate) signals: Arena<Signal>,
    pub(crate) indexes: Arena<Index>,
    pub(crate) slots: Arena<Slot>,
    pub(crate) data_entries: Arena<DataEntry>,

    /// Slots by firmware slot index.
    pub(crate) slot_handles: IndexList,
    /// Buffers by firmware DMA index.
    pub(crate) buffer_handles: IndexList,
    /// Indexes by firmware indexer index.
    pub(crate) index_handles: IndexList,
    /// Software injectors by playback channel.
    pub(crate) injector_handles: IndexList,

    pub(crate) pid_partitions: PartitionedResource,
    pub(crate) cam_partitions: PartitionedResource,

    pub(crate) events: Arc<MessageQueue<EventMsg>>,
    pub(crate) events_lost: AtomicU64,
}

impl Debug for PDeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PDeviceState")
            .field("index", &self.index)
            .field("status", &self.status)
            .field("vdevices", &self.vdevices.len())
            .field("slots", &self.slots.len())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

impl PDeviceState {
    fn new(
        index: u8,
        config: PDeviceConfig,
        backend: Arc<dyn TpBackend>,
        ts_input: Arc<dyn TsInput>,
        events: Arc<MessageQueue<EventMsg>>,
    ) -> Result<PDeviceState> {
        if config.number_of_vdevices == 0 || config.number_of_slots == 0 {
            return Err(Error::BadParameter);
        }

        let vdevices = config.number_of_vdevices.min(MAX_NUMBER_OF_VDEVICES) as usize;
        let slots = config.number_of_slots as usize;
        let injectors = config
            .number_of_software_injectors
            .min(NUMBER_OF_STARTABLE_PLAYBACK_CHANNELS) as usize;

        Ok(PDeviceState {
            index,
            handle: Handle::new(index, ObjectKind::PDevice, 0, 1),
            backend,
            ts_input,
            status: TpStatus::NoFirmware,
            tp: None,
            backup: None,
            sw_leaky_pid_enabled: false,
            links: Links::default(),
            vdevices: Arena::new(index, ObjectKind::VDevice, vdevices),
            sessions: Arena::new(index, ObjectKind::Session, OBJECT_LIMIT),
            containers: Arena::new(index, ObjectKind::Container, OBJECT_LIMIT),
            injectors: Arena::new(index, ObjectKind::SoftwareInjector, injectors),
            buffers: Arena::new(index, ObjectKind::Buffer, OBJECT_LIMIT),
            filters: Arena::new(index, ObjectKind::Filter, OBJECT_LIMIT),
            signals: Arena::new(index, ObjectKind::Signal, OBJECT_LIMIT),
            indexes: Arena::new(index, ObjectKind::Index, config.number_of_indexers as usize),
            slots: Arena::new(index, ObjectKind::Slot, slots),
            data_entries: Arena::new(index, ObjectKind::DataEntry, OBJECT_LIMIT),
            slot_handles: IndexList::new(slots),
            buffer_handles: IndexList::new(config.number_of_dma_structures as usize),
            index_handles: IndexList::new(config.number_of_indexers as usize),
            injector_handles: IndexList::new(injectors),
            pid_partitions: PartitionedResource::new(0, number_of_pids(&config), vdevices)?,
            cam_partitions: PartitionedResource::new(
                0,
                config.number_of_section_filters,
                vdevices,
            )?,
            events,
            events_lost: AtomicU64::new(0),
            config,
        })
    }

    /// The firmware tables, as long as the firmware is running.
    pub(crate) fn tp(&self) -> Result<Tp> {
        match (&self.tp, self.status) {
            (Some(tp), TpStatus::Running) => Ok(tp.clone()),
            _ => Err(Error::InterfaceUnavailable),
        }
    }

    pub fn status(&self) -> TpStatus {
        self.status
    }

    pub fn config(&self) -> &PDeviceConfig {
        &self.config
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Loads and starts the firmware, hands it its initialisation parameters and leaves it asleep
    /// until the first vDevice is allocated.
    pub(crate) fn initialise(&mut self) -> Result<()> {
        self.backend.enable_clocks()?;
        self.backend.load_firmware()?;
        self.status = TpStatus::Stopped;

        self.boot()?;
        self.supply_init_params(true)?;
        let tp = self.tp.clone().ok_or(Error::InterfaceUnavailable)?;
        initialise_tables(&tp)?;
        self.status = TpStatus::Running;

        info!(
            "pDevice {}: firmware running, {} vDevices, {} slots, {} pids",
            self.index,
            tp.layout().number_of_vdevices,
            tp.layout().number_of_slots,
            tp.layout().number_of_pids
        );

        self.sleep()
    }

    /// Starts the core and waits for it to announce itself.
    fn boot(&mut self) -> Result<()> {
        let memory = self.backend.shared_memory();
        let interface = InterfaceBlock::backed_by(&*memory);
        interface.activity_counter().write(ACTIVITY_COUNTER_RESET)?;
        interface.checksum().write(0)?;

        self.backend.start()?;
        if let Err(e) = self.backend.wait_for_ack(self.config.timeouts.init_ack()) {
            error!("pDevice {}: firmware did not start", self.index);
            return Err(e);
        }
        self.status = TpStatus::AwaitingInitialisation;
        Ok(())
    }

    fn firmware_config(&self, reset_shared_memory: bool) -> u32 {
        let c = &self.config;
        let mut value = c.timer_counter_divider & firmware_config::TIMER_COUNTER_MASK;
        if c.timer_counter_divider != 0 {
            value |= firmware_config::USE_TIMER_COUNTER;
        }
        if reset_shared_memory {
            value |= firmware_config::RESET_SHARED_MEMORY;
        }
        if c.permit_powerdown {
            value |= firmware_config::ALLOW_POWERDOWN;
        }
        if c.secure_coprocessor_bypass {
            value |= firmware_config::BYPASS_SECURE_COPRO;
        }
        value
    }

    /// Writes the initialisation parameters, has the firmware lay out its tables, and checks the
    /// result.
    fn supply_init_params(&mut self, reset_shared_memory: bool) -> Result<()> {
        let memory = self.backend.shared_memory();
        let interface = InterfaceBlock::backed_by(&*memory);
        let c = &self.config;

        interface
            .number_of_vdevices()
            .write(c.number_of_vdevices.min(MAX_NUMBER_OF_VDEVICES))?;
        interface.number_of_slots().write(c.number_of_slots)?;
        interface.number_of_pids().write(number_of_pids(c))?;
        interface.number_of_section_filters().write(c.number_of_section_filters)?;
        interface.number_of_dma_structures().write(c.number_of_dma_structures)?;
        interface.number_of_indexers().write(c.number_of_indexers)?;
        interface.number_of_status_blks().write(c.number_of_status_blks)?;
        interface.number_of_live_channels().write(c.number_of_live_channels)?;
        interface.slow_rate_stream_timeout().write(if c.software_leaky_pid {
            c.software_leaky_pid_timeout
        } else {
            0
        })?;
        interface
            .firmware_config()
            .write(self.firmware_config(reset_shared_memory))?;

        self.backend.post_mailbox(mailbox_h2tp::SUPPLYING_INIT_PARAMS)?;
        if let Err(e) = self.backend.wait_for_ack(self.config.timeouts.mailbox_ack()) {
            error!("pDevice {}: firmware did not take its parameters", self.index);
            return Err(e);
        }

        let version = read_version(&interface)?;
        if !version_is_compatible(&version) {
            error!("pDevice {}: incompatible firmware {:?}", self.index, version);
            return Err(Error::FeatureNotSupported);
        }
        let checksum = interface.checksum().read()?;
        if checksum != SHARED_MEMORY_INTERFACE_CHECKSUM {
            error!(
                "pDevice {}: shared memory interface mismatch (firmware {:#x}, host {:#x})",
                self.index, checksum, SHARED_MEMORY_INTERFACE_CHECKSUM
            );
            return Err(Error::FeatureNotSupported);
        }

        let layout = TpLayout::read(&interface)?;
        if layout.number_of_vdevices == 0 {
            error!("pDevice {}: requested tables do not fit in dDEM", self.index);
            return Err(Error::NoMemory);
        }

        debug!("pDevice {}: firmware {} laid out {:?}", self.index, version, layout);
        self.tp = Some(Tp::new(memory, layout));
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    pub(crate) fn set_power_state(&mut self, target: PowerState) -> Result<()> {
        use PowerState as P;
        use TpStatus as S;

        debug!("pDevice {}: {:?} -> {:?}", self.index, self.status, target);
        match (target, self.status) {
            (P::Started, S::Running) | (P::Sleeping, S::Sleeping) => Ok(()),
            (P::Started, S::Sleeping) => self.wakeup(),
            (P::Sleeping, S::Running) => self.sleep(),
            (P::Sleeping, S::Powerdown) | (P::Sleeping, S::Stopped) => {
                self.power_up()?;
                self.sleep()
            }
            (P::Powerdown, S::Sleeping) | (P::Stopped, S::Sleeping) => {
                self.wakeup()?;
                self.powerdown(target)
            }
            (P::Powerdown, S::Powerdown)
            | (P::Powerdown, S::Stopped)
            | (P::Stopped, S::Stopped)
            | (P::Stopped, S::Powerdown) => Ok(()),
            _ => Err(Error::FeatureNotSupported),
        }
    }

    fn sleep(&mut self) -> Result<()> {
        if self.config.permit_powerdown {
            self.backend.halt()?;
        }
        self.backend.disable_clocks()?;
        self.status = TpStatus::Sleeping;
        Ok(())
    }

    fn wakeup(&mut self) -> Result<()> {
        self.backend.enable_clocks()?;
        self.backend.start()?;
        self.status = TpStatus::Running;

        if let Err(e) = self.ts_input.notify_pdevice_power_state(self.index, true) {
            warn!("pDevice {}: input did not take the wakeup: {}", self.index, e);
        }
        Ok(())
    }

    fn powerdown(&mut self, target: PowerState) -> Result<()> {
        if self.config.permit_powerdown {
            if target == PowerState::Powerdown {
                let tp = self.tp()?;
                let end = tp.layout().shared_memory + tp.layout().size_of_shared_memory_region;
                self.backup = Some(tp.memory().snapshot(end as usize)?);
            }
            self.backend.reset()?;
        } else {
            self.backend.halt()?;
        }
        self.backend.disable_clocks()?;

        self.status = match target {
            PowerState::Powerdown => TpStatus::Powerdown,
            _ => TpStatus::Stopped,
        };
        if let Err(e) = self.ts_input.notify_pdevice_power_state(self.index, false) {
            warn!("pDevice {}: input did not take the powerdown: {}", self.index, e);
        }
        Ok(())
    }

    fn power_up(&mut self) -> Result<()> {
        if !self.config.permit_powerdown {
            return self.wakeup();
        }

        self.backend.enable_clocks()?;
        self.backend.load_firmware()?;
        self.boot()?;

        match self.backup.take() {
            Some(backup) => {
                self.backend.shared_memory().write_bytes(0, &backup)?;
                self.supply_init_params(false)?;
            }
            None => {
                self.supply_init_params(true)?;
                let tp = self.tp.clone().ok_or(Error::InterfaceUnavailable)?;
                initialise_tables(&tp)?;
            }
        }
        self.status = TpStatus::Running;
        Ok(())
    }

    /// Restarts the firmware without losing shared memory.
    pub(crate) fn firmware_reset(&mut self) -> Result<()> {
        info!("pDevice {}: resetting firmware", self.index);
        self.backend.reset()?;
        self.status = TpStatus::Stopped;
        let stale = self.backend.read_interrupt_status();
        if stale != 0 {
            trace!("Dropping stale interrupt status {:#x}", stale);
        }

        self.backend.enable_clocks()?;
        self.backend.load_firmware()?;
        self.boot()?;
        self.supply_init_params(false)?;
        self.status = TpStatus::Running;
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Waits for the firmware to finish with the packet it is processing, so that the host may
    /// change the records that packet would use.
    ///
    /// `value` is written into the sync register once the firmware is idle; the firmware resets
    /// the register when it next passes its sync point. The register is left synchronised
    /// whether or not that happens.
    pub(crate) fn tp_sync(&self, tp: &Tp, value: u16) -> Result<()> {
        let sync = tp.pdevice_info().sync_tp();
        let timeout = self.config.timeouts.tp_sync();

        let result = self.wait_for_sync(tp, timeout).and_then(|()| {
            sync.write(value)?;
            self.wait_for_sync(tp, timeout)
        });
        sync.write(SYNC_TP_SYNCHRONISED)?;
        result
    }

    fn wait_for_sync(&self, tp: &Tp, timeout: Duration) -> Result<()> {
        let sync = tp.pdevice_info().sync_tp();
        let deadline = Instant::now() + timeout;
        loop {
            if sync.read()? == SYNC_TP_SYNCHRONISED {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            self.backend.wait_for_update(deadline - now);
        }
    }

    /// Hands the firmware a whole new PID table, for when vDevice partitions moved.
    pub(crate) fn update_pid_table(&mut self) -> Result<()> {
        let tp = self.tp()?;
        let pids = tp.layout().number_of_pids as usize;
        let nv = tp.layout().number_of_vdevices as usize;

        let mut staging = vec![PID_INVALID; pids];
        staging.resize(2 * pids, NO_INDEX);
        staging.resize(2 * pids + 2 * nv, 0);

        for (vh, vd) in self.vdevices.iter() {
            let v = usize::from(vh.index());
            let start = self.pid_partitions.start_of(vd.pid_partition) as usize;
            for (i, head) in vd.pid_indexes.iter() {
                let s = self.slots.get(head)?;
                if s.pid != PID_INVALID {
                    staging[start + i] = s.pid;
                    staging[pids + start + i] = s.slot_index;
                }
            }
            staging[2 * pids + v] = start as u16;
            staging[2 * pids + nv + v] = vd.number_of_slots as u16;
        }

        let dma = self.backend.allocate_dma(staging.len() * 2)?;
        for (i, value) in staging.iter().enumerate() {
            dma.memory.write_le_u16(i as u64 * 2, *value)?;
        }

        let info = tp.pdevice_info();
        info.pid_table_base().write(dma.device_address)?;
        self.backend.post_mailbox(mailbox_h2tp::UPDATING_NEW_PID_TABLE)?;
        let result = self.backend.wait_for_ack(self.config.timeouts.mailbox_ack());
        info.pid_table_base().write(0)?;
        self.backend.free_dma(dma.device_address);

        if result.is_err() {
            error!("pDevice {}: firmware did not take the new PID table", self.index);
        }
        result
    }

    /* ------------------------------------------------------------------------------------------ */

    pub(crate) fn capability(&self) -> Result<PDeviceCapability> {
        let tp = self.tp.as_ref().ok_or(Error::InterfaceUnavailable)?;
        let l = tp.layout();
        Ok(PDeviceCapability {
            number_of_vdevices: l.number_of_vdevices,
            number_of_slots: l.number_of_slots,
            number_of_section_filters: l.number_of_section_filters,
            number_of_dma_structures: l.number_of_dma_structures,
            number_of_indexers: l.number_of_indexers,
            number_of_status_blks: l.number_of_status_blks,
            number_of_software_injectors: self.injector_handles.capacity() as u32,
            number_of_pids: l.number_of_pids,
        })
    }

    /// Points a live channel at its input buffer and starts or stops it.
    pub(crate) fn configure_live(
        &mut self,
        channel: u32,
        buffer_base: u32,
        buffer_size_in_pkts: u32,
        packet_len: u32,
        start: bool,
    ) -> Result<()> {
        if self.status != TpStatus::Running {
            return Err(Error::Suspended);
        }
        let tp = self.tp()?;
        if channel >= tp.layout().number_of_live_channels {
            return Err(Error::BadParameter);
        }

        let live = tp.live(channel)?;
        if start {
            live.channel().write(channel)?;
            live.buffer_base().write(buffer_base)?;
            live.buffer_size_in_pkts().write(buffer_size_in_pkts)?;
            live.packet_len().write(packet_len)?;
            self.backend.post_mailbox(mailbox_h2tp::START_LIVE)?;
        } else {
            self.backend.post_mailbox(mailbox_h2tp::STOP_LIVE)?;
        }
        self.backend.wait_for_ack(self.config.timeouts.mailbox_ack())
    }

    pub(crate) fn enable_sw_leaky_pid(&mut self, channels: u32, enable: bool) -> Result<()> {
        if !self.config.software_leaky_pid {
            return Err(Error::FeatureNotSupported);
        }
        let tp = self.tp()?;
        tp.pdevice_info().sw_leaky_pid_channels().set_bits(channels, enable)?;
        self.sw_leaky_pid_enabled = enable;
        Ok(())
    }

    /// Fraction of its time the core spends not idle, in percent.
    pub(crate) fn utilisation(&self, tp: &Tp) -> Result<u32> {
        let info = tp.pdevice_info();
        let idle = u64::from(info.avg_idle().read()?);
        let busy = u64::from(info.avg_not_idle().read()?);
        if idle + busy == 0 {
            return Ok(0);
        }
        Ok((100 * busy / (idle + busy)) as u32)
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Services the TP-to-host interrupt.
    ///
    /// Runs on whatever thread the backend raises interrupts on, under the read lock: status
    /// blocks are copied out and queued for the event task, buffer signals are posted straight to
    /// their signal's queue, and finished playback channels complete their injector.
    pub(crate) fn handle_interrupt(&self) {
        let status = self.backend.read_interrupt_status();
        if status == 0 {
            return;
        }
        trace!("pDevice {}: interrupt {:#010x}", self.index, status);

        let tp = match self.tp() {
            Ok(tp) => tp,
            Err(_) => {
                warn!("pDevice {}: interrupt {:#x} while not running", self.index, status);
                return;
            }
        };

        if status & (mailbox_tp2h::STATUS_BLOCK_SIGNALLED | mailbox_tp2h::STATUS_BLOCK_OVERFLOW) != 0
        {
            if let Err(e) = self.drain_status_blocks(&tp) {
                warn!("pDevice {}: failed to read status blocks: {}", self.index, e);
            }
        }
        if status & mailbox_tp2h::STATUS_BLOCK_OVERFLOW != 0 {
            self.events_lost.fetch_add(1, Ordering::Relaxed);
            warn!("pDevice {}: firmware ran out of status blocks", self.index);
        }
        if status & mailbox_tp2h::BUFFER_SIGNALLED != 0 {
            if let Err(e) = self.drain_signalling_queue(&tp) {
                warn!("pDevice {}: failed to read signalling queue: {}", self.index, e);
            }
        }

        let completed =
            (status & mailbox_tp2h::PLAYBACK_COMPLETION_MASK) >> mailbox_tp2h::PLAYBACK_COMPLETION_OFFSET;
        for channel in 0..NUMBER_OF_PLAYBACK_CHANNELS {
            if completed & (1 << channel) != 0 {
                self.injector_completed(channel);
            }
        }
    }

    fn drain_status_blocks(&self, tp: &Tp) -> Result<()> {
        let info = tp.pdevice_info();
        let count = tp.layout().number_of_status_blks.max(1);
        let wr = info.status_blk_wr().read()?;
        let mut rd = info.status_blk_rd().read()?;

        while rd != wr {
            let block = StatusBlock::read_from(&tp.status_blks().at(rd as usize)?)?;
            if self.events.send(EventMsg::Status(block)).is_err() {
                self.events_lost.fetch_add(1, Ordering::Relaxed);
                warn!("pDevice {}: event queue full, dropping {:?}", self.index, block);
            }
            rd = (rd + 1) % count;
        }
        info.status_blk_rd().write(rd)?;
        Ok(())
    }

    fn drain_signalling_queue(&self, tp: &Tp) -> Result<()> {
        let info = tp.pdevice_info();
        let wr = info.signalling_queue_wr().read()?;
        let mut rd = info.signalling_queue_rd().read()?;

        while rd != wr {
            let dma_index = info.signalling_queue().at(usize::from(rd))?.read()?;
            match self.buffer_handles.get(usize::from(dma_index)) {
                Some(buffer) => self.signal_buffer_if_necessary(buffer)?,
                None => trace!("Signal for unused DMA {}", dma_index),
            }
            rd = ((usize::from(rd) + 1) % SIGNALLING_QUEUE_LENGTH) as u8;
        }
        info.signalling_queue_rd().write(rd)?;
        Ok(())
    }

    /// Status blocks dropped because the event queue was full or the firmware ran out of them.
    pub fn events_lost(&self) -> u64 {
        self.events_lost.load(Ordering::Relaxed)
    }
}

/// Number of PID table entries carved up between vDevices.
fn number_of_pids(config: &PDeviceConfig) -> u32 {
    config.number_of_slots + config.number_of_slots / 2
}

/// Puts every firmware table in its idle state.
fn initialise_tables(tp: &Tp) -> Result<()> {
    tp.pid_table().fill(PID_INVALID)?;
    tp.pid_slot_mapping_table().fill(NO_INDEX)?;

    for info in tp.slot_infos().iter() {
        slot::blank_slot_info(&info)?;
    }
    for dma in tp.dma_infos().iter() {
        crate::hal::buffer::blank_dma_info(&dma)?;
    }
    for i in 0..tp.layout().number_of_dma_structures {
        tp.dma_overflow_flag(i as u16)?.write(0)?;
    }
    for (i, indexer) in tp.indexer_infos().iter().enumerate() {
        crate::hal::index::blank_indexer_info(&indexer, i as u16)?;
    }
    for marker in tp.pes_markers().iter() {
        marker.allocated().write(0)?;
        marker.next_index().write(0xFF)?;
        marker.data().write_all(&PES_MARKER_INIT_DATA)?;
    }

    let info = tp.pdevice_info();
    info.status_blk_wr().write(0)?;
    info.status_blk_rd().write(0)?;
    info.signalling_queue_rd().write(0)?;
    info.signalling_queue_wr().write(0)?;
    info.sync_tp().write(SYNC_TP_SYNCHRONISED)?;
    info.sync_tp_clear_entry().write(sync_clear::DONE)?;
    info.pid_table_base().write(0)?;
    Ok(())
}

/* ---------------------------------------------------------------------------------------------- */

/// One transport processor, its state lock, and its event task.
pub struct PDevice {
    handle: Handle,
    backend: Arc<dyn TpBackend>,
    state: Arc<RwLock<PDeviceState>>,
    events: Arc<MessageQueue<EventMsg>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl PDevice {
    pub(crate) fn new(
        index: u8,
        config: PDeviceConfig,
        backend: Arc<dyn TpBackend>,
        ts_input: Arc<dyn TsInput>,
    ) -> Result<PDevice> {
        let events = Arc::new(MessageQueue::new(config.event_queue_depth));
        let mut state = PDeviceState::new(
            index,
            config,
            Arc::clone(&backend),
            ts_input,
            Arc::clone(&events),
        )?;
        let handle = state.handle;
        state.initialise()?;

        let state = Arc::new(RwLock::new(state));

        let weak = Arc::downgrade(&state);
        backend.set_interrupt_callback(Some(Box::new(move || {
            if let Some(state) = weak.upgrade() {
                state.read().handle_interrupt();
            }
        })));

        let task_state = Arc::downgrade(&state);
        let task_events = Arc::clone(&events);
        let event_task = thread::Builder::new()
            .name(format!("stpti-events-{}", index))
            .spawn(move || event::event_task(task_state, task_events))?;

        Ok(PDevice {
            handle,
            backend,
            state,
            events,
            event_task: Mutex::new(Some(event_task)),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn state(&self) -> &RwLock<PDeviceState> {
        &self.state
    }
}

impl Debug for PDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PDevice")
            .field("handle", &self.handle)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Drop for PDevice {
    fn drop(&mut self) {
        self.backend.set_interrupt_callback(None);

        let dropped = self.events.clear();
        if dropped != 0 {
            debug!("Dropping {} undelivered events", dropped);
        }
        let _ = self.events.send(EventMsg::Quit);
        if let Some(task) = self.event_task.lock().take() {
            let _ = task.join();
        }

        let state = self.state.read();
        if let Err(e) = state.backend.halt().and_then(|()| state.backend.disable_clocks()) {
            warn!("pDevice {}: failed to stop the core: {}", state.index, e);
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Hal {
    pub fn pdevice_set_power_state(&self, pdevice: Handle, state: PowerState) -> Result<()> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_write(pdevice, |s| s.set_power_state(state))
    }

    pub fn pdevice_status(&self, pdevice: Handle) -> Result<TpStatus> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_read(pdevice, |s| Ok(s.status))
    }

    pub fn pdevice_capability(&self, pdevice: Handle) -> Result<PDeviceCapability> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_read(pdevice, |s| s.capability())
    }

    pub fn pdevice_configure_live(
        &self,
        pdevice: Handle,
        channel: u32,
        buffer_base: u32,
        buffer_size_in_pkts: u32,
        packet_len: u32,
        start: bool,
    ) -> Result<()> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_write(pdevice, |s| {
            s.configure_live(channel, buffer_base, buffer_size_in_pkts, packet_len, start)
        })
    }

    pub fn pdevice_enable_sw_leaky_pid(
        &self,
        pdevice: Handle,
        channels: u32,
        enable: bool,
    ) -> Result<()> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_write(pdevice, |s| s.enable_sw_leaky_pid(channels, enable))
    }

    pub fn pdevice_sw_leaky_pid_available(&self, pdevice: Handle) -> Result<bool> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_read(pdevice, |s| Ok(s.config.software_leaky_pid))
    }

    pub fn pdevice_cycle_count(&self, pdevice: Handle) -> Result<u64> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_read(pdevice, |s| Ok(s.backend.cycle_count()))
    }

    pub fn pdevice_events_lost(&self, pdevice: Handle) -> Result<u64> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_read(pdevice, |s| Ok(s.events_lost()))
    }

    /// Squeezes the PID table partitions of every vDevice together.
    pub fn pdevice_defragment_pid_table(&self, pdevice: Handle) -> Result<()> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_write(pdevice, |s| {
            s.pid_partitions.defragment();
            s.relocate_pid_partitions()
        })
    }

    /// Shrinks every vDevice's PID partition to what it uses, then defragments.
    pub fn pdevice_compact_pid_table(&self, pdevice: Handle) -> Result<()> {
        pdevice.expect_kind(ObjectKind::PDevice)?;
        self.with_write(pdevice, |s| {
            s.compact_pid_partitions(None)?;
            s.pid_partitions.defragment();
            s.relocate_pid_partitions()
        })
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::SimulatedTp;
    use crate::config::HalConfig;
    use crate::hal::testing::*;
    use crate::hal::AllocParams;
    use crate::tsinput::NullTsInput;

    fn bare_hal(config: PDeviceConfig) -> (Arc<SimulatedTp>, Hal) {
        init_logging();
        let tp = Arc::new(SimulatedTp::new().unwrap());
        let hal = Hal::new(
            &HalConfig {
                pdevices: vec![config],
            },
            vec![tp.clone() as Arc<dyn TpBackend>],
            Arc::new(NullTsInput),
        )
        .unwrap();
        (tp, hal)
    }

    #[test]
    fn test_initialised_firmware_sleeps() {
        let (tp, hal) = bare_hal(small_pdevice());
        let pdevice = hal.pdevice_handle(0).unwrap();

        assert_eq!(hal.pdevice_status(pdevice).unwrap(), TpStatus::Sleeping);
        assert!(!tp.clocks_enabled());

        let capability = hal.pdevice_capability(pdevice).unwrap();
        assert_eq!(capability.number_of_slots, 16);
        assert_eq!(capability.number_of_pids, 24);
        assert_eq!(capability.number_of_software_injectors, 2);
    }

    #[test]
    fn test_vdevice_lifetime_drives_power() {
        let (tp, hal) = bare_hal(small_pdevice());
        let pdevice = hal.pdevice_handle(0).unwrap();

        let vdevice = hal
            .allocate(
                pdevice,
                AllocParams::VDevice {
                    config: small_vdevice(),
                    handler: Arc::new(NoEvents),
                },
            )
            .unwrap();
        assert_eq!(hal.pdevice_status(pdevice).unwrap(), TpStatus::Running);
        assert!(tp.clocks_enabled());

        hal.deallocate(vdevice, true).unwrap();
        assert_eq!(hal.pdevice_status(pdevice).unwrap(), TpStatus::Sleeping);
    }

    #[test]
    fn test_power_state_table() {
        let (_tp, hal) = bare_hal(small_pdevice());
        let pdevice = hal.pdevice_handle(0).unwrap();

        assert!(matches!(
            hal.pdevice_set_power_state(pdevice, PowerState::Powerdown),
            Ok(())
        ));
        assert_eq!(hal.pdevice_status(pdevice).unwrap(), TpStatus::Powerdown);

        // Straight from powerdown to running is not a transition the firmware knows.
        assert!(matches!(
            hal.pdevice_set_power_state(pdevice, PowerState::Started),
            Err(Error::FeatureNotSupported)
        ));

        hal.pdevice_set_power_state(pdevice, PowerState::Sleeping).unwrap();
        hal.pdevice_set_power_state(pdevice, PowerState::Started).unwrap();
        assert_eq!(hal.pdevice_status(pdevice).unwrap(), TpStatus::Running);

        assert!(matches!(
            hal.pdevice_set_power_state(pdevice, PowerState::Powerdown),
            Err(Error::FeatureNotSupported)
        ));
    }

    #[test]
    fn test_powerdown_restores_shared_memory() {
        let (_tp, hal) = bare_hal(PDeviceConfig {
            permit_powerdown: true,
            ..small_pdevice()
        });
        let pdevice = hal.pdevice_handle(0).unwrap();

        hal.pdevice_set_power_state(pdevice, PowerState::Started).unwrap();
        let tp = hal.with_read(pdevice, |s| s.tp()).unwrap();
        tp.slot_info(3).unwrap().key_index().write(0x1234).unwrap();
        hal.pdevice_set_power_state(pdevice, PowerState::Sleeping).unwrap();

        hal.pdevice_set_power_state(pdevice, PowerState::Powerdown).unwrap();
        tp.slot_info(3).unwrap().key_index().write(0).unwrap();

        hal.pdevice_set_power_state(pdevice, PowerState::Sleeping).unwrap();
        hal.pdevice_set_power_state(pdevice, PowerState::Started).unwrap();
        assert_eq!(tp.slot_info(3).unwrap().key_index().read().unwrap(), 0x1234);
    }

    #[test]
    fn test_stalled_firmware_times_out_sync() {
        let rig = rig();
        let tp = rig.hal.with_read(rig.pdevice, |s| s.tp()).unwrap();

        rig.tp.set_stalled(true);
        let result = rig
            .hal
            .with_read(rig.pdevice, |s| s.tp_sync(&tp, crate::interface::SYNC_TP_SLOT_WAIT));
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(
            tp.pdevice_info().sync_tp().read().unwrap(),
            SYNC_TP_SYNCHRONISED
        );

        rig.tp.set_stalled(false);
        rig.hal
            .with_read(rig.pdevice, |s| s.tp_sync(&tp, crate::interface::SYNC_TP_SLOT_WAIT))
            .unwrap();
    }

    #[test]
    fn test_firmware_reset_keeps_tables() {
        let rig = rig();
        let tp = rig.hal.with_read(rig.pdevice, |s| s.tp()).unwrap();
        tp.pid_table().at(0).unwrap().write(0x0100).unwrap();

        rig.hal.vdevice_firmware_reset(rig.vdevice).unwrap();
        assert_eq!(rig.hal.pdevice_status(rig.pdevice).unwrap(), TpStatus::Running);
        assert_eq!(tp.pid_table().at(0).unwrap().read().unwrap(), 0x0100);
    }

    #[test]
    fn test_configure_live_requires_running() {
        let (_tp, hal) = bare_hal(small_pdevice());
        let pdevice = hal.pdevice_handle(0).unwrap();
        assert!(matches!(
            hal.pdevice_configure_live(pdevice, 0, 0x1000, 64, 192, true),
            Err(Error::Suspended)
        ));

        hal.pdevice_set_power_state(pdevice, PowerState::Started).unwrap();
        hal.pdevice_configure_live(pdevice, 0, 0x1000, 64, 192, true).unwrap();
        assert!(matches!(
            hal.pdevice_configure_live(pdevice, 1, 0x1000, 64, 192, true),
            Err(Error::BadParameter)
        ));
    }

    #[test]
    fn test_leaky_pid_needs_configuration() {
        let (_tp, hal) = bare_hal(small_pdevice());
        let pdevice = hal.pdevice_handle(0).unwrap();
        assert!(!hal.pdevice_sw_leaky_pid_available(pdevice).unwrap());
        assert!(matches!(
            hal.pdevice_enable_sw_leaky_pid(pdevice, 1, true),
            Err(Error::FeatureNotSupported)
        ));
    }
}

/* ---------------------------------------------------------------------------------------------- */
