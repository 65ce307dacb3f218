// SPDX-License-Identifier: MIT OR Apache-2.0

//! A transport processor emulated in software.
//!
//! [`SimulatedTp`] runs a service thread that plays the firmware's side of the shared-memory
//! protocol: it acknowledges mailbox commands, lays out dDEM when it receives its initialisation
//! parameters, answers TP sync handshakes, and copies staged PID tables into place.
//!
//! It does not demultiplex anything on its own. Tests drive the data path explicitly with
//! [`SimulatedTp::inject`], [`SimulatedTp::emit_status_block`] and
//! [`SimulatedTp::complete_playback`], which raise the same TP-to-host interrupts the real
//! firmware would. Those helpers invoke the interrupt callback on the calling thread, never on the
//! service thread, so the service thread can keep answering handshakes while the host holds its
//! locks.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::{self, Debug};
use std::io::{self, ErrorKind};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::backends::{DmaAllocation, InterruptCallback, TpBackend};
use crate::error::{Error, Result};
use crate::interface::{
    dma_overflow, firmware_config, mailbox_h2tp, mailbox_tp2h, CamTable, DmaInfo, IndexerInfo,
    InterfaceBlock, Live, MarkerData, PDeviceInfo, Playback, ProprietaryFilter, SlotInfo,
    StatusBlk, StatusBlock, Tp, TpLayout, VDeviceInfo, DMA_INFO_ALLOW_OVERFLOW,
    DMA_INFO_NO_SIGNALLING, NUMBER_OF_PLAYBACK_CHANNELS, SHARED_MEMORY_INTERFACE_CHECKSUM,
    SYNC_TP_SYNCHRONISED, TP_VERSION_ID,
};
use crate::regions::structured::TpStruct;
use crate::regions::{BackedByTpSubregion, SharedMemory, TpRegion};

/* ---------------------------------------------------------------------------------------------- */

/// First device address handed out for DMA allocations.
const DMA_ADDRESS_BASE: u32 = 0x8000_0000;

/// Size of the signalling queue in `pDeviceInfo`.
const SIGNALLING_QUEUE_SLOTS: u32 = 256;

/// What the simulated firmware reports about itself, and how it lays out dDEM.
#[derive(Clone, Debug)]
pub struct SimulatedTpConfig {
    /// Size of dDEM. Initialisation fails (the firmware reports zero vDevices) if the requested
    /// tables do not fit.
    pub ddem_size: usize,
    pub version: String,
    pub checksum: u32,
    pub number_of_pes_markers: u32,
    /// How often the service thread looks at shared memory when nobody pokes it.
    pub service_period: Duration,
}

impl Default for SimulatedTpConfig {
    fn default() -> SimulatedTpConfig {
        SimulatedTpConfig {
            ddem_size: 128 * 1024,
            version: TP_VERSION_ID.to_string(),
            checksum: SHARED_MEMORY_INTERFACE_CHECKSUM,
            number_of_pes_markers: 8,
            service_period: Duration::from_micros(200),
        }
    }
}

#[derive(Debug, Default)]
struct Core {
    clocks_enabled: bool,
    firmware_loaded: bool,
    running: bool,
    stalled: bool,
    started_at: Option<Instant>,

    /// Host-to-TP mailbox bits not yet processed.
    mailbox: u32,
    /// Acknowledges not yet consumed by the host.
    acks: u32,
    /// TP-to-host mailbox.
    tp2h: u32,
    /// Bumped every time the service thread has looked at shared memory.
    passes: u64,

    layout: Option<TpLayout>,
    playback_channels: u32,

    dma: HashMap<u32, Arc<SharedMemory>>,
    next_dma_address: u32,
}

struct Inner {
    config: SimulatedTpConfig,
    memory: Arc<SharedMemory>,
    core: Mutex<Core>,
    /// Host to service thread.
    doorbell: Condvar,
    /// Service thread to host.
    progress: Condvar,
    quit: AtomicBool,
    callback: RwLock<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Inner")
            .field("config", &self.config)
            .field("core", &self.core)
            .field("quit", &self.quit)
            .finish()
    }
}

/// A software transport processor. See the [module documentation](self).
#[derive(Debug)]
pub struct SimulatedTp {
    inner: Arc<Inner>,
    service: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedTp {
    pub fn new() -> io::Result<SimulatedTp> {
        SimulatedTp::with_config(SimulatedTpConfig::default())
    }

    pub fn with_config(config: SimulatedTpConfig) -> io::Result<SimulatedTp> {
        let memory = Arc::new(SharedMemory::new(config.ddem_size)?);
        let inner = Arc::new(Inner {
            config,
            memory,
            core: Mutex::new(Core {
                next_dma_address: DMA_ADDRESS_BASE,
                ..Core::default()
            }),
            doorbell: Condvar::new(),
            progress: Condvar::new(),
            quit: AtomicBool::new(false),
            callback: RwLock::new(None),
        });

        let service_inner = Arc::clone(&inner);
        let service = thread::Builder::new()
            .name("simulated-tp".to_string())
            .spawn(move || service_inner.service())?;

        Ok(SimulatedTp {
            inner,
            service: Mutex::new(Some(service)),
        })
    }

    /// While stalled the firmware ignores its mailbox and shared memory, so every handshake times
    /// out.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.core.lock().stalled = stalled;
        self.inner.doorbell.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.inner.core.lock().running
    }

    pub fn clocks_enabled(&self) -> bool {
        self.inner.core.lock().clocks_enabled
    }

    /// Whether the host started the given playback channel and has not stopped it since.
    pub fn playback_active(&self, channel: u32) -> bool {
        self.inner.core.lock().playback_channels & (1 << channel) != 0
    }

    /// Number of DMA allocations currently outstanding.
    pub fn dma_allocations(&self) -> usize {
        self.inner.core.lock().dma.len()
    }

    /// Appends `data` to the buffer behind DMA entry `dma_index`, as the firmware does when it
    /// outputs one unit (a section with its metadata, a PES packet, a group of TS packets...).
    ///
    /// Returns the number of bytes written, which is zero if the entry discards on overflow and
    /// the unit does not fit. Raises the buffer-signalled interrupt if the fill level crosses the
    /// entry's signalling threshold.
    pub fn inject(&self, dma_index: u16, data: &[u8]) -> io::Result<usize> {
        let signalled = {
            let core = self.inner.core.lock();
            let tp = self.inner.tp(&core)?;
            let written = self.inner.write_unit(&core, &tp, dma_index, data)?;
            if written == 0 {
                return Ok(0);
            }
            self.inner.check_threshold(&tp, dma_index, written)?
        };

        if signalled {
            self.raise(mailbox_tp2h::BUFFER_SIGNALLED);
        }
        Ok(data.len())
    }

    /// Writes a status block at the firmware's write index and raises the status-block
    /// interrupt, or the overflow interrupt if the host has not consumed enough blocks.
    pub fn emit_status_block(&self, block: &StatusBlock) -> io::Result<()> {
        let bit = {
            let core = self.inner.core.lock();
            let tp = self.inner.tp(&core)?;
            let info = tp.pdevice_info();
            let count = tp.layout().number_of_status_blks;
            let wr = info.status_blk_wr().read()?;
            let rd = info.status_blk_rd().read()?;
            let next = (wr + 1) % count.max(1);

            if next == rd {
                mailbox_tp2h::STATUS_BLOCK_OVERFLOW
            } else {
                block.write_to(&tp.status_blks().at(wr as usize)?)?;
                info.status_blk_wr().write(next)?;
                mailbox_tp2h::STATUS_BLOCK_SIGNALLED
            }
        };

        self.raise(bit);
        Ok(())
    }

    /// Reports that the firmware finished the node list queued on a playback channel.
    pub fn complete_playback(&self, channel: u32) {
        if channel >= NUMBER_OF_PLAYBACK_CHANNELS {
            warn!("No playback channel {}", channel);
            return;
        }
        self.inner.core.lock().playback_channels &= !(1 << channel);
        self.raise(1 << (mailbox_tp2h::PLAYBACK_COMPLETION_OFFSET + channel));
    }

    fn raise(&self, bits: u32) {
        self.inner.core.lock().tp2h |= bits;
        let callback = self.inner.callback.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Drop for SimulatedTp {
    fn drop(&mut self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        self.inner.doorbell.notify_all();
        if let Some(service) = self.service.lock().take() {
            let _ = service.join();
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Inner {
    fn service(&self) {
        let mut core = self.core.lock();

        while !self.quit.load(Ordering::SeqCst) {
            if core.running && core.clocks_enabled && !core.stalled {
                let bits = mem::take(&mut core.mailbox);
                if bits != 0 {
                    if let Err(e) = self.process_mailbox(&mut core, bits) {
                        warn!("Simulated firmware failed to process mailbox {:#x}: {}", bits, e);
                    }
                }
                if let Err(e) = self.process_sync(&core) {
                    warn!("Simulated firmware failed to answer sync: {}", e);
                }
                core.passes = core.passes.wrapping_add(1);
                self.progress.notify_all();
            }

            self.doorbell.wait_for(&mut core, self.config.service_period);
        }
    }

    fn interface(&self) -> InterfaceBlock<'_> {
        InterfaceBlock::backed_by(&*self.memory)
    }

    fn tp(&self, core: &Core) -> io::Result<Tp> {
        core.layout
            .map(|layout| Tp::new(Arc::clone(&self.memory), layout))
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "Firmware not initialised"))
    }

    fn process_mailbox(&self, core: &mut Core, bits: u32) -> io::Result<()> {
        trace!("Simulated firmware mailbox {:#010x}", bits);
        let mut ack = false;

        if bits & mailbox_h2tp::SUPPLYING_INIT_PARAMS != 0 {
            core.layout = self.lay_out()?;
            ack = true;
        }
        if bits & mailbox_h2tp::UPDATING_NEW_PID_TABLE != 0 {
            self.apply_pid_table(core)?;
            ack = true;
        }
        if bits & (mailbox_h2tp::START_LIVE | mailbox_h2tp::STOP_LIVE) != 0 {
            ack = true;
        }

        let start = (bits >> 16) & 0xFF;
        let stop = (bits >> 24) & 0x7F;
        core.playback_channels = (core.playback_channels | start) & !stop;

        if ack {
            core.acks += 1;
        }
        Ok(())
    }

    fn process_sync(&self, core: &Core) -> io::Result<()> {
        if let Ok(tp) = self.tp(core) {
            let sync = tp.pdevice_info().sync_tp();
            if sync.read()? != SYNC_TP_SYNCHRONISED {
                sync.write(SYNC_TP_SYNCHRONISED)?;
            }
        }
        Ok(())
    }

    /// Carves dDEM into tables sized from the initialisation parameters the host wrote into the
    /// interface block, then publishes the pointer table, version and checksum.
    fn lay_out(&self) -> io::Result<Option<TpLayout>> {
        let interface = self.interface();
        let mut layout = TpLayout {
            number_of_vdevices: interface.number_of_vdevices().read()?,
            number_of_pids: interface.number_of_pids().read()?,
            number_of_slots: interface.number_of_slots().read()?,
            number_of_section_filters: interface.number_of_section_filters().read()?,
            number_of_dma_structures: interface.number_of_dma_structures().read()?,
            number_of_indexers: interface.number_of_indexers().read()?,
            number_of_status_blks: interface.number_of_status_blks().read()?,
            number_of_live_channels: interface.number_of_live_channels().read()?.max(1),
            number_of_pes_markers: self.config.number_of_pes_markers,
            ..TpLayout::default()
        };
        layout.size_of_cam = layout.number_of_section_filters;
        layout.size_of_pid_table_region = layout.number_of_pids * 2 * 2;

        let mut next = InterfaceBlock::SIZE as u32;
        let mut take = |bytes: u64| {
            let at = next;
            next = (next + bytes as u32 + 7) & !7;
            at
        };

        layout.shared_memory = take(0);
        layout.live = take(Live::SIZE * u64::from(layout.number_of_live_channels));
        layout.playback = take(Playback::SIZE * u64::from(NUMBER_OF_PLAYBACK_CHANNELS));
        layout.stream_availability = take(4 * 64);
        layout.pdevice_info = take(PDeviceInfo::SIZE);
        layout.vdevice_info = take(VDeviceInfo::SIZE * u64::from(layout.number_of_vdevices));
        layout.pid_table_region = take(u64::from(layout.size_of_pid_table_region));
        layout.pid_table = layout.pid_table_region;
        layout.pid_slot_mapping_table = layout.pid_table_region + layout.number_of_pids * 2;
        layout.slot_info = take(SlotInfo::SIZE * u64::from(layout.number_of_slots));
        layout.dma_info = take(DmaInfo::SIZE * u64::from(layout.number_of_dma_structures));
        layout.indexer_info = take(IndexerInfo::SIZE * u64::from(layout.number_of_indexers));
        layout.filter_cam_region = take(8 * 4 * u64::from(layout.size_of_cam));
        layout.filter_cam_tables = take(CamTable::SIZE * u64::from(layout.number_of_vdevices));
        layout.proprietary_filters =
            take(ProprietaryFilter::SIZE * u64::from(layout.number_of_slots));
        layout.pes_marker_buffers =
            take(MarkerData::SIZE * u64::from(layout.number_of_pes_markers));
        layout.dma_overflow_flags = take(u64::from(layout.number_of_dma_structures));
        layout.dma_pointers = take(4 * u64::from(layout.number_of_live_channels));
        layout.status_blk = take(StatusBlk::SIZE * u64::from(layout.number_of_status_blks));
        let end = take(0);

        layout.size_of_shared_memory_region = end - layout.shared_memory;

        let config = interface.firmware_config().read()?;
        if u64::from(end) > self.memory.len() {
            warn!(
                "Simulated firmware needs {} bytes of dDEM, only {} available",
                end,
                self.memory.len()
            );
            interface.number_of_vdevices().write(0)?;
            return Ok(None);
        }

        if config & firmware_config::RESET_SHARED_MEMORY != 0 {
            let start = u64::from(layout.shared_memory);
            self.memory.fill(start, (u64::from(end) - start) as usize, 0)?;
        }

        layout.write(&interface)?;

        let mut version = [0u8; 8];
        for (dst, src) in version.iter_mut().zip(self.config.version.bytes()) {
            *dst = src;
        }
        interface.version().write_all(&version)?;
        interface.checksum().write(self.config.checksum)?;

        debug!("Simulated firmware laid out {} bytes of dDEM", end);
        Ok(Some(layout))
    }

    /// Copies the staging buffer whose device address the host put in `pid_table_base`.
    fn apply_pid_table(&self, core: &Core) -> io::Result<()> {
        let tp = self.tp(core)?;
        let base = tp.pdevice_info().pid_table_base().read()?;
        let staging = core
            .dma
            .get(&base)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "Unknown PID table address"))?;

        let pids = tp.layout().number_of_pids as u64;
        let vdevices = tp.layout().number_of_vdevices as u64;

        for i in 0..pids {
            tp.pid_table().at(i as usize)?.write(staging.read_le_u16(i * 2)?)?;
            tp.pid_slot_mapping_table()
                .at(i as usize)?
                .write(staging.read_le_u16((pids + i) * 2)?)?;
        }
        for v in 0..vdevices {
            let info = tp.vdevice_info(v as u32)?;
            info.pid_filter_base().write(staging.read_le_u16((2 * pids + v) * 2)?)?;
            info.pid_filter_size()
                .write(staging.read_le_u16((2 * pids + vdevices + v) * 2)?)?;
        }
        Ok(())
    }

    fn write_unit(&self, core: &Core, tp: &Tp, dma_index: u16, data: &[u8]) -> io::Result<usize> {
        let dma = tp.dma_info(dma_index)?;
        let memory = core
            .dma
            .get(&dma.base().read()?)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "DMA entry not set up"))?;

        let size = dma.size().read()?;
        if size == 0 {
            return Err(io::Error::new(ErrorKind::InvalidInput, "DMA entry not set up"));
        }

        let overflow = tp.dma_overflow_flag(dma_index)?;
        if overflow.read()? & dma_overflow::MARK_RESET_OVERFLOW != 0 {
            overflow.write(0)?;
        }

        let read = dma.read_offset().read()?;
        let write = dma.write_offset().read()?;
        let used = (write + size - read) % size;
        let free = size - used - 1;
        let len = data.len() as u32;

        if len > free {
            if dma.signal_threshold().read()? & DMA_INFO_ALLOW_OVERFLOW == 0 {
                overflow.write(dma_overflow::MARK_OVERFLOWED_DISCARD)?;
                return Ok(0);
            }
            overflow.write(dma_overflow::MARK_OVERFLOWED_OVERWRITE)?;
        }

        if len >= size {
            return Err(io::Error::new(ErrorKind::InvalidInput, "Unit larger than buffer"));
        }
        let first = data.len().min((size - write) as usize);
        memory.write_bytes(u64::from(write), &data[..first])?;
        memory.write_bytes(0, &data[first..])?;
        let offset = (write + len) % size;

        dma.write_offset().write(offset)?;
        dma.qwrite_offset().write(offset)?;
        let units = dma.buffer_unit_count().read()?;
        dma.buffer_unit_count().write(units.wrapping_add(1))?;
        Ok(data.len())
    }

    /// Queues the DMA index on the signalling queue if the fill level went from below the
    /// threshold to at or above it.
    fn check_threshold(&self, tp: &Tp, dma_index: u16, written: usize) -> io::Result<bool> {
        let dma = tp.dma_info(dma_index)?;
        let threshold = dma.signal_threshold().read()? & !DMA_INFO_ALLOW_OVERFLOW;
        if threshold == DMA_INFO_NO_SIGNALLING {
            return Ok(false);
        }

        let size = dma.size().read()?;
        let used = (dma.qwrite_offset().read()? + size - dma.read_offset().read()?) % size;
        let before = used.saturating_sub(written as u32);
        if !(before < threshold && used >= threshold) {
            return Ok(false);
        }

        let info = tp.pdevice_info();
        let wr = u32::from(info.signalling_queue_wr().read()?);
        info.signalling_queue().at(wr as usize)?.write(dma_index as u8)?;
        info.signalling_queue_wr()
            .write(((wr + 1) % SIGNALLING_QUEUE_SLOTS) as u8)?;
        Ok(true)
    }
}

/* ---------------------------------------------------------------------------------------------- */

fn not_ready(what: &str) -> Error {
    Error::Io(io::Error::new(ErrorKind::Other, what.to_string()))
}

impl TpBackend for SimulatedTp {
    fn shared_memory(&self) -> Arc<SharedMemory> {
        Arc::clone(&self.inner.memory)
    }

    fn enable_clocks(&self) -> Result<()> {
        self.inner.core.lock().clocks_enabled = true;
        Ok(())
    }

    fn disable_clocks(&self) -> Result<()> {
        // A running core simply stops being clocked.
        self.inner.core.lock().clocks_enabled = false;
        Ok(())
    }

    fn load_firmware(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        if !core.clocks_enabled {
            return Err(not_ready("Clocks disabled"));
        }
        core.firmware_loaded = true;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        if !core.firmware_loaded || !core.clocks_enabled {
            return Err(not_ready("No firmware loaded"));
        }

        if core.running || core.layout.is_some() {
            // Halted or clock-gated with its tables intact: carry on where it stopped.
            core.running = true;
            self.inner.doorbell.notify_all();
            return Ok(());
        }

        self.inner.interface().activity_counter().write(0)?;
        core.running = true;
        core.started_at = Some(Instant::now());
        core.layout = None;
        core.acks = 1;
        self.inner.doorbell.notify_all();
        Ok(())
    }

    fn halt(&self) -> Result<()> {
        self.inner.core.lock().running = false;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        core.running = false;
        core.firmware_loaded = false;
        core.started_at = None;
        core.layout = None;
        core.mailbox = 0;
        core.acks = 0;
        core.tp2h = 0;
        core.playback_channels = 0;
        Ok(())
    }

    fn post_mailbox(&self, bits: u32) -> Result<()> {
        let mut core = self.inner.core.lock();
        core.mailbox |= bits;
        core.acks = 0;
        self.inner.doorbell.notify_all();
        Ok(())
    }

    fn wait_for_ack(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut core = self.inner.core.lock();

        while core.acks == 0 {
            if self.inner.progress.wait_until(&mut core, deadline).timed_out() && core.acks == 0 {
                return Err(Error::Timeout);
            }
        }
        core.acks -= 1;
        Ok(())
    }

    fn read_interrupt_status(&self) -> u32 {
        mem::take(&mut self.inner.core.lock().tp2h)
    }

    fn wait_for_update(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut core = self.inner.core.lock();
        let seen = core.passes;

        self.inner.doorbell.notify_all();
        while core.passes == seen {
            if self.inner.progress.wait_until(&mut core, deadline).timed_out() {
                break;
            }
        }
    }

    fn read_timer_counter(&self) -> u32 {
        self.inner
            .core
            .lock()
            .started_at
            .map_or(0, |t| t.elapsed().as_micros() as u32)
    }

    fn cycle_count(&self) -> u64 {
        // The emulated core retires one instruction per nanosecond.
        self.inner
            .core
            .lock()
            .started_at
            .map_or(0, |t| t.elapsed().as_nanos() as u64)
    }

    fn allocate_dma(&self, size: usize) -> Result<DmaAllocation> {
        let memory = Arc::new(SharedMemory::new(size)?);
        let mut core = self.inner.core.lock();

        let device_address = core.next_dma_address;
        let aligned = ((size as u64 + 0xFFF) & !0xFFF).max(0x1000);
        core.next_dma_address = u32::try_from(u64::from(device_address) + aligned)
            .map_err(|_| Error::NoMemory)?;
        core.dma.insert(device_address, Arc::clone(&memory));

        trace!("DMA allocation of {} bytes at {:#010x}", size, device_address);
        Ok(DmaAllocation {
            device_address,
            memory,
        })
    }

    fn free_dma(&self, device_address: u32) {
        if self.inner.core.lock().dma.remove(&device_address).is_none() {
            warn!("Freeing unknown DMA address {:#010x}", device_address);
        }
    }

    fn set_interrupt_callback(&self, callback: Option<InterruptCallback>) {
        *self.inner.callback.write() = callback.map(Arc::from);
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{version_is_compatible, read_version};
    use std::sync::atomic::AtomicUsize;

    fn boot(tp: &SimulatedTp) {
        tp.enable_clocks().unwrap();
        tp.load_firmware().unwrap();
        tp.start().unwrap();
        tp.wait_for_ack(Duration::from_secs(1)).unwrap();
    }

    fn initialise(tp: &SimulatedTp, slots: u32, dmas: u32) -> Tp {
        boot(tp);
        let memory = tp.shared_memory();
        let interface = InterfaceBlock::backed_by(&*memory);
        interface.number_of_vdevices().write(2).unwrap();
        interface.number_of_slots().write(slots).unwrap();
        interface.number_of_pids().write(slots + slots / 2).unwrap();
        interface.number_of_section_filters().write(16).unwrap();
        interface.number_of_dma_structures().write(dmas).unwrap();
        interface.number_of_indexers().write(2).unwrap();
        interface.number_of_status_blks().write(4).unwrap();
        interface
            .firmware_config()
            .write(firmware_config::RESET_SHARED_MEMORY)
            .unwrap();
        tp.post_mailbox(mailbox_h2tp::SUPPLYING_INIT_PARAMS).unwrap();
        tp.wait_for_ack(Duration::from_secs(1)).unwrap();

        let layout = TpLayout::read(&interface).unwrap();
        Tp::new(memory, layout)
    }

    #[test]
    fn test_debug_with_interrupt_callback() {
        let tp = SimulatedTp::new().unwrap();
        tp.set_interrupt_callback(Some(Box::new(|| {})));
        let text = format!("{:?}", tp);
        assert!(text.contains("core"));
        assert!(!text.contains("callback"));
    }

    #[test]
    fn test_start_requires_firmware() {
        let tp = SimulatedTp::new().unwrap();
        assert!(tp.start().is_err());
        tp.enable_clocks().unwrap();
        assert!(tp.start().is_err());
        tp.load_firmware().unwrap();
        tp.start().unwrap();
        assert!(tp.is_running());
    }

    #[test]
    fn test_halted_core_resumes_with_its_layout() {
        let tp = SimulatedTp::new().unwrap();
        let fw = initialise(&tp, 8, 4);
        let layout = *fw.layout();

        tp.halt().unwrap();
        tp.disable_clocks().unwrap();
        assert!(!tp.is_running());

        tp.enable_clocks().unwrap();
        tp.start().unwrap();
        assert!(tp.is_running());
        assert_eq!(TpLayout::read(&fw.interface()).unwrap(), layout);

        fw.pdevice_info().sync_tp().write(3).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        while fw.pdevice_info().sync_tp().read().unwrap() != SYNC_TP_SYNCHRONISED {
            assert!(Instant::now() < deadline);
            tp.wait_for_update(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_init_params_lay_out_ddem() {
        let tp = SimulatedTp::new().unwrap();
        let fw = initialise(&tp, 8, 4);

        let layout = *fw.layout();
        assert_eq!(layout.number_of_slots, 8);
        assert_eq!(layout.number_of_pids, 12);
        assert_eq!(layout.pid_slot_mapping_table, layout.pid_table + 24);
        assert!(layout.status_blk > layout.slot_info);
        assert_eq!(fw.interface().checksum().read().unwrap(), SHARED_MEMORY_INTERFACE_CHECKSUM);
        assert!(version_is_compatible(&read_version(&fw.interface()).unwrap()));
    }

    #[test]
    fn test_ddem_too_small() {
        let tp = SimulatedTp::with_config(SimulatedTpConfig {
            ddem_size: 2048,
            ..SimulatedTpConfig::default()
        })
        .unwrap();
        let fw = initialise(&tp, 64, 64);
        assert_eq!(fw.interface().number_of_vdevices().read().unwrap(), 0);
    }

    #[test]
    fn test_stalled_firmware_never_acks() {
        let tp = SimulatedTp::new().unwrap();
        boot(&tp);
        tp.set_stalled(true);
        tp.post_mailbox(mailbox_h2tp::START_LIVE).unwrap();
        assert!(matches!(
            tp.wait_for_ack(Duration::from_millis(20)),
            Err(Error::Timeout)
        ));
        tp.set_stalled(false);
        tp.post_mailbox(mailbox_h2tp::START_LIVE).unwrap();
        tp.wait_for_ack(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_sync_is_answered() {
        let tp = SimulatedTp::new().unwrap();
        let fw = initialise(&tp, 8, 4);
        fw.pdevice_info().sync_tp().write(3).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while fw.pdevice_info().sync_tp().read().unwrap() != SYNC_TP_SYNCHRONISED {
            assert!(Instant::now() < deadline);
            tp.wait_for_update(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_staged_pid_table() {
        let tp = SimulatedTp::new().unwrap();
        let fw = initialise(&tp, 4, 4);
        let pids = fw.layout().number_of_pids as u64;

        let staging = tp.allocate_dma(((2 * pids + 4) * 2) as usize).unwrap();
        staging.memory.write_le_u16(0, 0x0100).unwrap();
        staging.memory.write_le_u16(pids * 2, 3).unwrap();
        staging.memory.write_le_u16((2 * pids + 2) * 2, 6).unwrap();
        fw.pdevice_info()
            .pid_table_base()
            .write(staging.device_address)
            .unwrap();

        tp.post_mailbox(mailbox_h2tp::UPDATING_NEW_PID_TABLE).unwrap();
        tp.wait_for_ack(Duration::from_secs(1)).unwrap();

        assert_eq!(fw.pid_table().at(0).unwrap().read().unwrap(), 0x0100);
        assert_eq!(fw.pid_slot_mapping_table().at(0).unwrap().read().unwrap(), 3);
        assert_eq!(fw.vdevice_info(0).unwrap().pid_filter_size().read().unwrap(), 6);

        tp.free_dma(staging.device_address);
        assert_eq!(tp.dma_allocations(), 0);
    }

    #[test]
    fn test_inject_wraps_and_signals() {
        let tp = SimulatedTp::new().unwrap();
        let fw = initialise(&tp, 4, 4);
        let buffer = tp.allocate_dma(16).unwrap();

        let dma = fw.dma_info(1).unwrap();
        dma.base().write(buffer.device_address).unwrap();
        dma.size().write(16).unwrap();
        dma.read_offset().write(10).unwrap();
        dma.write_offset().write(10).unwrap();
        dma.signal_threshold().write(6).unwrap();

        let interrupts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&interrupts);
        tp.set_interrupt_callback(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert_eq!(tp.inject(1, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(), 8);
        assert_eq!(dma.qwrite_offset().read().unwrap(), 2);
        assert_eq!(buffer.memory.read_u8(15).unwrap(), 6);
        assert_eq!(buffer.memory.read_u8(0).unwrap(), 7);
        assert_eq!(interrupts.load(Ordering::SeqCst), 1);
        assert_ne!(tp.read_interrupt_status() & mailbox_tp2h::BUFFER_SIGNALLED, 0);
        assert_eq!(fw.pdevice_info().signalling_queue().at(0).unwrap().read().unwrap(), 1);

        // Discards by default once full.
        assert_eq!(tp.inject(1, &[0; 8]).unwrap(), 0);
        assert_eq!(
            fw.dma_overflow_flag(1).unwrap().read().unwrap(),
            dma_overflow::MARK_OVERFLOWED_DISCARD
        );
    }

    #[test]
    fn test_status_block_ring() {
        let tp = SimulatedTp::new().unwrap();
        let fw = initialise(&tp, 4, 4);
        let block = StatusBlock {
            slot_index: 2,
            ..StatusBlock::default()
        };

        for _ in 0..3 {
            tp.emit_status_block(&block).unwrap();
            assert_eq!(tp.read_interrupt_status(), mailbox_tp2h::STATUS_BLOCK_SIGNALLED);
        }
        tp.emit_status_block(&block).unwrap();
        assert_eq!(tp.read_interrupt_status(), mailbox_tp2h::STATUS_BLOCK_OVERFLOW);
        assert_eq!(fw.pdevice_info().status_blk_wr().read().unwrap(), 3);
    }

    #[test]
    fn test_playback_start_and_completion() {
        let tp = SimulatedTp::new().unwrap();
        boot(&tp);
        tp.post_mailbox(mailbox_h2tp::START_PLAYBACK << 2).unwrap();
        tp.wait_for_update(Duration::from_millis(50));
        assert!(tp.playback_active(2));

        tp.complete_playback(2);
        assert!(!tp.playback_active(2));
        assert_eq!(
            tp.read_interrupt_status(),
            1 << (mailbox_tp2h::PLAYBACK_COMPLETION_OFFSET + 2)
        );
    }
}

/* ---------------------------------------------------------------------------------------------- */
