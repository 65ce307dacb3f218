// SPDX-License-Identifier: MIT OR Apache-2.0

//! Buffers: circular DMA regions the firmware writes collected data into.
//!
//! A buffer is only known to the firmware while it has a DMA entry, which it gets when the first
//! slot or index is associated with it and loses when the last one goes. While it has one, the
//! read, write and unit-count fields of the entry are authoritative; the copies held here are
//! refreshed from them when the entry is released, and written back when a new one is set up.
//!
//! The firmware writes whole units (a section with its metadata, a PES packet, a group of
//! packets, an index parcel...) and only then advances the quantised write offset. Reads take one
//! unit at a time off the read offset, see [`zone`](crate::hal::zone), and leave committing the
//! new read offset to the caller through [`Hal::buffer_set_read_offset`].
//!
//! A buffer collects either for slots or for indexes, never both. Whichever is associated first
//! decides, and the choice sticks until the buffer has been emptied.

/* ---------------------------------------------------------------------------------------------- */

use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hal::filter::{FlushArray, SectionMetadata};
use crate::hal::index::IndexEventData;
use crate::hal::slot::SlotMode;
use crate::hal::zone::{self, Ring, Zone, PCR_UNIT_SIZE, SECTION_HEADER_SIZE};
use crate::hal::{Hal, PDeviceState};
use crate::interface::{
    dma_overflow, DmaInfo, Tp, DMA_INFO_ALLOW_OVERFLOW, DMA_INFO_NO_SIGNALLING,
};
use crate::objman::{Handle, ObjectKind};
use crate::regions::SharedMemory;

/* ---------------------------------------------------------------------------------------------- */

/// Allocation parameters of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    /// Size in bytes. The buffer holds one byte less, so that full and empty differ.
    pub size: u32,
    /// Buffers in caller-supplied memory are not supported.
    pub manually_allocated: bool,
}

impl Default for BufferConfig {
    fn default() -> BufferConfig {
        BufferConfig {
            size: 64 * 1024,
            manually_allocated: false,
        }
    }
}

/// How [`Hal::buffer_read`] cuts the data it returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadQuantisation {
    /// As many bytes as fit, whatever units they belong to.
    IgnoreQuantisation,
    /// One whole unit. A unit that does not fit is an error.
    AsUnits,
    /// One unit, cut short if it does not fit.
    AsUnitsAllowTruncation,
}

/// What the buffer said about the unit returned by a read.
#[derive(Clone, Debug, PartialEq)]
pub enum UnitMetadata {
    None,
    Section(SectionMetadata),
    PartialPes {
        continuity_counter: u8,
        payload_unit_start: bool,
        discontinuity: bool,
    },
    Index(IndexEventData),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadResult {
    pub bytes_copied: u32,
    /// Where the next unit starts. The read offset itself only moves with
    /// [`Hal::buffer_set_read_offset`].
    pub next_read_offset: u32,
    pub metadata: UnitMetadata,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStatus {
    pub size: u32,
    pub bytes_in_buffer: u32,
    /// Units the firmware has written since the buffer was set up or flushed.
    pub unit_count: u32,
    pub free_space: u32,
    /// Index buffers only: events waiting to be read.
    pub units_in_buffer: Option<u32>,
    /// Index buffers only: bytes of event data those events carry.
    pub non_unit_bytes: Option<u32>,
    pub overflowed: bool,
}

/* ---------------------------------------------------------------------------------------------- */

#[derive(Debug)]
pub struct Buffer {
    pub(crate) vdevice: Handle,
    pub(crate) size: u32,
    pub(crate) device_address: u32,
    memory: Arc<SharedMemory>,

    /// DMA entry, while a slot or index is associated.
    pub(crate) buffer_index: Option<u16>,
    read_offset: u32,
    qwrite_offset: u32,
    unit_count: u32,
    overflow_flag: u8,

    /// Associated slots, `None` if the buffer has never collected for a slot.
    slot_count: Option<u32>,
    /// Associated indexes, `None` if the buffer has never collected for an index.
    indexer_count: Option<u32>,
    slot_mode: SlotMode,
    metadata_suppressed: u32,

    pub(crate) signal: Option<Handle>,
    pub(crate) upper_threshold: u32,
    pub(crate) discard_on_overflow: bool,

    flush: Mutex<FlushArray>,
}

impl Buffer {
    fn new(vdevice: Handle, size: u32, device_address: u32, memory: Arc<SharedMemory>) -> Buffer {
        Buffer {
            vdevice,
            size,
            device_address,
            memory,
            buffer_index: None,
            read_offset: 0,
            qwrite_offset: 0,
            unit_count: 0,
            overflow_flag: 0,
            slot_count: None,
            indexer_count: None,
            slot_mode: SlotMode::Null,
            metadata_suppressed: 0,
            signal: None,
            upper_threshold: DMA_INFO_NO_SIGNALLING,
            discard_on_overflow: true,
            flush: Mutex::new(FlushArray::default()),
        }
    }

    fn ring(&self) -> Ring<'_> {
        Ring::new(&self.memory, self.size)
    }

    /// An emptied buffer may change what it collects for.
    fn forget_consumer_if_empty(&mut self) {
        if self.slot_count.unwrap_or(0) == 0
            && self.indexer_count.unwrap_or(0) == 0
            && self.read_offset == self.qwrite_offset
        {
            self.slot_count = None;
            self.indexer_count = None;
        }
    }

    fn overflowed_overwrite(&self, flag: u8) -> bool {
        !self.discard_on_overflow && flag & dma_overflow::MARK_OVERFLOWED_OVERWRITE != 0
    }

    fn bytes_in_buffer(&self, o: &Offsets) -> u32 {
        if self.overflowed_overwrite(o.overflow) {
            self.size
        } else {
            self.ring().distance(o.read, o.qwrite)
        }
    }
}

/// Where a buffer's offsets stand, from the DMA entry if it has one.
#[derive(Clone, Copy, Debug)]
struct Offsets {
    read: u32,
    write: u32,
    qwrite: u32,
    unit_count: u32,
    overflow: u8,
}

/// Metadata found while zoning, resolved once the read is known to go ahead.
enum Pending {
    None,
    Section { header: [u8; SECTION_HEADER_SIZE as usize], crc: u8, size: u32 },
    PartialPes(zone::PacketInfo),
    Index(Box<zone::IndexZone>),
}

/* ---------------------------------------------------------------------------------------------- */

/// Puts a DMA entry into its unused state.
pub(crate) fn blank_dma_info(dma: &DmaInfo<'_>) -> Result<()> {
    dma.size().write(0)?;
    dma.signal_threshold().write(DMA_INFO_NO_SIGNALLING)?;
    dma.base().write(0)?;
    dma.read_offset().write(0)?;
    dma.write_offset().write(0)?;
    dma.qwrite_offset_pending().write(0)?;
    dma.qwrite_offset().write(0)?;
    dma.buffer_unit_count().write(0)?;
    Ok(())
}

impl PDeviceState {
    pub(crate) fn buffer_allocate(&mut self, parent: Handle, config: BufferConfig) -> Result<Handle> {
        if config.manually_allocated || config.size == 0 {
            return Err(Error::BadParameter);
        }
        let vdevice = self
            .links
            .ancestor(parent, ObjectKind::VDevice)
            .ok_or(Error::BadParameter)?;

        let dma = self.backend.allocate_dma(config.size as usize)?;
        let address = dma.device_address;
        let handle = match self
            .buffers
            .insert(Buffer::new(vdevice, config.size, address, dma.memory))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.backend.free_dma(address);
                return Err(e);
            }
        };
        self.links.add_child(parent, handle);

        trace!("Buffer {:?}: {} bytes at {:#010x}", handle, config.size, address);
        Ok(handle)
    }

    pub(crate) fn buffer_deallocate(&mut self, handle: Handle) -> Result<()> {
        if self.buffers.get(handle)?.buffer_index.is_some() {
            let tp = self.tp()?;
            self.buffer_unmap(&tp, handle)?;
        }
        let buffer = self.buffers.remove(handle)?;
        self.backend.free_dma(buffer.device_address);
        Ok(())
    }

    pub(crate) fn buffer_associator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        match other.kind() {
            ObjectKind::Slot => {
                let (mode, suppressed) = {
                    let s = self.slots.get(other)?;
                    (s.mode(), s.config.suppress_metadata)
                };
                {
                    let b = self.buffers.get_mut(handle)?;
                    b.forget_consumer_if_empty();
                    if b.indexer_count.is_some() {
                        return Err(Error::ObjectAlreadyAssociated);
                    }
                    match b.slot_count {
                        None => {
                            b.slot_count = Some(0);
                            b.slot_mode = mode;
                        }
                        Some(_) if b.slot_mode != mode => return Err(Error::InvalidSlotType),
                        Some(_) => {}
                    }
                }

                if self.buffers.get(handle)?.buffer_index.is_none() {
                    self.buffer_map(handle)?;
                }

                let b = self.buffers.get_mut(handle)?;
                if suppressed {
                    b.metadata_suppressed += 1;
                }
                b.slot_count = b.slot_count.map(|n| n + 1);
                Ok(())
            }
            ObjectKind::Index => {
                {
                    let b = self.buffers.get_mut(handle)?;
                    b.forget_consumer_if_empty();
                    if b.slot_count.is_some() {
                        return Err(Error::ObjectAlreadyAssociated);
                    }
                    if b.indexer_count.is_none() {
                        b.indexer_count = Some(0);
                    }
                }

                if self.buffers.get(handle)?.buffer_index.is_none() {
                    self.buffer_map(handle)?;
                }

                let b = self.buffers.get_mut(handle)?;
                b.indexer_count = b.indexer_count.map(|n| n + 1);
                Ok(())
            }
            ObjectKind::Signal => {
                let b = self.buffers.get_mut(handle)?;
                if b.signal.is_some() {
                    return Err(Error::OnlyOneSignalPerBuffer);
                }
                b.signal = Some(other);
                self.buffer_apply_threshold(handle)
            }
            _ => Err(Error::BadParameter),
        }
    }

    pub(crate) fn buffer_disassociator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        match other.kind() {
            ObjectKind::Slot => {
                let suppressed = self.slots.get(other)?.config.suppress_metadata;
                let tp = self.tp()?;
                if let Some(index) = self.buffers.get(handle)?.buffer_index {
                    // The firmware may be half way through writing a unit for the slot.
                    if let Err(e) = self.tp_sync(&tp, index) {
                        warn!("No sync point for DMA {}: {}", index, e);
                    }
                }
                self.buffer_cache_offsets(&tp, handle)?;

                let b = self.buffers.get_mut(handle)?;
                if suppressed {
                    b.metadata_suppressed = b.metadata_suppressed.saturating_sub(1);
                }
                b.slot_count = b.slot_count.map(|n| n.saturating_sub(1));
                if b.slot_count == Some(0) {
                    self.buffer_unmap(&tp, handle)?;
                }
                Ok(())
            }
            ObjectKind::Index => {
                let tp = self.tp()?;
                self.buffer_cache_offsets(&tp, handle)?;

                let b = self.buffers.get_mut(handle)?;
                b.indexer_count = b.indexer_count.map(|n| n.saturating_sub(1));
                if b.indexer_count == Some(0) {
                    self.buffer_unmap(&tp, handle)?;
                }
                Ok(())
            }
            ObjectKind::Signal => {
                self.buffers.get_mut(handle)?.signal = None;
                self.buffer_apply_threshold(handle)
            }
            _ => {
                warn!("Buffer {:?} was never associated with {:?}", handle, other);
                Ok(())
            }
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Gives the buffer a DMA entry, carrying over the offsets it had when it last lost one.
    fn buffer_map(&mut self, handle: Handle) -> Result<()> {
        let tp = self.tp()?;
        let index = self.buffer_handles.add(handle)?;
        if index >= tp.layout().number_of_dma_structures as usize {
            self.buffer_handles.remove(index);
            return Err(Error::NoMemory);
        }
        let index = index as u16;

        if let Err(e) = self.program_dma(&tp, handle, index) {
            self.buffer_handles.remove(usize::from(index));
            return Err(e);
        }
        self.buffers.get_mut(handle)?.buffer_index = Some(index);
        debug!("Buffer {:?} on DMA {}", handle, index);
        self.buffer_apply_threshold(handle)
    }

    fn program_dma(&self, tp: &Tp, handle: Handle, index: u16) -> Result<()> {
        let b = self.buffers.get(handle)?;
        let dma = tp.dma_info(index)?;
        blank_dma_info(&dma)?;

        dma.base().write(b.device_address)?;
        dma.read_offset().write(b.read_offset)?;
        dma.write_offset().write(b.qwrite_offset)?;
        dma.qwrite_offset_pending().write(b.qwrite_offset)?;
        dma.qwrite_offset().write(b.qwrite_offset)?;
        dma.buffer_unit_count().write(b.unit_count)?;
        tp.dma_overflow_flag(index)?.write(b.overflow_flag)?;
        // A non-zero size is what makes the entry usable.
        dma.size().write(b.size)?;
        Ok(())
    }

    /// Takes the DMA entry away from a buffer whose offsets have been cached.
    fn buffer_unmap(&mut self, tp: &Tp, handle: Handle) -> Result<()> {
        if let Some(index) = self.buffers.get_mut(handle)?.buffer_index.take() {
            blank_dma_info(&tp.dma_info(index)?)?;
            tp.dma_overflow_flag(index)?.write(0)?;
            self.buffer_handles.remove(usize::from(index));
            debug!("Buffer {:?} off DMA {}", handle, index);
        }
        Ok(())
    }

    fn buffer_cache_offsets(&mut self, tp: &Tp, handle: Handle) -> Result<()> {
        let index = match self.buffers.get(handle)?.buffer_index {
            Some(index) => index,
            None => return Ok(()),
        };
        let dma = tp.dma_info(index)?;
        let read = dma.read_offset().read()?;
        let qwrite = dma.qwrite_offset().read()?;
        let units = dma.buffer_unit_count().read()?;
        let flag = tp.dma_overflow_flag(index)?.read()?;

        let b = self.buffers.get_mut(handle)?;
        b.read_offset = read;
        b.qwrite_offset = qwrite;
        b.unit_count = units;
        b.overflow_flag = flag;
        Ok(())
    }

    fn offsets(&self, b: &Buffer) -> Result<Offsets> {
        match b.buffer_index {
            Some(index) => {
                let tp = self.tp()?;
                let dma = tp.dma_info(index)?;
                Ok(Offsets {
                    read: dma.read_offset().read()?,
                    write: dma.write_offset().read()?,
                    qwrite: dma.qwrite_offset().read()?,
                    unit_count: dma.buffer_unit_count().read()?,
                    overflow: tp.dma_overflow_flag(index)?.read()?,
                })
            }
            None => Ok(Offsets {
                read: b.read_offset,
                write: b.qwrite_offset,
                qwrite: b.qwrite_offset,
                unit_count: b.unit_count,
                overflow: b.overflow_flag,
            }),
        }
    }

    /// Writes the signalling threshold and overflow policy into the DMA entry.
    fn buffer_apply_threshold(&self, handle: Handle) -> Result<()> {
        let b = self.buffers.get(handle)?;
        let index = match b.buffer_index {
            Some(index) => index,
            None => return Ok(()),
        };

        let mut threshold = match b.signal {
            Some(_) => b.upper_threshold & !DMA_INFO_ALLOW_OVERFLOW,
            None => DMA_INFO_NO_SIGNALLING,
        };
        if !b.discard_on_overflow {
            threshold |= DMA_INFO_ALLOW_OVERFLOW;
        }
        self.tp()?.dma_info(index)?.signal_threshold().write(threshold)?;

        self.signal_buffer_if_necessary(handle)
    }

    /// Undoes the writes of a unit the firmware had not finished when its slot was reset.
    pub(crate) fn buffer_windback_qwrite(&self, tp: &Tp, handle: Handle) -> Result<()> {
        if let Some(index) = self.buffers.get(handle)?.buffer_index {
            let dma = tp.dma_info(index)?;
            let qwrite = dma.qwrite_offset().read()?;
            dma.qwrite_offset_pending().write(qwrite)?;
            dma.write_offset().write(qwrite)?;
        }
        Ok(())
    }

    /// Posts the buffer to its signal if it holds at least the threshold.
    ///
    /// Called whenever either side may have moved the fill level across the threshold, so the
    /// same crossing can be posted twice; waiters check the level again.
    pub(crate) fn signal_buffer_if_necessary(&self, handle: Handle) -> Result<()> {
        let b = self.buffers.get(handle)?;
        let signal = match b.signal {
            Some(signal) => signal,
            None => return Ok(()),
        };

        if self.buffer_ready(b)? {
            trace!("Signalling {:?} for {:?}", signal, handle);
            self.signal_post(signal, handle)?;
        }
        Ok(())
    }

    /// Whether the buffer holds enough to be worth a signal.
    pub(crate) fn buffer_ready(&self, b: &Buffer) -> Result<bool> {
        let o = self.offsets(b)?;
        Ok(b.bytes_in_buffer(&o) >= b.upper_threshold)
    }

    /* ------------------------------------------------------------------------------------------ */

    fn buffer_set_threshold(&mut self, handle: Handle, threshold: u32) -> Result<()> {
        self.buffers.get_mut(handle)?.upper_threshold = threshold.min(DMA_INFO_NO_SIGNALLING);
        self.buffer_apply_threshold(handle)
    }

    fn buffer_set_overflow_control(&mut self, handle: Handle, discard: bool) -> Result<()> {
        self.buffers.get_mut(handle)?.discard_on_overflow = discard;
        self.buffer_apply_threshold(handle)
    }

    /// Empties the buffer, with the slots feeding it held off while the offsets change.
    fn buffer_flush(&mut self, handle: Handle) -> Result<()> {
        {
            let b = self.buffers.get_mut(handle)?;
            b.read_offset = 0;
            b.qwrite_offset = 0;
            b.unit_count = 0;
            b.overflow_flag = 0;
        }

        if let Some(index) = self.buffers.get(handle)?.buffer_index {
            let tp = self.tp()?;
            let slots = self.links.associated_of_kind(handle, ObjectKind::Slot);
            self.reset_state(&tp, &slots, true)?;
            if let Err(e) = self.tp_sync(&tp, index) {
                warn!("No sync point for DMA {}: {}", index, e);
            }

            let dma = tp.dma_info(index)?;
            dma.write_offset().write(0)?;
            dma.qwrite_offset_pending().write(0)?;
            dma.qwrite_offset().write(0)?;
            dma.buffer_unit_count().write(0)?;
            dma.read_offset().write(0)?;
            tp.dma_overflow_flag(index)?.write(0)?;

            for slot in slots {
                self.activate(&tp, slot)?;
            }
        }

        self.buffers.get(handle)?.flush.lock().clear();
        debug!("Flushed {:?}", handle);
        Ok(())
    }

    /// Hides the sections `filters` matched from reads of what the buffer holds now.
    fn buffer_filters_flush(&self, handle: Handle, filters: &[Handle]) -> Result<()> {
        let b = self.buffers.get(handle)?;
        let (mask, slot_based) = self.flush_mask(filters)?;
        let region = b.bytes_in_buffer(&self.offsets(b)?);
        b.flush.lock().add(region, mask, slot_based)
    }

    fn buffer_get_write_offset(&self, handle: Handle) -> Result<u32> {
        let b = self.buffers.get(handle)?;
        Ok(self.offsets(b)?.qwrite)
    }

    fn buffer_set_read_offset(&mut self, handle: Handle, offset: u32) -> Result<()> {
        let (size, index, discard) = {
            let b = self.buffers.get(handle)?;
            (b.size, b.buffer_index, b.discard_on_overflow)
        };
        if offset >= size {
            return Err(Error::BadParameter);
        }

        self.buffers.get_mut(handle)?.read_offset = offset;
        match index {
            Some(index) => {
                let tp = self.tp()?;
                tp.dma_info(index)?.read_offset().write(offset)?;
                if !discard {
                    let flag = tp.dma_overflow_flag(index)?;
                    let value = flag.read()?;
                    if value & dma_overflow::MARK_OVERFLOWED_OVERWRITE != 0 {
                        flag.write(value | dma_overflow::MARK_RESET_OVERFLOW)?;
                    }
                }
            }
            None if !discard => self.buffers.get_mut(handle)?.overflow_flag = 0,
            None => {}
        }

        self.signal_buffer_if_necessary(handle)
    }

    fn buffer_status(&self, handle: Handle) -> Result<BufferStatus> {
        let b = self.buffers.get(handle)?;
        let o = self.offsets(b)?;
        let bytes_in_buffer = b.bytes_in_buffer(&o);

        let free_space = if b.overflowed_overwrite(o.overflow) {
            0
        } else if o.read > o.write {
            o.read - o.write
        } else {
            b.size - (o.write - o.read)
        };

        let (units_in_buffer, non_unit_bytes) = match b.indexer_count {
            Some(_) => {
                let (units, extra) = zone::index_units(&b.ring(), o.read, bytes_in_buffer);
                (Some(units), Some(extra))
            }
            None => (None, None),
        };

        Ok(BufferStatus {
            size: b.size,
            bytes_in_buffer,
            unit_count: o.unit_count,
            free_space,
            units_in_buffer,
            non_unit_bytes,
            overflowed: o.overflow
                & (dma_overflow::MARK_OVERFLOWED_OVERWRITE | dma_overflow::MARK_OVERFLOWED_DISCARD)
                != 0,
        })
    }

    /// Copies the next unit out of the buffer, into `dest1` and then `dest2`.
    fn buffer_read(
        &self,
        handle: Handle,
        rule: ReadQuantisation,
        read_offset: Option<u32>,
        leading_discard: u32,
        dest1: &mut [u8],
        dest2: &mut [u8],
    ) -> Result<ReadResult> {
        let b = self.buffers.get(handle)?;
        let o = self.offsets(b)?;
        let read = match read_offset {
            Some(offset) if offset >= b.size => return Err(Error::BadParameter),
            Some(offset) => offset,
            None => o.read,
        };

        let ring = b.ring();
        let bytes = if b.overflowed_overwrite(o.overflow) {
            b.size
        } else {
            ring.distance(read, o.qwrite)
        };
        if bytes == 0 {
            return Err(Error::NoPacket);
        }
        let room = (dest1.len() + dest2.len()).min(u32::MAX as usize) as u32;

        let (mut zone, pending) = match rule {
            ReadQuantisation::IgnoreQuantisation => {
                (zone::unquantised(read, bytes, room), Pending::None)
            }
            _ => self.buffer_zone(b, &ring, read, o.qwrite, bytes, room)?,
        };
        // An index event parcel can carry no data of its own; the caller still has to move past it.
        if zone.len == 0 && !matches!(pending, Pending::Index(_)) {
            return Err(Error::NoPacket);
        }
        if zone.truncated && rule != ReadQuantisation::AsUnitsAllowTruncation {
            return Err(Error::NotEnoughRoomToReturnData);
        }

        let metadata = match pending {
            Pending::None => UnitMetadata::None,
            Pending::Section { header, crc, size } => {
                let mut flush = b.flush.lock();
                UnitMetadata::Section(self.section_metadata(b.vdevice, &mut flush, &header, crc, size)?)
            }
            Pending::PartialPes(info) => UnitMetadata::PartialPes {
                continuity_counter: info.continuity_counter,
                payload_unit_start: info.payload_unit_start,
                discontinuity: info.discontinuity,
            },
            Pending::Index(index) => {
                let zone::IndexZone {
                    mut event,
                    slot_index,
                    buffer_index,
                    ..
                } = *index;
                event.slot = self.slot_handles.get(usize::from(slot_index));
                event.buffer = self.buffer_handles.get(usize::from(buffer_index));
                UnitMetadata::Index(event)
            }
        };

        let next_read_offset = zone.end(&ring);
        if leading_discard < zone.len {
            zone.start = ring.advance(zone.start, leading_discard);
            zone.len -= leading_discard;
        }

        let len = zone.len.min(room) as usize;
        let first = len.min(dest1.len());
        ring.read(zone.start, &mut dest1[..first])?;
        ring.read(ring.advance(zone.start, first as u32), &mut dest2[..len - first])?;

        trace!(
            "Read {} bytes from {:?} at {}, next unit at {}",
            len,
            handle,
            zone.start,
            next_read_offset
        );
        Ok(ReadResult {
            bytes_copied: len as u32,
            next_read_offset,
            metadata,
        })
    }

    /// Finds the unit at `read` according to what fills the buffer.
    fn buffer_zone(
        &self,
        b: &Buffer,
        ring: &Ring<'_>,
        read: u32,
        qwrite: u32,
        bytes: u32,
        room: u32,
    ) -> Result<(Zone, Pending)> {
        if b.slot_count.is_some() {
            match b.slot_mode {
                SlotMode::VideoEs | SlotMode::AudioEs => {
                    Ok((zone::unquantised(read, bytes, room), Pending::None))
                }
                SlotMode::PartialPes => {
                    let (zone, info) = zone::partial_pes(ring, read, qwrite, bytes, room)?;
                    Ok((zone, Pending::PartialPes(info)))
                }
                SlotMode::Pes => {
                    if b.metadata_suppressed > 0 {
                        return Err(Error::BufferHasNoMetadata);
                    }
                    Ok((zone::pes(ring, read, qwrite, bytes, room)?, Pending::None))
                }
                SlotMode::Pcr => Ok((zone::fixed(read, bytes, room, PCR_UNIT_SIZE)?, Pending::None)),
                SlotMode::Raw => {
                    let packet_size = self.vdevices.get(b.vdevice)?.config.packet_size;
                    let zone = zone::raw(read, bytes, room, packet_size, b.upper_threshold)?;
                    Ok((zone, Pending::None))
                }
                SlotMode::Section | SlotMode::Emm | SlotMode::Ecm => {
                    if b.metadata_suppressed > 0 {
                        return Err(Error::BufferHasNoMetadata);
                    }
                    let s = zone::section(ring, read, bytes, room)?;
                    Ok((
                        s.zone,
                        Pending::Section {
                            header: s.header,
                            crc: s.crc,
                            size: s.size,
                        },
                    ))
                }
                SlotMode::Null => Err(Error::BadParameter),
            }
        } else if b.indexer_count.is_some() {
            let index = zone::index(ring, read, bytes, room)?;
            Ok((index.zone, Pending::Index(Box::new(index))))
        } else {
            Err(Error::NoPacket)
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Hal {
    fn buffer_op<R>(&self, buffer: Handle, f: impl FnOnce(&mut PDeviceState) -> Result<R>) -> Result<R> {
        buffer.expect_kind(ObjectKind::Buffer)?;
        self.with_write(buffer, |s| {
            s.buffers.get(buffer)?;
            f(s)
        })
    }

    fn buffer_query<R>(&self, buffer: Handle, f: impl FnOnce(&PDeviceState) -> Result<R>) -> Result<R> {
        buffer.expect_kind(ObjectKind::Buffer)?;
        self.with_read(buffer, |s| {
            s.buffers.get(buffer)?;
            f(s)
        })
    }

    /// Sets the fill level at which the buffer's signal is posted.
    pub fn buffer_set_threshold(&self, buffer: Handle, threshold: u32) -> Result<()> {
        self.buffer_op(buffer, |s| s.buffer_set_threshold(buffer, threshold))
    }

    /// Throws away everything in the buffer.
    pub fn buffer_flush(&self, buffer: Handle) -> Result<()> {
        self.buffer_op(buffer, |s| s.buffer_flush(buffer))
    }

    /// Drops the matches of `filters` from the sections already in the buffer.
    ///
    /// The sections are still read; they just no longer report the flushed filters. At most eight
    /// flushes can be outstanding before the buffer has been read past them.
    pub fn buffer_filters_flush(&self, buffer: Handle, filters: &[Handle]) -> Result<()> {
        self.buffer_op(buffer, |s| s.buffer_filters_flush(buffer, filters))
    }

    pub fn buffer_get_write_offset(&self, buffer: Handle) -> Result<u32> {
        self.buffer_query(buffer, |s| s.buffer_get_write_offset(buffer))
    }

    /// Reads the next unit, or with [`ReadQuantisation::IgnoreQuantisation`] as many bytes as fit,
    /// starting at `read_offset` or at the buffer's read offset.
    ///
    /// The first `leading_discard` bytes of the unit are not copied, unless that would leave
    /// nothing. The read offset is not moved: pass [`ReadResult::next_read_offset`] to
    /// [`Hal::buffer_set_read_offset`] once the data has been consumed.
    pub fn buffer_read(
        &self,
        buffer: Handle,
        rule: ReadQuantisation,
        read_offset: Option<u32>,
        leading_discard: u32,
        dest1: &mut [u8],
        dest2: &mut [u8],
    ) -> Result<ReadResult> {
        self.buffer_query(buffer, |s| {
            s.buffer_read(buffer, rule, read_offset, leading_discard, dest1, dest2)
        })
    }

    pub fn buffer_set_read_offset(&self, buffer: Handle, offset: u32) -> Result<()> {
        self.buffer_op(buffer, |s| s.buffer_set_read_offset(buffer, offset))
    }

    pub fn buffer_status(&self, buffer: Handle) -> Result<BufferStatus> {
        self.buffer_query(buffer, |s| s.buffer_status(buffer))
    }

    /// The mode of the slots the buffer collects for.
    pub fn buffer_type(&self, buffer: Handle) -> Result<SlotMode> {
        self.buffer_query(buffer, |s| Ok(s.buffers.get(buffer)?.slot_mode))
    }

    /// Whether the firmware drops new data when the buffer is full, rather than overwriting the
    /// oldest.
    pub fn buffer_set_overflow_control(&self, buffer: Handle, discard: bool) -> Result<()> {
        self.buffer_op(buffer, |s| s.buffer_set_overflow_control(buffer, discard))
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::filter::{FilterType, FilterUpdate};
    use crate::hal::testing::*;
    use crate::hal::{AllocParams, SlotConfig};

    fn tp(rig: &Rig) -> Tp {
        rig.hal.with_read(rig.pdevice, |s| s.tp()).unwrap()
    }

    fn packet(fill: u8) -> Vec<u8> {
        let mut p = vec![0x47, 0x01, 0x00, 0x10];
        p.resize(188, fill);
        p
    }

    fn section_unit(slot: u8, matches: u64, payload: &[u8], crc: u8) -> Vec<u8> {
        let len = payload.len() as u16;
        let mut unit = vec![slot];
        unit.extend_from_slice(&matches.to_le_bytes());
        unit.extend_from_slice(&[0x42, 0xB0 | (len >> 8) as u8, len as u8]);
        unit.extend_from_slice(payload);
        unit.push(crc);
        unit
    }

    fn read(rig: &Rig, buffer: Handle, rule: ReadQuantisation, room: usize) -> Result<ReadResult> {
        let mut dest = vec![0; room];
        rig.hal.buffer_read(buffer, rule, None, 0, &mut dest, &mut [])
    }

    #[test]
    fn test_section_read_returns_one_section() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Section);
        let filter = rig.filter(FilterType::Long);
        let mut update = FilterUpdate::new(FilterType::Long);
        update.data = vec![0x42];
        update.mask = vec![0xFF];
        rig.hal.filter_update(filter, &update).unwrap();
        rig.hal.associate(slot, filter).unwrap();
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();

        let bit = rig
            .hal
            .with_read(filter, |s| Ok(s.filters.get(filter)?.filter_index))
            .unwrap()
            .unwrap();
        let payload: Vec<u8> = (0..20).collect();
        let unit = section_unit(rig.slot_index(slot) as u8, 1 << bit, &payload, 0);
        rig.tp.inject(rig.dma_index(buffer), &unit).unwrap();

        let mut dest = [0u8; 256];
        let result = rig
            .hal
            .buffer_read(buffer, ReadQuantisation::AsUnits, None, 0, &mut dest, &mut [])
            .unwrap();
        assert_eq!(result.bytes_copied, 20 + 3);
        assert_eq!(result.next_read_offset, 9 + 20 + 3 + 1);
        assert_eq!(&dest[..3], &[0x42, 0xB0, 20]);
        assert_eq!(&dest[3..23], payload.as_slice());
        match result.metadata {
            UnitMetadata::Section(m) => {
                assert_eq!(m.filters_matched(), 1);
                assert_eq!(m.filters, vec![Some(filter)]);
                assert!(m.crc_ok);
            }
            other => panic!("unexpected metadata {:?}", other),
        }

        // Nothing moves until the caller says so.
        assert_eq!(rig.hal.buffer_status(buffer).unwrap().bytes_in_buffer, unit.len() as u32);
        rig.hal
            .buffer_set_read_offset(buffer, result.next_read_offset)
            .unwrap();
        assert!(matches!(
            read(&rig, buffer, ReadQuantisation::AsUnits, 256),
            Err(Error::NoPacket)
        ));
    }

    #[test]
    fn test_section_truncation_rules() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Section);
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();
        let unit = section_unit(rig.slot_index(slot) as u8, 0, &[7; 40], 0);
        rig.tp.inject(rig.dma_index(buffer), &unit).unwrap();

        assert!(matches!(
            read(&rig, buffer, ReadQuantisation::AsUnits, 16),
            Err(Error::NotEnoughRoomToReturnData)
        ));
        let result = read(&rig, buffer, ReadQuantisation::AsUnitsAllowTruncation, 16).unwrap();
        assert_eq!(result.bytes_copied, 16);
        assert_eq!(result.next_read_offset, unit.len() as u32);

        let result = read(&rig, buffer, ReadQuantisation::IgnoreQuantisation, 16).unwrap();
        assert_eq!(result.bytes_copied, 16);
        assert_eq!(result.metadata, UnitMetadata::None);
    }

    #[test]
    fn test_two_destinations_and_leading_discard() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();
        rig.tp.inject(rig.dma_index(buffer), &packet(0xAA)).unwrap();

        let mut head = [0u8; 100];
        let mut tail = [0u8; 100];
        let result = rig
            .hal
            .buffer_read(buffer, ReadQuantisation::AsUnits, None, 4, &mut head, &mut tail)
            .unwrap();
        assert_eq!(result.bytes_copied, 184);
        assert_eq!(result.next_read_offset, 188);
        assert_eq!(head[0], 0xAA);
        assert_eq!(tail[83], 0xAA);
        assert_eq!(tail[84], 0);

        // A discard swallowing the whole unit is ignored.
        let result = rig
            .hal
            .buffer_read(buffer, ReadQuantisation::AsUnits, None, 500, &mut head, &mut tail)
            .unwrap();
        assert_eq!(result.bytes_copied, 188);
        assert_eq!(head[0], 0x47);
    }

    #[test]
    fn test_raw_reads_follow_threshold() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();
        let dma = rig.dma_index(buffer);
        for i in 0..3 {
            rig.tp.inject(dma, &packet(i)).unwrap();
        }

        let result = read(&rig, buffer, ReadQuantisation::AsUnits, 1024).unwrap();
        assert_eq!(result.bytes_copied, 188);

        rig.hal.buffer_set_threshold(buffer, 2 * 188 + 10).unwrap();
        let result = read(&rig, buffer, ReadQuantisation::AsUnits, 1024).unwrap();
        assert_eq!(result.bytes_copied, 2 * 188);

        let status = rig.hal.buffer_status(buffer).unwrap();
        assert_eq!(status.bytes_in_buffer, 3 * 188);
        assert_eq!(status.unit_count, 3);
        assert_eq!(status.free_space, 4096 - 3 * 188);
        assert_eq!(status.units_in_buffer, None);
        assert!(!status.overflowed);
        assert_eq!(rig.hal.buffer_get_write_offset(buffer).unwrap(), 3 * 188);
        assert_eq!(rig.hal.buffer_type(buffer).unwrap(), SlotMode::Raw);
    }

    #[test]
    fn test_explicit_read_offset() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let buffer = rig.buffer(1024);
        rig.hal.associate(slot, buffer).unwrap();
        let dma = rig.dma_index(buffer);
        rig.tp.inject(dma, &packet(1)).unwrap();
        rig.tp.inject(dma, &packet(2)).unwrap();

        let mut dest = [0u8; 188];
        let result = rig
            .hal
            .buffer_read(buffer, ReadQuantisation::AsUnits, Some(188), 4, &mut dest, &mut [])
            .unwrap();
        assert_eq!(dest[0], 2);
        assert_eq!(result.next_read_offset, 376);

        assert!(matches!(
            rig.hal
                .buffer_read(buffer, ReadQuantisation::AsUnits, Some(1024), 0, &mut dest, &mut []),
            Err(Error::BadParameter)
        ));
        assert!(matches!(
            rig.hal.buffer_set_read_offset(buffer, 1024),
            Err(Error::BadParameter)
        ));
    }

    #[test]
    fn test_slot_and_index_consumers_exclude_each_other() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let buffer = rig.buffer(4096);
        let index = rig.hal.allocate(rig.session, AllocParams::Index).unwrap();

        rig.hal.associate(slot, buffer).unwrap();
        assert!(matches!(
            rig.hal.associate(index, buffer),
            Err(Error::ObjectAlreadyAssociated)
        ));

        // Data left behind keeps the buffer a slot buffer.
        rig.tp.inject(rig.dma_index(buffer), &packet(0)).unwrap();
        rig.hal.disassociate(slot, Some(buffer)).unwrap();
        assert!(matches!(
            rig.hal.associate(index, buffer),
            Err(Error::ObjectAlreadyAssociated)
        ));

        // Once emptied it can be repurposed.
        rig.hal.buffer_flush(buffer).unwrap();
        rig.hal.associate(index, buffer).unwrap();
        assert!(matches!(
            rig.hal.associate(slot, buffer),
            Err(Error::ObjectAlreadyAssociated)
        ));
        let status = rig.hal.buffer_status(buffer).unwrap();
        assert_eq!(status.units_in_buffer, Some(0));
    }

    #[test]
    fn test_slots_sharing_a_buffer_must_agree_on_mode() {
        let rig = rig();
        let raw = rig.slot(SlotMode::Raw);
        let other_raw = rig.slot(SlotMode::Raw);
        let section = rig.slot(SlotMode::Section);
        let buffer = rig.buffer(4096);

        rig.hal.associate(raw, buffer).unwrap();
        rig.hal.associate(other_raw, buffer).unwrap();
        assert!(matches!(
            rig.hal.associate(section, buffer),
            Err(Error::InvalidSlotType)
        ));

        // The DMA entry outlives the first slot and goes with the last.
        let dma = rig.dma_index(buffer);
        rig.hal.disassociate(raw, Some(buffer)).unwrap();
        assert_eq!(rig.dma_index(buffer), dma);
        rig.hal.disassociate(other_raw, Some(buffer)).unwrap();
        let index = rig
            .hal
            .with_read(buffer, |s| Ok(s.buffers.get(buffer)?.buffer_index))
            .unwrap();
        assert_eq!(index, None);
        assert_eq!(tp(&rig).dma_info(dma).unwrap().size().read().unwrap(), 0);
    }

    #[test]
    fn test_offsets_survive_losing_the_dma_entry() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();
        rig.tp.inject(rig.dma_index(buffer), &packet(5)).unwrap();
        rig.hal.disassociate(slot, Some(buffer)).unwrap();

        // Read from the host's copy while unmapped.
        let result = read(&rig, buffer, ReadQuantisation::AsUnits, 256).unwrap();
        assert_eq!(result.bytes_copied, 188);

        rig.hal.associate(slot, buffer).unwrap();
        let tp = tp(&rig);
        let dma = tp.dma_info(rig.dma_index(buffer)).unwrap();
        assert_eq!(dma.qwrite_offset().read().unwrap(), 188);
        assert_eq!(dma.buffer_unit_count().read().unwrap(), 1);
    }

    #[test]
    fn test_metadata_suppressed_sections() {
        let rig = rig();
        let slot = rig
            .hal
            .allocate(
                rig.session,
                AllocParams::Slot(SlotConfig {
                    mode: SlotMode::Section,
                    suppress_metadata: true,
                    ..SlotConfig::default()
                }),
            )
            .unwrap();
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();
        rig.tp.inject(rig.dma_index(buffer), &[0; 20]).unwrap();

        assert!(matches!(
            read(&rig, buffer, ReadQuantisation::AsUnits, 256),
            Err(Error::BufferHasNoMetadata)
        ));
        assert_eq!(
            read(&rig, buffer, ReadQuantisation::IgnoreQuantisation, 256)
                .unwrap()
                .bytes_copied,
            20
        );
    }

    #[test]
    fn test_threshold_and_overflow_programming() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();
        let threshold = || {
            tp(&rig)
                .dma_info(rig.dma_index(buffer))
                .unwrap()
                .signal_threshold()
                .read()
                .unwrap()
        };

        // Without a signal there is nothing to signal.
        rig.hal.buffer_set_threshold(buffer, 1000).unwrap();
        assert_eq!(threshold(), DMA_INFO_NO_SIGNALLING);

        let signal = rig.hal.allocate(rig.session, AllocParams::Signal).unwrap();
        rig.hal.associate(signal, buffer).unwrap();
        assert_eq!(threshold(), 1000);

        rig.hal.buffer_set_overflow_control(buffer, false).unwrap();
        assert_eq!(threshold(), 1000 | DMA_INFO_ALLOW_OVERFLOW);

        let other = rig.hal.allocate(rig.session, AllocParams::Signal).unwrap();
        assert!(matches!(
            rig.hal.associate(other, buffer),
            Err(Error::OnlyOneSignalPerBuffer)
        ));

        rig.hal.disassociate(signal, Some(buffer)).unwrap();
        assert_eq!(threshold(), DMA_INFO_NO_SIGNALLING | DMA_INFO_ALLOW_OVERFLOW);
    }

    #[test]
    fn test_overflow_discard_and_overwrite() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let buffer = rig.buffer(188 * 3);
        rig.hal.associate(slot, buffer).unwrap();
        let dma = rig.dma_index(buffer);

        // Only two packets fit: one byte always stays free.
        assert_eq!(rig.tp.inject(dma, &packet(1)).unwrap(), 188);
        assert_eq!(rig.tp.inject(dma, &packet(2)).unwrap(), 188);
        assert_eq!(rig.tp.inject(dma, &packet(3)).unwrap(), 0);
        let status = rig.hal.buffer_status(buffer).unwrap();
        assert!(status.overflowed);
        assert_eq!(status.bytes_in_buffer, 2 * 188);

        rig.hal.buffer_flush(buffer).unwrap();
        assert!(!rig.hal.buffer_status(buffer).unwrap().overflowed);

        rig.hal.buffer_set_overflow_control(buffer, false).unwrap();
        for i in 0..3 {
            assert_eq!(rig.tp.inject(dma, &packet(i)).unwrap(), 188);
        }
        let status = rig.hal.buffer_status(buffer).unwrap();
        assert!(status.overflowed);
        assert_eq!(status.bytes_in_buffer, 188 * 3);
        assert_eq!(status.free_space, 0);

        // Moving the read offset asks the firmware to clear the overflow.
        rig.hal.buffer_set_read_offset(buffer, 188).unwrap();
        let flag = tp(&rig).dma_overflow_flag(dma).unwrap().read().unwrap();
        assert_ne!(flag & dma_overflow::MARK_RESET_OVERFLOW, 0);
    }

    #[test]
    fn test_flush_empties_and_clears_filter_flushes() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Section);
        let filter = rig.filter(FilterType::Long);
        rig.hal.associate(slot, filter).unwrap();
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();
        let unit = section_unit(rig.slot_index(slot) as u8, 0, &[1; 8], 0);
        let dma = rig.dma_index(buffer);

        // Each flush covers only what arrived since the previous one.
        for _ in 0..8 {
            rig.tp.inject(dma, &unit).unwrap();
            rig.hal.buffer_filters_flush(buffer, &[filter]).unwrap();
        }
        rig.hal.buffer_filters_flush(buffer, &[filter]).unwrap();
        rig.tp.inject(dma, &unit).unwrap();
        assert!(matches!(
            rig.hal.buffer_filters_flush(buffer, &[filter]),
            Err(Error::FlushFiltersNotSupported)
        ));

        rig.hal.buffer_flush(buffer).unwrap();
        let status = rig.hal.buffer_status(buffer).unwrap();
        assert_eq!((status.bytes_in_buffer, status.unit_count), (0, 0));
        rig.hal.buffer_filters_flush(buffer, &[filter]).unwrap();

        // The slot is back on after the flush.
        let mode = tp(&rig)
            .slot_info(rig.slot_index(slot))
            .unwrap()
            .slot_mode()
            .read()
            .unwrap();
        assert_eq!(mode, SlotMode::Section.tp_mode());
    }

    #[test]
    fn test_filters_flush_hides_matches() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Section);
        let filter = rig.filter(FilterType::Long);
        rig.hal.associate(slot, filter).unwrap();
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();
        let bit = rig
            .hal
            .with_read(filter, |s| Ok(s.filters.get(filter)?.filter_index))
            .unwrap()
            .unwrap();
        let unit = section_unit(rig.slot_index(slot) as u8, 1 << bit, &[1; 8], 0);
        let dma = rig.dma_index(buffer);
        rig.tp.inject(dma, &unit).unwrap();
        rig.hal.buffer_filters_flush(buffer, &[filter]).unwrap();
        rig.tp.inject(dma, &unit).unwrap();

        let first = read(&rig, buffer, ReadQuantisation::AsUnits, 256).unwrap();
        match first.metadata {
            UnitMetadata::Section(m) => assert_eq!(m.filters_matched(), 0),
            other => panic!("unexpected metadata {:?}", other),
        }
        rig.hal
            .buffer_set_read_offset(buffer, first.next_read_offset)
            .unwrap();

        let second = read(&rig, buffer, ReadQuantisation::AsUnits, 256).unwrap();
        match second.metadata {
            UnitMetadata::Section(m) => assert_eq!(m.filters, vec![Some(filter)]),
            other => panic!("unexpected metadata {:?}", other),
        }
    }

    #[test]
    fn test_manual_allocation_rejected() {
        let rig = rig();
        assert!(matches!(
            rig.hal.allocate(
                rig.session,
                AllocParams::Buffer(BufferConfig {
                    size: 4096,
                    manually_allocated: true,
                }),
            ),
            Err(Error::BadParameter)
        ));

        let buffer = rig.buffer(4096);
        assert_eq!(rig.tp.dma_allocations(), 1);
        rig.hal.deallocate(buffer, false).unwrap();
        assert_eq!(rig.tp.dma_allocations(), 0);
    }
}

/* ---------------------------------------------------------------------------------------------- */
