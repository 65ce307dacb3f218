// SPDX-License-Identifier: MIT OR Apache-2.0

//! Virtual devices: one demultiplexing context per input stream.
//!
//! Each vDevice owns a partition of the firmware PID table and of the section-filter CAM. The PID
//! partition grows one entry at a time as PIDs are set; when it cannot grow in place the
//! partitions of every vDevice are slid together, and if that is not enough, shrunk to what they
//! use, before the whole table is handed to the firmware again.

/* ---------------------------------------------------------------------------------------------- */

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};

use crate::config::{TransportProtocol, VDeviceConfig};
use crate::error::{Error, Result};
use crate::hal::event::{EventHandler, EventType};
use crate::hal::pdevice::PowerState;
use crate::hal::{Hal, PDeviceState, NO_INDEX, PID_INVALID};
use crate::interface::{
    data_entry_state, event_mask, status_flags, vdevice_flags, vdevice_mode, Tp, VDeviceInfo,
    MAX_CHAINED_SLOTS, MAX_FILTERS_PER_VDEVICE,
};
use crate::objman::{Handle, IndexList, ObjectKind};
use crate::partition::PartitionId;
use crate::regions::structured::retire;
use crate::tsinput::{Clk27MHz, InputTimer, STREAM_ID_NONE, STREAM_TAG_MASK};

/* ---------------------------------------------------------------------------------------------- */

/// Optional firmware behaviours of a vDevice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VDeviceFeature {
    /// Drop a packet whose continuity counter repeats the previous one.
    DiscardDuplicatePackets,
}

/// Stream counters, relative to the last reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStatistics {
    pub packet_count: u32,
    pub sync_error_count: u32,
    pub transport_error_count: u32,
    pub pid_mismatch_count: u32,
    pub cc_error_count: u32,
    pub buffer_overflow_count: u32,
    pub pes_header_error_count: u32,
    /// Share of the core's time spent processing, in percent.
    pub utilisation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VDeviceCapability {
    pub number_of_slots: u32,
    pub number_of_section_filters: u32,
    pub number_of_dma_structures: u32,
    pub number_of_indexers: u32,
    pub number_of_software_injectors: u32,
    pub max_slots_per_pid: u32,
    pub protocol: TransportProtocol,
    pub packet_size: u8,
    pub pid_wildcarding: bool,
}

#[derive(Debug)]
pub struct VDevice {
    pub(crate) config: VDeviceConfig,
    pub(crate) handler: Arc<dyn EventHandler>,

    /// Current size of the PID partition.
    pub(crate) number_of_slots: u32,
    pub(crate) pid_partition: PartitionId,
    pub(crate) cam_partition: Option<PartitionId>,
    /// Heads of the slot chains, by position in the PID partition.
    pub(crate) pid_indexes: IndexList,
    /// CAM filters, by position in the CAM partition.
    pub(crate) section_filters: IndexList,
    pub(crate) pes_filters: IndexList,
    pub(crate) proprietary_allocated: bool,

    pub(crate) stream_id: u32,
    pub(crate) use_timer_tag: bool,
    /// Stream to reconnect to on power up.
    pub(crate) saved_stream_id: Option<u32>,
    pub(crate) stats_baseline: StreamStatistics,
}

/* ---------------------------------------------------------------------------------------------- */

fn read_counters(info: &VDeviceInfo<'_>) -> Result<StreamStatistics> {
    Ok(StreamStatistics {
        packet_count: info.input_packet_count().read()?,
        sync_error_count: info.sync_err().read()?,
        transport_error_count: info.ts_err().read()?,
        pid_mismatch_count: info.pid_mismatch().read()?,
        cc_error_count: info.cc_err().read()?,
        buffer_overflow_count: info.buf_overflow().read()?,
        pes_header_error_count: info.pes_hdr_err().read()?,
        utilisation: 0,
    })
}

/// Puts a vDevice record into its just-allocated state.
fn init_vdevice_info(
    info: &VDeviceInfo<'_>,
    pid_base: u32,
    pid_size: u32,
    stream_id: u32,
) -> Result<()> {
    let entry = info.data_entry();
    retire(entry.state(), data_entry_state::EMPTY, || {
        entry.addr().write(0)?;
        entry.from_byte().write(0)?;
        entry.size().write(0)?;
        entry.count().write(0)?;
        entry.slot_index().write(NO_INDEX)
    })?;

    info.stream_tag().write((stream_id & STREAM_TAG_MASK) as u16)?;
    info.pid_filter_base().write(pid_base as u16)?;
    info.pid_filter_size().write(pid_size as u16)?;
    info.mode().write(vdevice_mode::DVB)?;
    info.stc_word0().write(0)?;
    info.stc_word1().write(0)?;
    info.flags().write(0)?;
    info.wildcard_slot_index().write(NO_INDEX)?;
    info.use_tcu().write(0)?;
    info.event_mask()
        .write((event_mask::ALL & !event_mask::VDEVICE_ENABLED) | status_flags::STATUS_BLK_OVERFLOW)?;
    Ok(())
}

impl PDeviceState {
    pub(crate) fn vdevice_allocate(
        &mut self,
        parent: Handle,
        config: VDeviceConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Handle> {
        if config.number_of_slots == 0 || config.number_of_section_filters > MAX_FILTERS_PER_VDEVICE
        {
            return Err(Error::BadParameter);
        }

        let pid_partition = self.pid_partitions.alloc(config.number_of_slots).map_err(|e| {
            error!("No room for {} PIDs", config.number_of_slots);
            e
        })?;
        let cam_partition = if config.number_of_section_filters > 0 {
            match self.cam_partitions.alloc(config.number_of_section_filters) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("No room for {} section filters", config.number_of_section_filters);
                    self.pid_partitions.free(pid_partition);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let vdevice = VDevice {
            number_of_slots: config.number_of_slots,
            pid_partition,
            cam_partition,
            pid_indexes: IndexList::new(config.number_of_slots as usize),
            section_filters: IndexList::new(config.number_of_section_filters as usize),
            pes_filters: IndexList::new(config.number_of_slots as usize),
            proprietary_allocated: false,
            stream_id: config.stream_id.unwrap_or(STREAM_ID_NONE),
            use_timer_tag: false,
            saved_stream_id: None,
            stats_baseline: StreamStatistics::default(),
            handler,
            config,
        };

        let handle = match self.vdevices.insert(vdevice) {
            Ok(h) => h,
            Err(e) => {
                self.pid_partitions.free(pid_partition);
                if let Some(c) = cam_partition {
                    self.cam_partitions.free(c);
                }
                return Err(e);
            }
        };
        self.links.add_child(parent, handle);

        if let Err(e) = self.vdevice_init(handle) {
            self.pid_partitions.free(pid_partition);
            if let Some(c) = cam_partition {
                self.cam_partitions.free(c);
            }
            self.discard(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn vdevice_init(&mut self, handle: Handle) -> Result<()> {
        if self.vdevices.len() == 1 {
            self.set_power_state(PowerState::Started)?;
        }
        let tp = self.tp()?;

        let vd = self.vdevices.get(handle)?;
        let base = self.pid_partitions.start_of(vd.pid_partition);
        let size = self.pid_partitions.size_of(vd.pid_partition);
        for i in base..base + size {
            tp.pid_table().at(i as usize)?.write(PID_INVALID)?;
            tp.pid_slot_mapping_table().at(i as usize)?.write(NO_INDEX)?;
        }

        let index = u32::from(handle.index());
        self.filter_cam_table_init(&tp, handle)?;

        let info = tp.vdevice_info(index)?;
        init_vdevice_info(&info, base, size, vd.stream_id)?;
        let baseline = read_counters(&info)?;
        self.vdevices.get_mut(handle)?.stats_baseline = baseline;

        debug!("vDevice {:?}: PIDs {}..{}", handle, base, base + size);
        Ok(())
    }

    pub(crate) fn vdevice_deallocate(&mut self, handle: Handle) -> Result<()> {
        let vd = self.vdevices.get(handle)?;
        if !vd.pid_indexes.is_empty() {
            warn!("vDevice {:?} still has {} PIDs set", handle, vd.pid_indexes.len());
        }
        if vd.stream_id != STREAM_ID_NONE {
            let pids = self.vdevice_pids(handle)?;
            for pid in pids {
                if let Err(e) = self.ts_input.set_clear_pid(self.index, vd.stream_id, pid, false) {
                    warn!("Failed to clear PID {:#x} on the input: {}", pid, e);
                }
            }
        }

        if let Ok(tp) = self.tp() {
            let info = tp.vdevice_info(u32::from(handle.index()))?;
            info.event_mask().write(0)?;
            info.pid_filter_size().write(0)?;
        }

        let vd = self.vdevices.remove(handle)?;
        self.pid_partitions.free(vd.pid_partition);
        if let Some(c) = vd.cam_partition {
            self.cam_partitions.free(c);
        }

        if self.vdevices.is_empty() {
            self.set_power_state(PowerState::Sleeping)?;
        }
        Ok(())
    }

    /// Every PID set on a slot of the vDevice, ascending.
    pub(crate) fn vdevice_pids(&self, handle: Handle) -> Result<Vec<u16>> {
        let vd = self.vdevices.get(handle)?;
        let mut pids = vd
            .pid_indexes
            .iter()
            .filter_map(|(_, head)| self.slots.get(head).ok())
            .map(|s| s.pid)
            .filter(|&pid| pid != PID_INVALID)
            .collect::<Vec<_>>();
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    /// Moves the vDevice to another input stream, re-routing all of its PIDs.
    pub(crate) fn vdevice_update_stream_id(
        &mut self,
        handle: Handle,
        stream_id: u32,
        use_timer_tag: bool,
    ) -> Result<()> {
        let tp = self.tp()?;
        let old = self.vdevices.get(handle)?.stream_id;

        if old != stream_id {
            for pid in self.vdevice_pids(handle)? {
                if old != STREAM_ID_NONE {
                    if let Err(e) = self.ts_input.set_clear_pid(self.index, old, pid, false) {
                        warn!("Failed to clear PID {:#x} on stream {:#x}: {}", pid, old, e);
                    }
                }
                if stream_id != STREAM_ID_NONE {
                    if let Err(e) = self.ts_input.set_clear_pid(self.index, stream_id, pid, true) {
                        warn!("Failed to set PID {:#x} on stream {:#x}: {}", pid, stream_id, e);
                    }
                }
            }
        }

        let info = tp.vdevice_info(u32::from(handle.index()))?;
        info.use_tcu().write(u16::from(use_timer_tag))?;
        info.stream_tag().write((stream_id & STREAM_TAG_MASK) as u16)?;

        let vd = self.vdevices.get_mut(handle)?;
        vd.stream_id = stream_id;
        vd.use_timer_tag = use_timer_tag;
        Ok(())
    }

    pub(crate) fn vdevice_set_event(
        &mut self,
        handle: Handle,
        event: EventType,
        enable: bool,
    ) -> Result<()> {
        let flags = event.status_flags().ok_or(Error::BadParameter)?;
        self.vdevices.get(handle)?;
        let tp = self.tp()?;
        tp.vdevice_info(u32::from(handle.index()))?
            .event_mask()
            .set_bits(flags, enable)?;
        Ok(())
    }

    fn vdevice_statistics(&self, handle: Handle) -> Result<StreamStatistics> {
        let vd = self.vdevices.get(handle)?;
        let tp = self.tp()?;
        let now = read_counters(&tp.vdevice_info(u32::from(handle.index()))?)?;
        let base = vd.stats_baseline;
        Ok(StreamStatistics {
            packet_count: now.packet_count.wrapping_sub(base.packet_count),
            sync_error_count: now.sync_error_count.wrapping_sub(base.sync_error_count),
            transport_error_count: now
                .transport_error_count
                .wrapping_sub(base.transport_error_count),
            pid_mismatch_count: now.pid_mismatch_count.wrapping_sub(base.pid_mismatch_count),
            cc_error_count: now.cc_error_count.wrapping_sub(base.cc_error_count),
            buffer_overflow_count: now
                .buffer_overflow_count
                .wrapping_sub(base.buffer_overflow_count),
            pes_header_error_count: now
                .pes_header_error_count
                .wrapping_sub(base.pes_header_error_count),
            utilisation: self.utilisation(&tp)?,
        })
    }

    fn vdevice_reset_statistics(&mut self, handle: Handle) -> Result<()> {
        let tp = self.tp()?;
        let now = read_counters(&tp.vdevice_info(u32::from(handle.index()))?)?;
        tp.pdevice_info().reset_idle_counters().write(1)?;
        self.vdevices.get_mut(handle)?.stats_baseline = now;
        Ok(())
    }

    fn vdevice_capability(&self, handle: Handle) -> Result<VDeviceCapability> {
        let vd = self.vdevices.get(handle)?;
        let capability = self.capability()?;
        Ok(VDeviceCapability {
            number_of_slots: vd.number_of_slots,
            number_of_section_filters: vd.config.number_of_section_filters,
            number_of_dma_structures: capability.number_of_dma_structures,
            number_of_indexers: capability.number_of_indexers,
            number_of_software_injectors: capability.number_of_software_injectors,
            max_slots_per_pid: MAX_CHAINED_SLOTS as u32,
            protocol: vd.config.protocol,
            packet_size: vd.config.packet_size,
            pid_wildcarding: true,
        })
    }

    fn vdevice_set_flag(&mut self, handle: Handle, flag: u32, enable: bool) -> Result<()> {
        self.vdevices.get(handle)?;
        let tp = self.tp()?;
        tp.vdevice_info(u32::from(handle.index()))?
            .flags()
            .set_bits(flag, enable)?;
        Ok(())
    }

    /// Disconnects the vDevice from its input and stops its injectors.
    fn vdevice_power_down(&mut self, handle: Handle) -> Result<()> {
        let vd = self.vdevices.get(handle)?;
        if vd.saved_stream_id.is_some() {
            return Ok(());
        }
        let saved = vd.stream_id;
        let use_timer_tag = vd.use_timer_tag;
        self.vdevice_update_stream_id(handle, STREAM_ID_NONE, use_timer_tag)?;

        let injectors = self
            .injectors
            .handles()
            .into_iter()
            .filter(|&i| self.links.ancestor(i, ObjectKind::VDevice) == Some(handle))
            .collect::<Vec<_>>();
        for injector in injectors {
            self.injector_abort(injector)?;
        }

        self.vdevices.get_mut(handle)?.saved_stream_id = Some(saved);
        info!("vDevice {:?} powered down", handle);
        Ok(())
    }

    fn vdevice_power_up(&mut self, handle: Handle) -> Result<()> {
        let vd = self.vdevices.get(handle)?;
        let saved = match vd.saved_stream_id {
            Some(saved) => saved,
            None => return Ok(()),
        };
        let use_timer_tag = vd.use_timer_tag;
        self.vdevice_update_stream_id(handle, saved, use_timer_tag)?;
        self.vdevices.get_mut(handle)?.saved_stream_id = None;
        info!("vDevice {:?} powered up", handle);
        Ok(())
    }

    fn vdevice_timer(&self, handle: Handle) -> Result<InputTimer> {
        let vd = self.vdevices.get(handle)?;
        if vd.use_timer_tag && vd.stream_id != STREAM_ID_NONE {
            return self.ts_input.get_timer(vd.stream_id);
        }

        let counter = self.backend.read_timer_counter();
        let system_time_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as u64);
        Ok(InputTimer {
            clock: Clk27MHz {
                div300_bit32: 0,
                div300_bit31to0: counter / 300,
                modulus300: (counter % 300) as u16,
            },
            system_time_us,
            is_tsin: false,
        })
    }

    /* ------------------------------------------------------------------------------------------ */

    fn set_pid_capacity(&mut self, handle: Handle, capacity: u32) -> Result<()> {
        let vd = self.vdevices.get_mut(handle)?;
        vd.number_of_slots = capacity;
        vd.pid_indexes.resize(capacity as usize);
        Ok(())
    }

    /// Makes room for one more PID chain.
    pub(crate) fn vdevice_grow_pid_table(&mut self, tp: &Tp, handle: Handle) -> Result<()> {
        let (partition, size) = {
            let vd = self.vdevices.get(handle)?;
            (vd.pid_partition, vd.number_of_slots)
        };
        let grown = size + 1;

        if self.pid_partitions.resize(partition, grown).is_ok() {
            let entry = (self.pid_partitions.start_of(partition) + size) as usize;
            tp.pid_slot_mapping_table().at(entry)?.write(NO_INDEX)?;
            tp.pid_table().at(entry)?.write(PID_INVALID)?;
            tp.vdevice_info(u32::from(handle.index()))?
                .pid_filter_size()
                .write(grown as u16)?;
            return self.set_pid_capacity(handle, grown);
        }

        debug!("vDevice {:?}: moving PID partition to grow it to {}", handle, grown);
        self.pid_partitions.free(partition);
        self.pid_partitions.defragment();

        let moved = match self.pid_partitions.alloc(grown) {
            Ok(p) => p,
            Err(_) => {
                self.compact_pid_partitions(Some(handle))?;
                self.pid_partitions.defragment();
                match self.pid_partitions.alloc(grown) {
                    Ok(p) => p,
                    Err(_) => {
                        error!("PID table full, cannot grow vDevice {:?}", handle);
                        let back = self.pid_partitions.alloc(size)?;
                        self.vdevices.get_mut(handle)?.pid_partition = back;
                        self.update_pid_table()?;
                        return Err(Error::NoMemory);
                    }
                }
            }
        };

        self.vdevices.get_mut(handle)?.pid_partition = moved;
        self.set_pid_capacity(handle, grown)?;
        self.update_pid_table()
    }

    /// Shrinks every vDevice's PID partition (but `skip`'s) to the chains it holds.
    pub(crate) fn compact_pid_partitions(&mut self, skip: Option<Handle>) -> Result<()> {
        for handle in self.vdevices.handles() {
            if Some(handle) == skip {
                continue;
            }
            let (heads, size, partition) = {
                let vd = self.vdevices.get(handle)?;
                let heads = vd.pid_indexes.iter().map(|(_, h)| h).collect::<Vec<_>>();
                (heads, vd.number_of_slots, vd.pid_partition)
            };
            let used = (heads.len() as u32).max(1);
            if used >= size {
                continue;
            }

            let mut list = IndexList::new(used as usize);
            for head in heads {
                let position = list.add(head)?;
                let mut member = Some(head);
                while let Some(slot) = member {
                    let s = self.slots.get_mut(slot)?;
                    s.pid_index = Some(position);
                    member = s.next;
                }
            }
            self.pid_partitions.resize(partition, used)?;

            let vd = self.vdevices.get_mut(handle)?;
            vd.pid_indexes = list;
            vd.number_of_slots = used;
            debug!("vDevice {:?}: PID partition compacted to {}", handle, used);
        }
        Ok(())
    }

    /// Tells the firmware where partitions are after they moved.
    pub(crate) fn relocate_pid_partitions(&mut self) -> Result<()> {
        self.update_pid_table()
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Hal {
    fn vdevice_op<R>(
        &self,
        vdevice: Handle,
        f: impl FnOnce(&mut PDeviceState) -> Result<R>,
    ) -> Result<R> {
        vdevice.expect_kind(ObjectKind::VDevice)?;
        self.with_write(vdevice, |s| {
            s.vdevices.get(vdevice)?;
            f(s)
        })
    }

    /// Connects the vDevice to an input stream; [`STREAM_ID_NONE`] disconnects it.
    pub fn vdevice_set_stream_id(
        &self,
        vdevice: Handle,
        stream_id: u32,
        use_timer_tag: bool,
    ) -> Result<()> {
        self.vdevice_op(vdevice, |s| {
            s.vdevice_update_stream_id(vdevice, stream_id, use_timer_tag)
        })
    }

    pub fn vdevice_get_stream_id(&self, vdevice: Handle) -> Result<u32> {
        vdevice.expect_kind(ObjectKind::VDevice)?;
        self.with_read(vdevice, |s| Ok(s.vdevices.get(vdevice)?.stream_id))
    }

    pub fn vdevice_enable_event(
        &self,
        vdevice: Handle,
        event: EventType,
        enable: bool,
    ) -> Result<()> {
        self.vdevice_op(vdevice, |s| s.vdevice_set_event(vdevice, event, enable))
    }

    pub fn vdevice_get_ts_protocol(&self, vdevice: Handle) -> Result<(TransportProtocol, u8)> {
        vdevice.expect_kind(ObjectKind::VDevice)?;
        self.with_read(vdevice, |s| {
            let vd = s.vdevices.get(vdevice)?;
            Ok((vd.config.protocol, vd.config.protocol.packet_size()))
        })
    }

    pub fn vdevice_statistics(&self, vdevice: Handle) -> Result<StreamStatistics> {
        vdevice.expect_kind(ObjectKind::VDevice)?;
        self.with_read(vdevice, |s| s.vdevice_statistics(vdevice))
    }

    pub fn vdevice_reset_statistics(&self, vdevice: Handle) -> Result<()> {
        self.vdevice_op(vdevice, |s| s.vdevice_reset_statistics(vdevice))
    }

    pub fn vdevice_capability(&self, vdevice: Handle) -> Result<VDeviceCapability> {
        vdevice.expect_kind(ObjectKind::VDevice)?;
        self.with_read(vdevice, |s| s.vdevice_capability(vdevice))
    }

    /// Lets RAW slots of the vDevice feed their indexers.
    pub fn vdevice_indexes_enable(&self, vdevice: Handle, enable: bool) -> Result<()> {
        self.vdevice_op(vdevice, |s| {
            s.vdevice_set_flag(vdevice, vdevice_flags::RAW_SLOT_INDEXES, enable)
        })
    }

    pub fn vdevice_feature_enable(
        &self,
        vdevice: Handle,
        feature: VDeviceFeature,
        enable: bool,
    ) -> Result<()> {
        let flag = match feature {
            VDeviceFeature::DiscardDuplicatePackets => vdevice_flags::DISCARD_DUPLICATE_PKTS,
        };
        self.vdevice_op(vdevice, |s| s.vdevice_set_flag(vdevice, flag, enable))
    }

    /// Restarts the firmware of the pDevice the vDevice lives on.
    pub fn vdevice_firmware_reset(&self, vdevice: Handle) -> Result<()> {
        self.vdevice_op(vdevice, |s| s.firmware_reset())
    }

    pub fn vdevice_power_down(&self, vdevice: Handle) -> Result<()> {
        self.vdevice_op(vdevice, |s| s.vdevice_power_down(vdevice))
    }

    pub fn vdevice_power_up(&self, vdevice: Handle) -> Result<()> {
        self.vdevice_op(vdevice, |s| s.vdevice_power_up(vdevice))
    }

    pub fn vdevice_get_timer(&self, vdevice: Handle) -> Result<InputTimer> {
        vdevice.expect_kind(ObjectKind::VDevice)?;
        self.with_read(vdevice, |s| s.vdevice_timer(vdevice))
    }

    /// Decodes the arrival-time tag the input block put in front of a packet.
    pub fn vdevice_translate_tag(&self, vdevice: Handle, word0: u32, word1: u32) -> Result<Clk27MHz> {
        vdevice.expect_kind(ObjectKind::VDevice)?;
        self.with_read(vdevice, |s| s.vdevices.get(vdevice).map(|_| ()))?;
        Ok(Clk27MHz::from_tag(word0, word1))
    }

    /// The slots collecting `pid`, head of chain first.
    pub fn vdevice_lookup_slots_for_pid(&self, vdevice: Handle, pid: u16) -> Result<Vec<Handle>> {
        vdevice.expect_kind(ObjectKind::VDevice)?;
        self.with_read(vdevice, |s| s.slots_for_pid(vdevice, pid))
    }

    pub fn vdevice_lookup_pids(&self, vdevice: Handle) -> Result<Vec<u16>> {
        vdevice.expect_kind(ObjectKind::VDevice)?;
        self.with_read(vdevice, |s| s.vdevice_pids(vdevice))
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
