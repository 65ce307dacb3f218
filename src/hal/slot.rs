// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slots: the per-PID packet collectors.
//!
//! A slot is switched on by giving it a PID. Every vDevice keeps, per PID it collects, a chain of
//! slots: the head of the chain is named in the vDevice's partition of the PID table (together
//! with its slot index in the mapping table), the rest hang off the head through the slots'
//! `next_slot` fields. The firmware walks the chain for each packet, so at most
//! [`MAX_CHAINED_SLOTS`] slots may share a PID.
//!
//! Slots associated with each other move together: setting the PID of one sets it on all of
//! them.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::VecDeque;

use log::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::hal::filter::FilterType;
use crate::hal::{Hal, PDeviceState, NO_INDEX, PID_INVALID, PID_WILDCARD};
use crate::interface::{
    data_entry_state, event_mask, filter_flags, section_params, secondary_pid, slot_flags,
    slot_mode, slot_state, status_flags, SlotInfo, Tp, MAX_CHAINED_SLOTS, SYNC_TP_SLOT_WAIT,
};
use crate::objman::{Handle, ObjectKind};
use crate::tsinput::STREAM_ID_NONE;

/* ---------------------------------------------------------------------------------------------- */

/// Remapping of the two scrambling-control bits that leaves them as they are.
const SC_REMAP_IDENTITY: u8 = 0xE4;

/// End of a PES marker chain.
const NO_MARKER: u8 = 0xFF;

/// What a slot does with the packets it collects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotMode {
    Null,
    Section,
    Pes,
    Raw,
    Pcr,
    Emm,
    Ecm,
    VideoEs,
    AudioEs,
    /// Whole packets, like [`SlotMode::Raw`], for a PES stream that is parsed elsewhere.
    PartialPes,
}

impl Default for SlotMode {
    fn default() -> Self {
        SlotMode::Null
    }
}

impl SlotMode {
    /// The firmware's name for the mode.
    pub(crate) fn tp_mode(self) -> u8 {
        match self {
            SlotMode::Null => slot_mode::NULL,
            SlotMode::Section => slot_mode::SECTION,
            SlotMode::Pes => slot_mode::PES,
            SlotMode::Raw | SlotMode::PartialPes => slot_mode::RAW,
            SlotMode::Pcr => slot_mode::PCR,
            SlotMode::Emm => slot_mode::EMM,
            SlotMode::Ecm => slot_mode::ECM,
            SlotMode::VideoEs | SlotMode::AudioEs => slot_mode::ES,
        }
    }

    /// Whether the slot carries sections, and so takes section filters.
    pub fn is_section(self) -> bool {
        matches!(self, SlotMode::Section | SlotMode::Emm | SlotMode::Ecm)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotConfig {
    pub mode: SlotMode,
    /// Leave the per-unit metadata out of the buffer.
    pub suppress_metadata: bool,
    /// The buffer is drained by software as a FIFO; the firmware never winds back into it.
    pub software_cd_fifo: bool,
    /// Data entries replace packets of the stream.
    pub data_entry_replacement: bool,
    /// Data entries are inserted into the stream.
    pub data_entry_insertion: bool,
}

/// Slot events that are off until enabled on the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotEvent {
    ScrambleToClear,
    ClearToScramble,
    PcrReceived,
}

impl SlotEvent {
    fn status_flag(self) -> u32 {
        match self {
            SlotEvent::ScrambleToClear => status_flags::SCRAMBLE_TOCLEAR,
            SlotEvent::ClearToScramble => status_flags::CLEAR_TOSCRAMBLE,
            SlotEvent::PcrReceived => status_flags::PCR_RECEIVED,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotFeature {
    /// Accept packets whatever their continuity counter.
    SuppressCc,
    /// Prefix each packet with a DLNA time stamp. RAW slots only.
    DnlaPrefix,
    /// Rewrite continuity counters so that the output is continuous. RAW slots only.
    CcFixup,
    /// Count units in the metadata of the buffer. ECM slots only.
    OutputBufferCount,
}

/// How packets of a secondary PID are merged into the primary's stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecondaryPidMode {
    Substitution,
    Insertion,
    InsertDelete,
}

impl SecondaryPidMode {
    fn bits(self) -> u16 {
        match self {
            SecondaryPidMode::Substitution => secondary_pid::SUBSTITUTION,
            SecondaryPidMode::Insertion => secondary_pid::INSERTION,
            SecondaryPidMode::InsertDelete => secondary_pid::INSERTDELETE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SecondaryRole {
    Primary,
    Secondary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SecondaryLink {
    pub(crate) partner: Handle,
    pub(crate) role: SecondaryRole,
    pub(crate) mode: SecondaryPidMode,
}

/// Scrambling of the last packet the slot saw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrambleState {
    Clear,
    TransportEven,
    TransportOdd,
    /// Scrambled at the PES level; the transport layer is clear.
    PesScrambled,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotState {
    pub packet_count: u32,
    pub scrambling: ScrambleState,
}

/// Where a secure path sends the packets of a RAW slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecureOutputNode {
    Clear,
    Scrambled,
}

#[derive(Debug)]
pub struct Slot {
    pub(crate) vdevice: Handle,
    pub(crate) config: SlotConfig,
    pub(crate) slot_index: u16,

    pub(crate) pid: u16,
    /// Position of the chain in the vDevice's PID partition.
    pub(crate) pid_index: Option<usize>,
    pub(crate) prev: Option<Handle>,
    pub(crate) next: Option<Handle>,

    pub(crate) secondary: Option<SecondaryLink>,
    pub(crate) security_path_id: u32,

    /// Data entries waiting to be handed to the firmware.
    pub(crate) data_entries: VecDeque<Handle>,
    /// The data entry the firmware is working on.
    pub(crate) entry_in_flight: Option<Handle>,
    /// DMA of a data entry deallocated while the firmware still held it.
    pub(crate) orphaned_dma: Option<u32>,
}

impl Slot {
    fn new(vdevice: Handle, config: SlotConfig) -> Slot {
        Slot {
            vdevice,
            config,
            slot_index: NO_INDEX,
            pid: PID_INVALID,
            pid_index: None,
            prev: None,
            next: None,
            secondary: None,
            security_path_id: 0,
            data_entries: VecDeque::new(),
            entry_in_flight: None,
            orphaned_dma: None,
        }
    }

    pub(crate) fn mode(&self) -> SlotMode {
        self.config.mode
    }

    fn role(&self) -> Option<SecondaryRole> {
        self.secondary.map(|l| l.role)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Puts a slot record into its unused state.
pub(crate) fn blank_slot_info(info: &SlotInfo<'_>) -> Result<()> {
    info.slot_mode().write(slot_mode::NULL)?;
    info.mode_area().fill(0)?;
    info.slot_state().write(slot_state::TS_SC_NOT_SYNCED)?;
    info.remaining_pes_header_length().write(0)?;
    info.secondary_pid_info().write(0)?;
    info.slot_flags().write(0)?;
    info.next_slot().write(NO_INDEX)?;
    info.key_index().write(0)?;
    info.event_mask().write(event_mask::ALL & !event_mask::SLOT_ENABLED)?;
    info.indexer().write(NO_INDEX)?;
    info.dma_record().write(NO_INDEX)?;
    info.packet_count().write(0)?;
    Ok(())
}

fn decode_scrambling(state: u16) -> ScrambleState {
    if state & slot_state::PES_SC_MASK != 0 {
        return ScrambleState::PesScrambled;
    }
    match (state & slot_state::TS_SC_MASK) >> slot_state::TS_SC_OFFSET {
        0 => ScrambleState::Clear,
        2 => ScrambleState::TransportEven,
        3 => ScrambleState::TransportOdd,
        _ => ScrambleState::Unknown,
    }
}

/// Filters that may share a section slot.
fn filters_mix(a: FilterType, b: FilterType) -> bool {
    match (a.cam_class(), b.cam_class()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

impl PDeviceState {
    pub(crate) fn slot_allocate(&mut self, parent: Handle, config: SlotConfig) -> Result<Handle> {
        if config.data_entry_replacement && config.data_entry_insertion {
            return Err(Error::BadParameter);
        }
        let vdevice = self
            .links
            .ancestor(parent, ObjectKind::VDevice)
            .ok_or(Error::BadParameter)?;
        let tp = self.tp()?;

        let handle = self.slots.insert(Slot::new(vdevice, config))?;
        self.links.add_child(parent, handle);

        let slot_index = match self.slot_handles.add(handle) {
            Ok(i) if i < tp.layout().number_of_slots as usize => i,
            Ok(i) => {
                self.slot_handles.remove(i);
                self.discard(handle);
                return Err(Error::NoMemory);
            }
            Err(e) => {
                self.discard(handle);
                return Err(e);
            }
        };

        match self.slot_init(&tp, handle, slot_index as u16) {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.slot_handles.remove(slot_index);
                self.discard(handle);
                Err(e)
            }
        }
    }

    fn slot_init(&mut self, tp: &Tp, handle: Handle, slot_index: u16) -> Result<()> {
        let s = self.slots.get_mut(handle)?;
        s.slot_index = slot_index;
        let config = s.config;

        let info = tp.slot_info(slot_index)?;
        blank_slot_info(&info)?;

        let mut flags = 0;
        if config.suppress_metadata || config.software_cd_fifo {
            flags |= slot_flags::SUPPRESS_METADATA;
        }
        if config.software_cd_fifo {
            flags |= slot_flags::NO_WINDBACK | slot_flags::SW_CD_FIFO;
        }

        match config.mode {
            SlotMode::Section | SlotMode::Emm | SlotMode::Ecm => {
                info.section_params().write(section_params::NONE)?;
            }
            SlotMode::Pes => {
                info.pes_state().write(0)?;
                info.pes_streamid_filterdata().write(0)?;
                info.pes_marker_index().write(NO_MARKER)?;
            }
            SlotMode::Raw | SlotMode::PartialPes => {
                info.raw_sc_remap().write(SC_REMAP_IDENTITY)?;
                info.raw_remap_pid().write(PID_INVALID)?;
                info.raw_cc_fixup().write(0)?;
                let entry = info.raw_data_entry();
                entry.addr().write(0)?;
                entry.size().write(0)?;
                entry.state().write(data_entry_state::EMPTY)?;
                if config.data_entry_replacement {
                    flags |= slot_flags::ENTRY_REPLACEMENT;
                }
                if config.data_entry_insertion {
                    flags |= slot_flags::ENTRY_INSERTION;
                }
            }
            _ => {}
        }
        info.slot_flags().write(flags)?;

        trace!("Slot {} is {:?}", slot_index, config.mode);
        self.activate(tp, handle)
    }

    pub(crate) fn slot_deallocate(&mut self, handle: Handle) -> Result<()> {
        let tp = self.tp()?;
        let (slot_index, vdevice, pid, link) = {
            let s = self.slots.get(handle)?;
            (s.slot_index, s.vdevice, s.pid, s.secondary)
        };

        if let Some(link) = link {
            let partner_index = {
                let partner = self.slots.get_mut(link.partner)?;
                partner.secondary = None;
                partner.slot_index
            };
            tp.slot_info(partner_index)?.secondary_pid_info().write(0)?;
            self.reset_state(&tp, &[link.partner], false)?;
            tp.slot_info(slot_index)?.secondary_pid_info().write(0)?;
            self.slots.get_mut(handle)?.secondary = None;
        }

        if pid != PID_INVALID {
            self.unchain(&tp, handle)?;
            self.notify_pid_released(vdevice, pid)?;
            self.reset_state(&tp, &[handle], true)?;
        }

        blank_slot_info(&tp.slot_info(slot_index)?)?;
        self.slot_handles.remove(usize::from(slot_index));
        let slot = self.slots.remove(handle)?;
        if let Some(address) = slot.orphaned_dma {
            self.backend.free_dma(address);
        }
        Ok(())
    }

    pub(crate) fn slot_associator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        let tp = self.tp()?;
        let (slot_index, mode) = {
            let s = self.slots.get(handle)?;
            (s.slot_index, s.mode())
        };
        let info = tp.slot_info(slot_index)?;

        match other.kind() {
            ObjectKind::Slot => {
                let a = self.slots.get(handle)?;
                let b = self.slots.get(other)?;
                if a.pid != PID_INVALID || b.pid != PID_INVALID {
                    return Err(Error::NotAllowedWhilstPidSet);
                }
                if a.security_path_id != b.security_path_id {
                    return Err(Error::DifferingSecurityPathIds);
                }
                Ok(())
            }
            ObjectKind::DataEntry => {
                if self.slots.get(handle)?.secondary.is_some() {
                    return Err(Error::SlotSecondaryPidInUse);
                }
                Ok(())
            }
            ObjectKind::Index => {
                if self.links.count_associated(handle, ObjectKind::Index) > 1 {
                    return Err(Error::IndexSlotAlreadyAssociated);
                }
                info.indexer().write(self.indexes.get(other)?.indexer_index)?;
                Ok(())
            }
            ObjectKind::Buffer => {
                if self.links.count_associated(handle, ObjectKind::Buffer) > 1 {
                    return Err(Error::SlotAlreadyLinked);
                }
                let dma = self.buffers.get(other)?.buffer_index.ok_or(Error::BadParameter)?;
                info.dma_record().write(dma)?;
                if mode == SlotMode::Pes {
                    info.pes_state().write(0)?;
                }
                Ok(())
            }
            ObjectKind::Filter => self.slot_attach_filter(handle, other),
            _ => Err(Error::BadParameter),
        }
    }

    fn slot_attach_filter(&mut self, handle: Handle, filter: Handle) -> Result<()> {
        let (mode, vdevice) = {
            let s = self.slots.get(handle)?;
            (s.mode(), s.vdevice)
        };
        let (filter_type, enable) = {
            let f = self.filters.get(filter)?;
            (f.filter_type, f.enable_on_association)
        };
        let count = self.links.count_associated(handle, ObjectKind::Filter);

        match mode {
            SlotMode::Pes => {
                if filter_type != FilterType::PesStreamId {
                    return Err(Error::InvalidSlotType);
                }
                if count > 1 {
                    return Err(Error::InvalidFilterOperatingMode);
                }
                self.update_filter_state(handle, filter, !enable, enable)
            }
            m if m.is_section() => match filter_type {
                FilterType::Tiny if count > 1 => Err(Error::InvalidFilterOperatingMode),
                FilterType::Tiny => self.update_filter_state(handle, filter, !enable, enable),
                FilterType::Proprietary => {
                    if self.vdevices.get(vdevice)?.proprietary_allocated {
                        return Err(Error::InvalidFilterOperatingMode);
                    }
                    self.update_filter_state(handle, filter, !enable, enable)?;
                    self.vdevices.get_mut(vdevice)?.proprietary_allocated = true;
                    Ok(())
                }
                FilterType::PesStreamId | FilterType::No => Err(Error::InvalidFilterType),
                _ => {
                    for other in self.links.associated_of_kind(handle, ObjectKind::Filter) {
                        if !filters_mix(filter_type, self.filters.get(other)?.filter_type) {
                            return Err(Error::InvalidFilterType);
                        }
                    }
                    self.update_filter_state(handle, filter, !enable, enable)
                }
            },
            _ => Err(Error::InvalidSlotType),
        }
    }

    pub(crate) fn slot_disassociator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        let tp = self.tp()?;
        let (slot_index, mode, pid, vdevice) = {
            let s = self.slots.get(handle)?;
            (s.slot_index, s.mode(), s.pid, s.vdevice)
        };
        let info = tp.slot_info(slot_index)?;

        match other.kind() {
            ObjectKind::Slot | ObjectKind::DataEntry => Ok(()),
            ObjectKind::Index => {
                info.indexer().write(NO_INDEX)?;
                if pid != PID_INVALID {
                    let _ = self.slot_tp_sync(&tp);
                }
                Ok(())
            }
            ObjectKind::Buffer => {
                info.dma_record().write(NO_INDEX)?;
                Ok(())
            }
            ObjectKind::Filter => {
                if let Err(e) = self.update_filter_state(handle, other, true, false) {
                    warn!("Failed to disable {:?} on slot {}: {}", other, slot_index, e);
                }
                if pid != PID_INVALID {
                    let _ = self.slot_tp_sync(&tp);
                }
                if mode.is_section() {
                    // The link is still in place while disassociators run.
                    if self.links.count_associated(handle, ObjectKind::Filter) == 1 {
                        info.section_params().write(section_params::NONE)?;
                    }
                    if self.filters.get(other)?.filter_type == FilterType::Proprietary {
                        self.vdevices.get_mut(vdevice)?.proprietary_allocated = false;
                    }
                }
                Ok(())
            }
            _ => {
                error!("Slot {:?} was never associated with {:?}", handle, other);
                Ok(())
            }
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Waits until the firmware is not processing a packet on any slot.
    ///
    /// A stalled firmware is logged here; callers decide whether to carry on.
    pub(crate) fn slot_tp_sync(&self, tp: &Tp) -> Result<()> {
        self.tp_sync(tp, SYNC_TP_SLOT_WAIT).map_err(|e| {
            if let Error::Timeout = e {
                error!("Unable to obtain slot sync point, TP stalled?");
            }
            e
        })
    }

    /// Lets the firmware process packets for the slot again.
    pub(crate) fn activate(&self, tp: &Tp, handle: Handle) -> Result<()> {
        let s = self.slots.get(handle)?;
        tp.slot_info(s.slot_index)?
            .slot_mode()
            .write(s.mode().tp_mode())?;
        Ok(())
    }

    /// Returns slots to the state they had when allocated, keeping their associations.
    ///
    /// The slots are switched off for the duration; they are switched back on unless
    /// `keep_deactivated` is set.
    pub(crate) fn reset_state(
        &mut self,
        tp: &Tp,
        slots: &[Handle],
        keep_deactivated: bool,
    ) -> Result<()> {
        let mut active = false;
        for &slot in slots {
            let s = self.slots.get(slot)?;
            tp.slot_info(s.slot_index)?.slot_mode().write(slot_mode::NULL)?;
            active |= s.pid != PID_INVALID;
        }
        if active {
            // Timeouts are logged by the sync; the reset goes ahead either way.
            let _ = self.slot_tp_sync(tp);
        }

        for &slot in slots {
            let (slot_index, mode) = {
                let s = self.slots.get(slot)?;
                (s.slot_index, s.mode())
            };
            let info = tp.slot_info(slot_index)?;
            info.slot_state().write(slot_state::TS_SC_NOT_SYNCED)?;
            info.remaining_pes_header_length().write(0)?;

            if mode.is_section() {
                info.section_stage().write(0)?;
            } else if mode == SlotMode::Pes {
                info.pes_state().write(0)?;
                self.release_markers(tp, &info)?;
            }

            if let Some(index) = self
                .links
                .associated_of_kind(slot, ObjectKind::Index)
                .first()
            {
                info.indexer().write(self.indexes.get(*index)?.indexer_index)?;
            }
            if mode != SlotMode::Raw {
                if let Some(buffer) = self
                    .links
                    .associated_of_kind(slot, ObjectKind::Buffer)
                    .first()
                {
                    self.buffer_windback_qwrite(tp, *buffer)?;
                }
            }

            if !keep_deactivated {
                self.activate(tp, slot)?;
            }
        }
        Ok(())
    }

    /// Hands the PES markers queued on a slot back to the pool.
    fn release_markers(&self, tp: &Tp, info: &SlotInfo<'_>) -> Result<()> {
        let markers = tp.pes_markers();
        let mut next = info.pes_marker_index().read()?;
        let mut released = 0;
        while next != NO_MARKER && released < markers.len() {
            let marker = markers.at(usize::from(next))?;
            marker.allocated().write(0)?;
            next = marker.next_index().read()?;
            marker.next_index().write(NO_MARKER)?;
            released += 1;
        }
        info.pes_marker_index().write(NO_MARKER)?;
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    /// The slots collecting `pid` on a vDevice, head of the chain first.
    pub(crate) fn slots_for_pid(&self, vdevice: Handle, pid: u16) -> Result<Vec<Handle>> {
        let vd = self.vdevices.get(vdevice)?;
        for (_, head) in vd.pid_indexes.iter() {
            if self.slots.get(head)?.pid != pid {
                continue;
            }
            let mut chain = Vec::new();
            let mut member = Some(head);
            while let Some(slot) = member {
                if chain.len() > self.slots.len() {
                    error!("Slot chain for PID {:#x} loops", pid);
                    break;
                }
                chain.push(slot);
                member = self.slots.get(slot)?.next;
            }
            return Ok(chain);
        }
        Ok(Vec::new())
    }

    fn pid_entry(&self, vdevice: Handle, pid_index: usize) -> Result<usize> {
        let vd = self.vdevices.get(vdevice)?;
        Ok(self.pid_partitions.start_of(vd.pid_partition) as usize + pid_index)
    }

    /// Takes a slot off its PID chain. The slot's `pid` is left for the caller to change.
    fn unchain(&mut self, tp: &Tp, handle: Handle) -> Result<()> {
        let (vdevice, slot_index, pid, pid_index, prev, next) = {
            let s = self.slots.get(handle)?;
            (s.vdevice, s.slot_index, s.pid, s.pid_index, s.prev, s.next)
        };

        match prev {
            None => {
                if pid == PID_WILDCARD {
                    let wildcard = match next {
                        Some(n) => self.slots.get(n)?.slot_index,
                        None => NO_INDEX,
                    };
                    tp.vdevice_info(u32::from(vdevice.index()))?
                        .wildcard_slot_index()
                        .write(wildcard)?;
                }
                if let Some(i) = pid_index {
                    let entry = self.pid_entry(vdevice, i)?;
                    match next {
                        Some(n) => {
                            self.vdevices.get_mut(vdevice)?.pid_indexes.replace(i, n);
                            let ns = self.slots.get_mut(n)?;
                            ns.prev = None;
                            tp.pid_slot_mapping_table().at(entry)?.write(ns.slot_index)?;
                        }
                        None => {
                            tp.pid_table().at(entry)?.write(PID_INVALID)?;
                            tp.pid_slot_mapping_table().at(entry)?.write(NO_INDEX)?;
                            self.vdevices.get_mut(vdevice)?.pid_indexes.remove(i);
                        }
                    }
                }
            }
            Some(p) => {
                let follower = match next {
                    Some(n) => {
                        let ns = self.slots.get_mut(n)?;
                        ns.prev = Some(p);
                        ns.slot_index
                    }
                    None => NO_INDEX,
                };
                let ps = self.slots.get_mut(p)?;
                ps.next = next;
                tp.slot_info(ps.slot_index)?.next_slot().write(follower)?;
            }
        }

        let s = self.slots.get_mut(handle)?;
        s.prev = None;
        s.next = None;
        s.pid_index = None;
        tp.slot_info(slot_index)?.next_slot().write(NO_INDEX)?;
        Ok(())
    }

    /// Puts a slot at the tail of the chain for `pid`, starting a new chain if there is none.
    fn chain(&mut self, tp: &Tp, handle: Handle, pid: u16) -> Result<()> {
        let (vdevice, slot_index, link) = {
            let s = self.slots.get(handle)?;
            (s.vdevice, s.slot_index, s.secondary)
        };
        let existing = self.slots_for_pid(vdevice, pid)?;

        let (pid_index, tail) = match (existing.first(), existing.last()) {
            (Some(&head), Some(&tail)) => {
                let i = self.slots.get(head)?.pid_index.ok_or(Error::BadParameter)?;
                (i, Some(tail))
            }
            _ => {
                let (used, size) = {
                    let vd = self.vdevices.get(vdevice)?;
                    (vd.pid_indexes.len(), vd.number_of_slots as usize)
                };
                if used >= size {
                    self.vdevice_grow_pid_table(tp, vdevice)?;
                }
                let vd = self.vdevices.get_mut(vdevice)?;
                let i = vd.pid_indexes.add(handle)?;
                if i >= vd.number_of_slots as usize {
                    vd.pid_indexes.remove(i);
                    return Err(Error::NoMemory);
                }
                (i, None)
            }
        };

        tp.slot_info(slot_index)?.next_slot().write(NO_INDEX)?;
        match tail {
            None if pid == PID_WILDCARD => {
                tp.vdevice_info(u32::from(vdevice.index()))?
                    .wildcard_slot_index()
                    .write(slot_index)?;
            }
            None => {}
            Some(t) => {
                let ts = self.slots.get_mut(t)?;
                ts.next = Some(handle);
                tp.slot_info(ts.slot_index)?.next_slot().write(slot_index)?;
                self.slots.get_mut(handle)?.prev = Some(t);
            }
        }
        self.slots.get_mut(handle)?.pid_index = Some(pid_index);

        if let Some(link) = link {
            match link.role {
                SecondaryRole::Primary => {
                    let partner = self.slots.get(link.partner)?.slot_index;
                    tp.slot_info(partner)?
                        .secondary_pid_info()
                        .write(secondary_pid::SECONDARY_SLOT | pid)?;
                }
                SecondaryRole::Secondary => {
                    let primary_pid = self.slots.get(link.partner)?.pid;
                    tp.slot_info(slot_index)?
                        .secondary_pid_info()
                        .write(secondary_pid::SECONDARY_SLOT | primary_pid)?;
                }
            }
        }

        if tail.is_none() {
            // Growing may have moved the partition.
            let entry = self.pid_entry(vdevice, pid_index)?;
            tp.pid_slot_mapping_table().at(entry)?.write(slot_index)?;
            tp.pid_table().at(entry)?.write(pid)?;
        }
        Ok(())
    }

    /// Stops the input routing `pid` to the vDevice once no slot collects it.
    fn notify_pid_released(&self, vdevice: Handle, pid: u16) -> Result<()> {
        let stream_id = self.vdevices.get(vdevice)?.stream_id;
        if stream_id != STREAM_ID_NONE && self.slots_for_pid(vdevice, pid)?.is_empty() {
            if let Err(e) = self.ts_input.set_clear_pid(self.index, stream_id, pid, false) {
                warn!("Failed to clear PID {:#x} on stream {:#x}: {}", pid, stream_id, e);
            }
        }
        Ok(())
    }

    fn notify_pid_claimed(&self, vdevice: Handle, pid: u16) -> Result<()> {
        let stream_id = self.vdevices.get(vdevice)?.stream_id;
        if stream_id != STREAM_ID_NONE && self.slots_for_pid(vdevice, pid)?.is_empty() {
            if let Err(e) = self.ts_input.set_clear_pid(self.index, stream_id, pid, true) {
                warn!("Failed to set PID {:#x} on stream {:#x}: {}", pid, stream_id, e);
            }
        }
        Ok(())
    }

    /// Moves one slot to `pid`.
    fn set_pid_worker(&mut self, tp: &Tp, handle: Handle, pid: u16, suppress_reset: bool) -> Result<()> {
        let (vdevice, original) = {
            let s = self.slots.get(handle)?;
            (s.vdevice, s.pid)
        };
        if original == pid && pid != PID_INVALID {
            return Ok(());
        }

        if original != PID_INVALID {
            self.unchain(tp, handle)?;
            self.notify_pid_released(vdevice, original)?;
        }

        if pid == PID_INVALID {
            if !suppress_reset {
                self.reset_state(tp, &[handle], true)?;
            }
            self.slots.get_mut(handle)?.pid = PID_INVALID;
            return Ok(());
        }

        self.notify_pid_claimed(vdevice, pid)?;
        match self.chain(tp, handle, pid) {
            Ok(()) => {
                self.slots.get_mut(handle)?.pid = pid;
                self.activate(tp, handle)
            }
            Err(e) => {
                self.slots.get_mut(handle)?.pid = PID_INVALID;
                self.notify_pid_released(vdevice, pid)?;
                Err(e)
            }
        }
    }

    /// Checks that a slot and the slots associated with it may all move to `pid`, and
    /// returns the security path id the new chain forces on them, if any.
    fn check_pid_change(&self, handle: Handle, group: &[Handle], pid: u16) -> Result<Option<u32>> {
        if pid > PID_WILDCARD {
            return Err(Error::BadParameter);
        }
        let s = self.slots.get(handle)?;
        let chain = self.slots_for_pid(s.vdevice, pid)?;

        let mut path_id = None;
        let mut primary_found = false;
        let mut secondary_found = false;
        let mut others = 0;
        for &member in chain.iter().filter(|&&m| m != handle) {
            let m = self.slots.get(member)?;
            if m.security_path_id != s.security_path_id {
                path_id = Some(m.security_path_id);
            }
            match m.role() {
                Some(SecondaryRole::Primary) => primary_found = true,
                Some(SecondaryRole::Secondary) => secondary_found = true,
                None => {}
            }
            if !group.contains(&member) {
                others += 1;
            }
        }
        for &member in group {
            if self.slots.get(member)?.role() == Some(SecondaryRole::Primary) {
                primary_found = true;
            }
            others += 1;
        }

        match s.role() {
            Some(SecondaryRole::Secondary) if others > 0 => {
                return Err(Error::SlotSecondaryPidInUse)
            }
            None if secondary_found => return Err(Error::SlotSecondaryPidInUse),
            Some(SecondaryRole::Primary) if primary_found => {
                return Err(Error::SlotSecondaryPidInUse)
            }
            _ => {}
        }
        if others + 1 > MAX_CHAINED_SLOTS {
            return Err(Error::TooManySlotsWithSamePid);
        }
        Ok(path_id)
    }

    /// Sets the PID of a slot and of every slot associated with it.
    pub(crate) fn slot_set_pid(&mut self, handle: Handle, pid: u16, suppress_reset: bool) -> Result<()> {
        let tp = self.tp()?;
        if self.slots.get(handle)?.config.data_entry_insertion {
            return Err(Error::InvalidSlotHandle);
        }
        let group = self.links.associated_of_kind(handle, ObjectKind::Slot);

        let path_id = if pid != PID_INVALID {
            self.check_pid_change(handle, &group, pid)?
        } else {
            None
        };

        for slot in std::iter::once(handle).chain(group) {
            self.set_pid_worker(&tp, slot, pid, suppress_reset)?;
            if let Some(id) = path_id {
                self.set_security_path_id(&tp, slot, id)?;
            }
        }
        debug!("Slot {:?} on PID {:#x}", handle, pid);
        Ok(())
    }

    fn set_security_path_id(&mut self, tp: &Tp, handle: Handle, id: u32) -> Result<()> {
        let s = self.slots.get_mut(handle)?;
        s.security_path_id = id;
        tp.slot_info(s.slot_index)?.key_index().write(id as u16)?;
        Ok(())
    }

    /// Gives every slot that would collect the same packets as `handle` a security path.
    pub(crate) fn slot_set_secure_path_id(&mut self, handle: Handle, id: u32) -> Result<()> {
        let tp = self.tp()?;
        let (vdevice, pid) = {
            let s = self.slots.get(handle)?;
            (s.vdevice, s.pid)
        };
        let targets = if pid == PID_INVALID {
            let mut targets = vec![handle];
            targets.extend(self.links.associated_of_kind(handle, ObjectKind::Slot));
            targets
        } else {
            self.slots_for_pid(vdevice, pid)?
        };
        for slot in targets {
            self.set_security_path_id(&tp, slot, id)?;
        }
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Programs one filter of a slot into the slot record, switching it on or off.
    pub(crate) fn update_filter_state(
        &mut self,
        slot: Handle,
        filter: Handle,
        disable: bool,
        enable: bool,
    ) -> Result<()> {
        let tp = self.tp()?;
        {
            let f = self.filters.get_mut(filter)?;
            if enable {
                f.enabled = true;
            } else if disable {
                f.enabled = false;
            }
        }

        let mode = self.slots.get(slot)?.mode();
        if mode == SlotMode::Ecm {
            self.reset_state(&tp, &[slot], true)?;
        }
        let result = self.program_filter(&tp, slot, filter);
        if mode == SlotMode::Ecm {
            self.activate(&tp, slot)?;
        }
        result
    }

    fn program_filter(&mut self, tp: &Tp, slot: Handle, filter: Handle) -> Result<()> {
        let (slot_index, mode) = {
            let s = self.slots.get(slot)?;
            (s.slot_index, s.mode())
        };
        let info = tp.slot_info(slot_index)?;
        let (filter_type, enabled, filter_index) = {
            let f = self.filters.get(filter)?;
            (f.filter_type, f.enabled, f.filter_index)
        };

        if mode == SlotMode::Pes {
            let mask = if enabled { self.filters.get(filter)?.pes_mask } else { 0 };
            info.pes_streamid_filterdata().write(mask)?;
            return Ok(());
        }
        if !mode.is_section() {
            self.filters.get_mut(filter)?.enabled = false;
            return Err(Error::FeatureNotSupported);
        }

        let params = filter_type.section_params();
        let cam = params & (section_params::LONG | section_params::PNMM) != 0;
        if cam && info.section_params().read()? != section_params::NONE {
            info.section_params().modify(0, params)?;
        } else {
            info.section_params().write(params)?;
        }

        match filter_type {
            FilterType::Tiny => {
                let f = self.filters.get(filter)?;
                if enabled {
                    info.section_tiny_data().write(f.tiny_data)?;
                    info.section_tiny_mask().write(f.tiny_mask)?;
                    info.section_tiny_anymatch().write(f.tiny_anymatch)?;
                } else {
                    info.section_tiny_data().write(0xFFFF)?;
                    info.section_tiny_mask().write(0xFFFF)?;
                    info.section_tiny_anymatch().write(0)?;
                }
            }
            FilterType::Proprietary => {
                if enabled {
                    tp.proprietary_filter(u32::from(slot_index))?
                        .data()
                        .write_all(&self.filters.get(filter)?.proprietary)?;
                    info.section_proprietary_index().write(u32::from(slot_index))?;
                } else {
                    info.section_proprietary_index().write(0xFFFF_FFFF)?;
                }
            }
            _ => match filter_index {
                Some(i) if i < 64 => {
                    info.section_filters_associated().set_bits(1 << i, enabled)?;
                }
                _ => {
                    self.filters.get_mut(filter)?.enabled = false;
                    return Err(Error::InvalidFilterHandle);
                }
            },
        }

        self.sync_discard_on_crc(tp, slot)
    }

    /// Sections failing their CRC are dropped only if every filter on the slot asks for it.
    pub(crate) fn sync_discard_on_crc(&self, tp: &Tp, slot: Handle) -> Result<()> {
        let s = self.slots.get(slot)?;
        if !s.mode().is_section() {
            return Err(Error::BadParameter);
        }
        let mut discard = true;
        for filter in self.links.associated_of_kind(slot, ObjectKind::Filter) {
            discard &= self.filters.get(filter)?.discard_on_crc;
        }
        tp.slot_info(s.slot_index)?
            .section_filter_flags()
            .set_bits(filter_flags::DISCARD_ON_CRC_ERROR, discard)?;
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    fn slot_state(&self, handle: Handle) -> Result<SlotState> {
        let tp = self.tp()?;
        let info = tp.slot_info(self.slots.get(handle)?.slot_index)?;
        Ok(SlotState {
            packet_count: info.packet_count().read()?,
            scrambling: decode_scrambling(info.slot_state().read()?),
        })
    }

    fn mode_and_index(&self, handle: Handle) -> Result<(SlotMode, u16)> {
        let s = self.slots.get(handle)?;
        Ok((s.mode(), s.slot_index))
    }

    fn raw_slot_index(&self, handle: Handle) -> Result<u16> {
        match self.mode_and_index(handle)? {
            (SlotMode::Raw, index) | (SlotMode::PartialPes, index) => Ok(index),
            _ => Err(Error::BadParameter),
        }
    }

    fn slot_remap_scrambling_bits(&self, handle: Handle, from: u8, to: u8) -> Result<()> {
        if from > 3 || to > 3 {
            return Err(Error::BadParameter);
        }
        let tp = self.tp()?;
        let index = self.raw_slot_index(handle)?;
        let shift = 2 * from;
        tp.slot_info(index)?
            .raw_sc_remap()
            .modify(3 << shift, to << shift)?;
        Ok(())
    }

    fn slot_set_corruption(&self, handle: Handle, enable: bool, offset: u8, value: u8) -> Result<()> {
        let tp = self.tp()?;
        let info = tp.slot_info(self.raw_slot_index(handle)?)?;
        if enable {
            info.raw_corruption_value().write(value)?;
            info.raw_corruption_offset().write(offset)?;
        } else {
            info.raw_corruption_offset().write(0)?;
            info.raw_corruption_value().write(0)?;
        }
        Ok(())
    }

    fn slot_feature_enable(&self, handle: Handle, feature: SlotFeature, enable: bool) -> Result<()> {
        let tp = self.tp()?;
        let (mode, index) = self.mode_and_index(handle)?;
        let raw = matches!(mode, SlotMode::Raw | SlotMode::PartialPes);
        let flag = match feature {
            SlotFeature::SuppressCc => slot_flags::SUPPRESS_CC,
            SlotFeature::DnlaPrefix if raw => slot_flags::PREFIX_DNLA,
            SlotFeature::CcFixup if raw => slot_flags::CC_FIXUP,
            SlotFeature::OutputBufferCount if mode == SlotMode::Ecm => slot_flags::COUNT_METADATA,
            _ => return Err(Error::InvalidSlotType),
        };
        tp.slot_info(index)?.slot_flags().set_bits(flag, enable)?;
        Ok(())
    }

    fn slot_set_output_node(&self, handle: Handle, node: SecureOutputNode) -> Result<()> {
        let tp = self.tp()?;
        let (mode, index) = self.mode_and_index(handle)?;
        let flags = tp.slot_info(index)?.slot_flags();
        match node {
            SecureOutputNode::Clear => flags.set_bits(slot_flags::OUTPUT_SCR, false)?,
            SecureOutputNode::Scrambled if mode == SlotMode::Raw => {
                flags.set_bits(slot_flags::OUTPUT_SCR, true)?
            }
            SecureOutputNode::Scrambled => return Err(Error::InvalidSlotType),
        }
        Ok(())
    }

    fn slot_set_remap_pid(&self, handle: Handle, pid: u16) -> Result<()> {
        let tp = self.tp()?;
        let index = match self.mode_and_index(handle)? {
            (SlotMode::Raw, index) => index,
            _ => return Err(Error::InvalidSlotType),
        };
        tp.slot_info(index)?.raw_remap_pid().write(pid)?;
        Ok(())
    }

    fn slot_enable_event(&self, handle: Handle, event: SlotEvent, enable: bool) -> Result<()> {
        let tp = self.tp()?;
        tp.slot_info(self.slots.get(handle)?.slot_index)?
            .event_mask()
            .set_bits(event.status_flag(), enable)?;
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    fn slot_set_secondary_pid(
        &mut self,
        secondary: Handle,
        primary: Handle,
        mode: SecondaryPidMode,
    ) -> Result<()> {
        let tp = self.tp()?;
        let (sec_index, pri_index, primary_pid) = {
            let sec = self.slots.get(secondary)?;
            let pri = self.slots.get(primary)?;
            if sec.secondary.is_some() || pri.secondary.is_some() {
                return Err(Error::SlotAlreadyLinked);
            }
            if sec.pid != PID_INVALID || pri.pid != PID_INVALID {
                return Err(Error::SlotNotAssociated);
            }
            (sec.slot_index, pri.slot_index, pri.pid)
        };
        if self.links.count_associated(secondary, ObjectKind::DataEntry) > 0
            || self.links.count_associated(primary, ObjectKind::DataEntry) > 0
        {
            return Err(Error::SlotNotAssociated);
        }

        tp.slot_info(pri_index)?
            .secondary_pid_info()
            .write(secondary_pid::PRIMARY_SLOT | mode.bits())?;
        tp.slot_info(sec_index)?
            .secondary_pid_info()
            .write(secondary_pid::SECONDARY_SLOT | primary_pid)?;

        self.slots.get_mut(primary)?.secondary = Some(SecondaryLink {
            partner: secondary,
            role: SecondaryRole::Primary,
            mode,
        });
        self.slots.get_mut(secondary)?.secondary = Some(SecondaryLink {
            partner: primary,
            role: SecondaryRole::Secondary,
            mode,
        });
        debug!("Slot {} is secondary to slot {} ({:?})", sec_index, pri_index, mode);
        Ok(())
    }

    fn slot_clear_secondary_pid(&mut self, secondary: Handle, primary: Handle) -> Result<()> {
        let tp = self.tp()?;
        let linked = |s: &Slot, partner: Handle, role: SecondaryRole| {
            s.secondary.map_or(false, |l| l.partner == partner && l.role == role)
        };
        let sec = self.slots.get(secondary)?;
        let pri = self.slots.get(primary)?;
        if !linked(sec, primary, SecondaryRole::Secondary)
            || !linked(pri, secondary, SecondaryRole::Primary)
        {
            return Err(Error::SlotNotAssociated);
        }
        let (sec_index, pri_index) = (sec.slot_index, pri.slot_index);

        self.slots.get_mut(secondary)?.secondary = None;
        self.slots.get_mut(primary)?.secondary = None;
        tp.slot_info(sec_index)?.secondary_pid_info().write(0)?;
        tp.slot_info(pri_index)?.secondary_pid_info().write(0)?;
        self.reset_state(&tp, &[primary], false)
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Hal {
    fn slot_op<R>(&self, slot: Handle, f: impl FnOnce(&mut PDeviceState) -> Result<R>) -> Result<R> {
        slot.expect_kind(ObjectKind::Slot)?;
        self.with_write(slot, |s| {
            s.slots.get(slot)?;
            f(s)
        })
    }

    fn slot_read<R>(&self, slot: Handle, f: impl FnOnce(&PDeviceState) -> Result<R>) -> Result<R> {
        slot.expect_kind(ObjectKind::Slot)?;
        self.with_read(slot, |s| {
            s.slots.get(slot)?;
            f(s)
        })
    }

    /// Starts collecting `pid` on the slot and on every slot associated with it.
    ///
    /// [`PID_INVALID`] stops collection and resets the slots; [`PID_WILDCARD`] collects every
    /// packet the vDevice receives.
    pub fn slot_set_pid(&self, slot: Handle, pid: u16) -> Result<()> {
        self.slot_op(slot, |s| s.slot_set_pid(slot, pid, false))
    }

    /// Like [`Hal::slot_set_pid`], but a slot taken off its PID keeps its state.
    pub fn slot_set_pid_keep_state(&self, slot: Handle, pid: u16) -> Result<()> {
        self.slot_op(slot, |s| s.slot_set_pid(slot, pid, true))
    }

    pub fn slot_get_pid(&self, slot: Handle) -> Result<u16> {
        self.slot_read(slot, |s| Ok(s.slots.get(slot)?.pid))
    }

    pub fn slot_get_mode(&self, slot: Handle) -> Result<SlotMode> {
        self.slot_read(slot, |s| Ok(s.slots.get(slot)?.mode()))
    }

    pub fn slot_get_state(&self, slot: Handle) -> Result<SlotState> {
        self.slot_read(slot, |s| s.slot_state(slot))
    }

    pub fn slot_enable_event(&self, slot: Handle, event: SlotEvent, enable: bool) -> Result<()> {
        self.slot_op(slot, |s| s.slot_enable_event(slot, event, enable))
    }

    /// Makes a RAW slot output scrambling-control value `to` for packets that arrive with `from`.
    pub fn slot_remap_scrambling_bits(&self, slot: Handle, from: u8, to: u8) -> Result<()> {
        self.slot_op(slot, |s| s.slot_remap_scrambling_bits(slot, from, to))
    }

    /// Overwrites byte `offset` of every packet a RAW slot outputs with `value`.
    pub fn slot_set_corruption(&self, slot: Handle, enable: bool, offset: u8, value: u8) -> Result<()> {
        self.slot_op(slot, |s| s.slot_set_corruption(slot, enable, offset, value))
    }

    pub fn slot_feature_enable(&self, slot: Handle, feature: SlotFeature, enable: bool) -> Result<()> {
        self.slot_op(slot, |s| s.slot_feature_enable(slot, feature, enable))
    }

    pub fn slot_set_secure_path_output_node(&self, slot: Handle, node: SecureOutputNode) -> Result<()> {
        self.slot_op(slot, |s| s.slot_set_output_node(slot, node))
    }

    /// Sets the security path of the slot and of every slot collecting the same packets.
    pub fn slot_set_secure_path_id(&self, slot: Handle, id: u32) -> Result<()> {
        self.slot_op(slot, |s| s.slot_set_secure_path_id(slot, id))
    }

    pub fn slot_get_secure_path_id(&self, slot: Handle) -> Result<u32> {
        self.slot_read(slot, |s| Ok(s.slots.get(slot)?.security_path_id))
    }

    /// Merges the packets of `secondary` into the stream of `primary`.
    ///
    /// Both slots must be linked before either is given a PID.
    pub fn slot_set_secondary_pid(
        &self,
        secondary: Handle,
        primary: Handle,
        mode: SecondaryPidMode,
    ) -> Result<()> {
        primary.expect_kind(ObjectKind::Slot)?;
        self.slot_op(secondary, |s| s.slot_set_secondary_pid(secondary, primary, mode))
    }

    pub fn slot_get_secondary_pid(&self, slot: Handle) -> Result<Option<SecondaryPidMode>> {
        self.slot_read(slot, |s| Ok(s.slots.get(slot)?.secondary.map(|l| l.mode)))
    }

    pub fn slot_clear_secondary_pid(&self, secondary: Handle, primary: Handle) -> Result<()> {
        primary.expect_kind(ObjectKind::Slot)?;
        self.slot_op(secondary, |s| s.slot_clear_secondary_pid(secondary, primary))
    }

    /// Rewrites the PID of packets a RAW slot outputs; [`PID_INVALID`] leaves them alone.
    pub fn slot_set_remap_pid(&self, slot: Handle, pid: u16) -> Result<()> {
        self.slot_op(slot, |s| s.slot_set_remap_pid(slot, pid))
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::testing::*;
    use crate::hal::AllocParams;

    fn tp(rig: &Rig) -> Tp {
        rig.hal.with_read(rig.pdevice, |s| s.tp()).unwrap()
    }

    fn next_slot(rig: &Rig, slot: Handle) -> u16 {
        tp(rig)
            .slot_info(rig.slot_index(slot))
            .unwrap()
            .next_slot()
            .read()
            .unwrap()
    }

    /// PID table and mapping table entries of a vDevice, as the firmware sees them.
    fn firmware_chains(rig: &Rig) -> Vec<(u16, u16)> {
        let tp = tp(rig);
        let info = tp.vdevice_info(u32::from(rig.vdevice.index())).unwrap();
        let base = info.pid_filter_base().read().unwrap() as usize;
        let size = info.pid_filter_size().read().unwrap() as usize;
        (base..base + size)
            .map(|i| {
                (
                    tp.pid_table().at(i).unwrap().read().unwrap(),
                    tp.pid_slot_mapping_table().at(i).unwrap().read().unwrap(),
                )
            })
            .filter(|(pid, _)| *pid != PID_INVALID)
            .collect()
    }

    #[test]
    fn test_allocation_initialises_record() {
        let rig = rig();
        let section = rig.slot(SlotMode::Section);
        let raw = rig.slot(SlotMode::PartialPes);
        let tp = tp(&rig);

        let info = tp.slot_info(rig.slot_index(section)).unwrap();
        assert_eq!(info.slot_mode().read().unwrap(), slot_mode::SECTION);
        assert_eq!(info.section_params().read().unwrap(), section_params::NONE);
        assert_eq!(info.dma_record().read().unwrap(), NO_INDEX);
        assert_eq!(info.next_slot().read().unwrap(), NO_INDEX);
        assert_eq!(info.slot_state().read().unwrap(), slot_state::TS_SC_NOT_SYNCED);

        let info = tp.slot_info(rig.slot_index(raw)).unwrap();
        assert_eq!(info.slot_mode().read().unwrap(), slot_mode::RAW);
        assert_eq!(info.raw_sc_remap().read().unwrap(), SC_REMAP_IDENTITY);
        assert_eq!(info.raw_remap_pid().read().unwrap(), PID_INVALID);
        assert_eq!(rig.hal.slot_get_pid(raw).unwrap(), PID_INVALID);
    }

    #[test]
    fn test_replacement_with_insertion_rejected() {
        let rig = rig();
        let result = rig.hal.allocate(
            rig.session,
            AllocParams::Slot(SlotConfig {
                mode: SlotMode::Raw,
                data_entry_replacement: true,
                data_entry_insertion: true,
                ..SlotConfig::default()
            }),
        );
        assert!(matches!(result, Err(Error::BadParameter)));
    }

    #[test]
    fn test_software_fifo_flags() {
        let rig = rig();
        let slot = rig
            .hal
            .allocate(
                rig.session,
                AllocParams::Slot(SlotConfig {
                    mode: SlotMode::Pes,
                    software_cd_fifo: true,
                    ..SlotConfig::default()
                }),
            )
            .unwrap();
        let flags = tp(&rig)
            .slot_info(rig.slot_index(slot))
            .unwrap()
            .slot_flags()
            .read()
            .unwrap();
        let expected = slot_flags::SUPPRESS_METADATA | slot_flags::NO_WINDBACK | slot_flags::SW_CD_FIFO;
        assert_eq!(flags & expected, expected);
    }

    #[test]
    fn test_chain_integrity() {
        let rig = rig();
        let slots = (0..3).map(|_| rig.slot(SlotMode::Raw)).collect::<Vec<_>>();
        for &slot in &slots {
            rig.hal.slot_set_pid(slot, 0x100).unwrap();
        }

        assert_eq!(
            rig.hal.vdevice_lookup_slots_for_pid(rig.vdevice, 0x100).unwrap(),
            slots
        );
        assert_eq!(firmware_chains(&rig), vec![(0x100, rig.slot_index(slots[0]))]);
        assert_eq!(next_slot(&rig, slots[0]), rig.slot_index(slots[1]));
        assert_eq!(next_slot(&rig, slots[1]), rig.slot_index(slots[2]));
        assert_eq!(next_slot(&rig, slots[2]), NO_INDEX);

        // Out of the middle.
        rig.hal.slot_set_pid(slots[1], PID_INVALID).unwrap();
        assert_eq!(next_slot(&rig, slots[0]), rig.slot_index(slots[2]));
        assert_eq!(next_slot(&rig, slots[1]), NO_INDEX);

        // The head: its follower takes its place in the table.
        rig.hal.slot_set_pid(slots[0], PID_INVALID).unwrap();
        assert_eq!(firmware_chains(&rig), vec![(0x100, rig.slot_index(slots[2]))]);
        assert_eq!(
            rig.hal.vdevice_lookup_slots_for_pid(rig.vdevice, 0x100).unwrap(),
            vec![slots[2]]
        );

        rig.hal.slot_set_pid(slots[2], PID_INVALID).unwrap();
        assert!(firmware_chains(&rig).is_empty());
        assert!(rig.hal.vdevice_lookup_pids(rig.vdevice).unwrap().is_empty());
    }

    #[test]
    fn test_moving_between_pids() {
        let rig = rig();
        let a = rig.slot(SlotMode::Section);
        let b = rig.slot(SlotMode::Section);
        rig.hal.slot_set_pid(a, 0x20).unwrap();
        rig.hal.slot_set_pid(b, 0x20).unwrap();
        rig.hal.slot_set_pid(a, 0x21).unwrap();

        assert_eq!(rig.hal.slot_get_pid(a).unwrap(), 0x21);
        assert_eq!(
            rig.hal.vdevice_lookup_slots_for_pid(rig.vdevice, 0x20).unwrap(),
            vec![b]
        );
        let mut chains = firmware_chains(&rig);
        chains.sort_unstable();
        assert_eq!(
            chains,
            vec![(0x20, rig.slot_index(b)), (0x21, rig.slot_index(a))]
        );
    }

    #[test]
    fn test_too_many_slots_on_one_pid() {
        let rig = rig();
        let slots = (0..MAX_CHAINED_SLOTS + 1)
            .map(|_| rig.slot(SlotMode::Raw))
            .collect::<Vec<_>>();
        for &slot in &slots[..MAX_CHAINED_SLOTS] {
            rig.hal.slot_set_pid(slot, 0x100).unwrap();
        }
        let before = tp(&rig).pid_table().read_all().unwrap();

        let last = slots[MAX_CHAINED_SLOTS];
        assert!(matches!(
            rig.hal.slot_set_pid(last, 0x100),
            Err(Error::TooManySlotsWithSamePid)
        ));
        assert_eq!(rig.hal.slot_get_pid(last).unwrap(), PID_INVALID);
        assert_eq!(tp(&rig).pid_table().read_all().unwrap(), before);
        assert_eq!(
            rig.hal
                .vdevice_lookup_slots_for_pid(rig.vdevice, 0x100)
                .unwrap()
                .len(),
            MAX_CHAINED_SLOTS
        );
    }

    #[test]
    fn test_pid_range() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        assert!(matches!(
            rig.hal.slot_set_pid(slot, PID_WILDCARD + 1),
            Err(Error::BadParameter)
        ));
    }

    #[test]
    fn test_wildcard_slot_index() {
        let rig = rig();
        let a = rig.slot(SlotMode::Raw);
        let b = rig.slot(SlotMode::Raw);
        let wildcard = || {
            tp(&rig)
                .vdevice_info(u32::from(rig.vdevice.index()))
                .unwrap()
                .wildcard_slot_index()
                .read()
                .unwrap()
        };

        rig.hal.slot_set_pid(a, PID_WILDCARD).unwrap();
        rig.hal.slot_set_pid(b, PID_WILDCARD).unwrap();
        assert_eq!(wildcard(), rig.slot_index(a));

        rig.hal.slot_set_pid(a, PID_INVALID).unwrap();
        assert_eq!(wildcard(), rig.slot_index(b));
        rig.hal.deallocate(b, false).unwrap();
        assert_eq!(wildcard(), NO_INDEX);
    }

    #[test]
    fn test_associated_slots_share_pid() {
        let rig = rig();
        let a = rig.slot(SlotMode::Section);
        let b = rig.slot(SlotMode::Pes);
        rig.hal.associate(a, b).unwrap();

        rig.hal.slot_set_pid(a, 0x44).unwrap();
        assert_eq!(rig.hal.slot_get_pid(b).unwrap(), 0x44);
        assert_eq!(
            rig.hal.vdevice_lookup_slots_for_pid(rig.vdevice, 0x44).unwrap(),
            vec![a, b]
        );

        let c = rig.slot(SlotMode::Raw);
        assert!(matches!(
            rig.hal.associate(a, c),
            Err(Error::NotAllowedWhilstPidSet)
        ));
    }

    #[test]
    fn test_association_requires_same_security_path() {
        let rig = rig();
        let a = rig.slot(SlotMode::Raw);
        let b = rig.slot(SlotMode::Raw);
        rig.hal.slot_set_secure_path_id(a, 7).unwrap();
        assert!(matches!(
            rig.hal.associate(a, b),
            Err(Error::DifferingSecurityPathIds)
        ));
        assert!(rig.hal.associated(a).unwrap().is_empty());
    }

    #[test]
    fn test_joining_a_chain_adopts_its_security_path() {
        let rig = rig();
        let a = rig.slot(SlotMode::Raw);
        let b = rig.slot(SlotMode::Raw);
        rig.hal.slot_set_pid(a, 0x30).unwrap();
        rig.hal.slot_set_secure_path_id(a, 5).unwrap();

        rig.hal.slot_set_pid(b, 0x30).unwrap();
        assert_eq!(rig.hal.slot_get_secure_path_id(b).unwrap(), 5);
        let key = tp(&rig)
            .slot_info(rig.slot_index(b))
            .unwrap()
            .key_index()
            .read()
            .unwrap();
        assert_eq!(key, 5);
    }

    #[test]
    fn test_secure_path_id_before_and_after_pid() {
        // Set before the PID: follows the association. Set after: follows the chain.
        let before = rig();
        let a = before.slot(SlotMode::Raw);
        let b = before.slot(SlotMode::Raw);
        before.hal.associate(a, b).unwrap();
        before.hal.slot_set_secure_path_id(a, 9).unwrap();
        before.hal.slot_set_pid(a, 0x50).unwrap();

        let after = rig();
        let c = after.slot(SlotMode::Raw);
        let d = after.slot(SlotMode::Raw);
        after.hal.associate(c, d).unwrap();
        after.hal.slot_set_pid(c, 0x50).unwrap();
        after.hal.slot_set_secure_path_id(c, 9).unwrap();

        for (rig, slots) in [(&before, [a, b]), (&after, [c, d])] {
            for slot in slots {
                assert_eq!(rig.hal.slot_get_secure_path_id(slot).unwrap(), 9);
            }
        }
    }

    #[test]
    fn test_buffer_is_exclusive() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let first = rig.buffer(4096);
        let second = rig.buffer(4096);

        rig.hal.associate(slot, first).unwrap();
        let dma = tp(&rig)
            .slot_info(rig.slot_index(slot))
            .unwrap()
            .dma_record()
            .read()
            .unwrap();
        assert_eq!(dma, rig.dma_index(first));

        assert!(matches!(
            rig.hal.associate(slot, second),
            Err(Error::SlotAlreadyLinked)
        ));
        assert_eq!(rig.hal.associated(slot).unwrap(), vec![first]);

        rig.hal.disassociate(slot, Some(first)).unwrap();
        let dma = tp(&rig)
            .slot_info(rig.slot_index(slot))
            .unwrap()
            .dma_record()
            .read()
            .unwrap();
        assert_eq!(dma, NO_INDEX);
    }

    #[test]
    fn test_pes_slot_takes_only_stream_id_filters() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Pes);
        let long = rig.filter(FilterType::Long);
        assert!(matches!(
            rig.hal.associate(slot, long),
            Err(Error::InvalidSlotType)
        ));

        let first = rig.filter(FilterType::PesStreamId);
        let second = rig.filter(FilterType::PesStreamId);
        rig.hal.associate(slot, first).unwrap();
        assert!(matches!(
            rig.hal.associate(slot, second),
            Err(Error::InvalidFilterOperatingMode)
        ));
    }

    #[test]
    fn test_section_filter_mixing() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Section);
        let long = rig.filter(FilterType::Long);
        let pnmm = rig.filter(FilterType::Pnmm);
        let short = rig.filter(FilterType::Short);
        let tiny = rig.filter(FilterType::Tiny);

        rig.hal.associate(slot, long).unwrap();
        rig.hal.associate(slot, pnmm).unwrap();
        assert!(matches!(
            rig.hal.associate(slot, short),
            Err(Error::InvalidFilterType)
        ));
        assert!(matches!(
            rig.hal.associate(slot, tiny),
            Err(Error::InvalidFilterOperatingMode)
        ));

        let params = tp(&rig)
            .slot_info(rig.slot_index(slot))
            .unwrap()
            .section_params()
            .read()
            .unwrap();
        assert_eq!(params, section_params::LONG | section_params::PNMM);

        rig.hal.disassociate(slot, Some(long)).unwrap();
        rig.hal.disassociate(slot, Some(pnmm)).unwrap();
        let params = tp(&rig)
            .slot_info(rig.slot_index(slot))
            .unwrap()
            .section_params()
            .read()
            .unwrap();
        assert_eq!(params, section_params::NONE);
    }

    #[test]
    fn test_only_one_tiny_filter() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Ecm);
        let a = rig.filter(FilterType::Tiny);
        let b = rig.filter(FilterType::Tiny);
        rig.hal.associate(slot, a).unwrap();
        assert!(matches!(
            rig.hal.associate(slot, b),
            Err(Error::InvalidFilterOperatingMode)
        ));
        // The ECM slot is switched back on after being reprogrammed.
        let mode = tp(&rig)
            .slot_info(rig.slot_index(slot))
            .unwrap()
            .slot_mode()
            .read()
            .unwrap();
        assert_eq!(mode, slot_mode::ECM);
    }

    #[test]
    fn test_raw_slot_takes_no_filters() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let filter = rig.filter(FilterType::Long);
        assert!(matches!(
            rig.hal.associate(slot, filter),
            Err(Error::InvalidSlotType)
        ));
    }

    #[test]
    fn test_secondary_pid_rules() {
        let rig = rig();
        let primary = rig.slot(SlotMode::Raw);
        let secondary = rig.slot(SlotMode::Raw);

        rig.hal
            .slot_set_secondary_pid(secondary, primary, SecondaryPidMode::Insertion)
            .unwrap();
        assert_eq!(
            rig.hal.slot_get_secondary_pid(primary).unwrap(),
            Some(SecondaryPidMode::Insertion)
        );
        let third = rig.slot(SlotMode::Raw);
        assert!(matches!(
            rig.hal
                .slot_set_secondary_pid(third, primary, SecondaryPidMode::Substitution),
            Err(Error::SlotAlreadyLinked)
        ));

        rig.hal.slot_set_pid(primary, 0x200).unwrap();
        rig.hal.slot_set_pid(secondary, 0x201).unwrap();
        let info = tp(&rig)
            .slot_info(rig.slot_index(secondary))
            .unwrap()
            .secondary_pid_info()
            .read()
            .unwrap();
        assert_eq!(info, secondary_pid::SECONDARY_SLOT | 0x200);

        // Nothing may join the secondary's PID, nor may it join another chain.
        assert!(matches!(
            rig.hal.slot_set_pid(third, 0x201),
            Err(Error::SlotSecondaryPidInUse)
        ));
        rig.hal.slot_set_pid(third, 0x300).unwrap();
        assert!(matches!(
            rig.hal.slot_set_pid(secondary, 0x300),
            Err(Error::SlotSecondaryPidInUse)
        ));

        assert!(matches!(
            rig.hal.slot_clear_secondary_pid(primary, secondary),
            Err(Error::SlotNotAssociated)
        ));
        rig.hal.slot_clear_secondary_pid(secondary, primary).unwrap();
        assert_eq!(rig.hal.slot_get_secondary_pid(secondary).unwrap(), None);
    }

    #[test]
    fn test_secondary_link_needs_unset_pids() {
        let rig = rig();
        let primary = rig.slot(SlotMode::Raw);
        let secondary = rig.slot(SlotMode::Raw);
        rig.hal.slot_set_pid(primary, 0x10).unwrap();
        assert!(matches!(
            rig.hal
                .slot_set_secondary_pid(secondary, primary, SecondaryPidMode::Substitution),
            Err(Error::SlotNotAssociated)
        ));
    }

    #[test]
    fn test_scrambling_state() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Raw);
        let tp = tp(&rig);
        let info = tp.slot_info(rig.slot_index(slot)).unwrap();

        info.packet_count().write(12).unwrap();
        info.slot_state().write(3 << slot_state::TS_SC_OFFSET).unwrap();
        assert_eq!(
            rig.hal.slot_get_state(slot).unwrap(),
            SlotState {
                packet_count: 12,
                scrambling: ScrambleState::TransportOdd,
            }
        );
        info.slot_state().write(slot_state::PES_SC_MASK).unwrap();
        assert_eq!(
            rig.hal.slot_get_state(slot).unwrap().scrambling,
            ScrambleState::PesScrambled
        );
        info.slot_state().write(0).unwrap();
        assert_eq!(
            rig.hal.slot_get_state(slot).unwrap().scrambling,
            ScrambleState::Clear
        );
    }

    #[test]
    fn test_remap_scrambling_bits() {
        let rig = rig();
        let raw = rig.slot(SlotMode::Raw);
        rig.hal.slot_remap_scrambling_bits(raw, 2, 0).unwrap();
        rig.hal.slot_remap_scrambling_bits(raw, 3, 0).unwrap();
        let remap = tp(&rig)
            .slot_info(rig.slot_index(raw))
            .unwrap()
            .raw_sc_remap()
            .read()
            .unwrap();
        assert_eq!(remap, 0x04);

        let section = rig.slot(SlotMode::Section);
        assert!(matches!(
            rig.hal.slot_remap_scrambling_bits(section, 2, 0),
            Err(Error::BadParameter)
        ));
    }

    #[test]
    fn test_feature_enable_checks_mode() {
        let rig = rig();
        let raw = rig.slot(SlotMode::Raw);
        let ecm = rig.slot(SlotMode::Ecm);

        rig.hal
            .slot_feature_enable(raw, SlotFeature::CcFixup, true)
            .unwrap();
        rig.hal
            .slot_feature_enable(ecm, SlotFeature::OutputBufferCount, true)
            .unwrap();
        assert!(matches!(
            rig.hal.slot_feature_enable(ecm, SlotFeature::DnlaPrefix, true),
            Err(Error::InvalidSlotType)
        ));
        assert!(matches!(
            rig.hal
                .slot_set_secure_path_output_node(ecm, SecureOutputNode::Scrambled),
            Err(Error::InvalidSlotType)
        ));

        let flags = tp(&rig)
            .slot_info(rig.slot_index(raw))
            .unwrap()
            .slot_flags()
            .read()
            .unwrap();
        assert_eq!(flags & slot_flags::CC_FIXUP, slot_flags::CC_FIXUP);
    }

    #[test]
    fn test_slot_events_start_disabled() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Pcr);
        let mask = || {
            tp(&rig)
                .slot_info(rig.slot_index(slot))
                .unwrap()
                .event_mask()
                .read()
                .unwrap()
        };
        assert_eq!(mask() & status_flags::PCR_RECEIVED, 0);
        rig.hal
            .slot_enable_event(slot, SlotEvent::PcrReceived, true)
            .unwrap();
        assert_eq!(mask() & status_flags::PCR_RECEIVED, status_flags::PCR_RECEIVED);
    }

    #[test]
    fn test_deallocating_a_chained_slot() {
        let rig = rig();
        let a = rig.slot(SlotMode::Raw);
        let b = rig.slot(SlotMode::Raw);
        rig.hal.slot_set_pid(a, 0x60).unwrap();
        rig.hal.slot_set_pid(b, 0x60).unwrap();

        rig.hal.deallocate(a, false).unwrap();
        assert_eq!(firmware_chains(&rig), vec![(0x60, rig.slot_index(b))]);
        assert!(matches!(rig.hal.slot_get_pid(a), Err(Error::InvalidHandle)));
    }

    #[test]
    fn test_stalled_firmware_does_not_block_clearing() {
        let rig = rig();
        let slot = rig.slot(SlotMode::Section);
        rig.hal.slot_set_pid(slot, 0x70).unwrap();
        rig.tp.set_stalled(true);
        rig.hal.slot_set_pid(slot, PID_INVALID).unwrap();
        rig.tp.set_stalled(false);
        assert_eq!(rig.hal.slot_get_pid(slot).unwrap(), PID_INVALID);
    }
}

/* ---------------------------------------------------------------------------------------------- */
