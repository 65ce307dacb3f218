// SPDX-License-Identifier: MIT OR Apache-2.0

//! Section and PES filters.
//!
//! CAM filters (short, long and positive/negative match, with or without version-not-match) live
//! in the vDevice's partition of the filter CAM and are switched on per slot through the slot's
//! filter bitmask. Tiny, proprietary and PES stream-ID filters have no CAM entry; they are written
//! straight into the record of the one slot they are attached to, and so are "slot based".
//!
//! A CAM entry is two 64-bit (data, mask) pairs. Long filters match 16 bytes of section header
//! positively across both banks. Positive/negative match filters use the same 8 data bytes in
//! both banks, with bank A holding the bits that must match and bank B the bits of which at least
//! one must differ.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::VecDeque;

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::hal::{Hal, PDeviceState};
use crate::interface::{section_params, CamBank, Tp, MAX_FILTERS_PER_VDEVICE};
use crate::objman::{Handle, ObjectKind};

/* ---------------------------------------------------------------------------------------------- */

/// Size of a proprietary filter blob.
pub const PROPRIETARY_FILTER_SIZE: usize = 80;

/// Number of flushes a buffer can have outstanding at once.
pub(crate) const FLUSH_RECORDS: usize = 8;

/// Bits of a CAM word taken up by the version number (byte 3, bits 1 to 5).
const VERSION_BITS: u64 = 0x1F << 25;

const CAM_BANKS: [CamBank; 4] = [CamBank::DataA, CamBank::MaskA, CamBank::DataB, CamBank::MaskB];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterType {
    No,
    /// A 16-bit match on the table ID and the byte after the section length, slot based.
    Tiny,
    /// 8 bytes of positive match.
    Short,
    /// 16 bytes of positive match.
    Long,
    /// 8 bytes, with separate positive and negative match bits.
    Pnmm,
    /// Opaque CA vendor filter, slot based.
    Proprietary,
    ShortVnmm,
    LongVnmm,
    PnmmVnmm,
    /// Matches the stream ID of PES packets, slot based.
    PesStreamId,
}

/// Groups of CAM filter types that may share a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CamClass {
    Short,
    LongOrPnmm,
}

impl FilterType {
    /// The slot's `section_params` for this type.
    pub(crate) fn section_params(self) -> u8 {
        match self {
            FilterType::Tiny => section_params::TINY,
            FilterType::Short | FilterType::ShortVnmm | FilterType::Long | FilterType::LongVnmm => {
                section_params::LONG
            }
            FilterType::Pnmm | FilterType::PnmmVnmm => section_params::PNMM,
            FilterType::Proprietary => section_params::PROPRIETARY,
            FilterType::PesStreamId | FilterType::No => section_params::NONE,
        }
    }

    pub(crate) fn cam_class(self) -> Option<CamClass> {
        match self {
            FilterType::Short | FilterType::ShortVnmm => Some(CamClass::Short),
            FilterType::Long | FilterType::LongVnmm | FilterType::Pnmm | FilterType::PnmmVnmm => {
                Some(CamClass::LongOrPnmm)
            }
            _ => None,
        }
    }

    pub fn is_cam(self) -> bool {
        self.cam_class().is_some()
    }

    /// Whether the filter is written into its slot's record rather than into the CAM.
    pub fn is_slot_based(self) -> bool {
        matches!(
            self,
            FilterType::Tiny | FilterType::Proprietary | FilterType::PesStreamId
        )
    }

    fn is_vnmm(self) -> bool {
        matches!(
            self,
            FilterType::ShortVnmm | FilterType::LongVnmm | FilterType::PnmmVnmm
        )
    }
}

/// New match criteria for a filter.
///
/// Empty `data`, `mask` or `sense` leave the filter matching nothing. Otherwise bytes beyond the
/// end of `data` and `mask` are "don't care", and bytes beyond the end of `sense` are positive
/// matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterUpdate {
    pub filter_type: FilterType,
    pub one_shot: bool,
    pub force_crc_check: bool,
    pub data: Vec<u8>,
    pub mask: Vec<u8>,
    pub sense: Vec<u8>,
}

impl FilterUpdate {
    pub fn new(filter_type: FilterType) -> FilterUpdate {
        FilterUpdate {
            filter_type,
            one_shot: false,
            force_crc_check: false,
            data: Vec::new(),
            mask: Vec::new(),
            sense: Vec::new(),
        }
    }
}

/// What the filter metadata of a section read out of a buffer says.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionMetadata {
    /// The filters that matched the section, in filter order. `None` stands for a filter that has
    /// been deallocated since.
    pub filters: Vec<Option<Handle>>,
    pub crc_ok: bool,
}

impl SectionMetadata {
    pub fn filters_matched(&self) -> usize {
        self.filters.len()
    }
}

#[derive(Debug)]
pub struct Filter {
    pub(crate) vdevice: Handle,
    pub(crate) filter_type: FilterType,
    /// Position in the vDevice's section filter list (CAM filters) or PES filter list.
    pub(crate) filter_index: Option<usize>,

    pub(crate) enabled: bool,
    pub(crate) enable_on_association: bool,
    pub(crate) discard_on_crc: bool,
    pub(crate) one_shot: bool,
    pub(crate) force_crc: bool,

    pub(crate) tiny_data: u16,
    pub(crate) tiny_mask: u16,
    pub(crate) tiny_anymatch: u16,
    pub(crate) pes_mask: u8,
    pub(crate) proprietary: Vec<u8>,
}

impl Filter {
    fn new(vdevice: Handle, filter_type: FilterType, discard_on_crc: bool) -> Filter {
        Filter {
            vdevice,
            filter_type,
            filter_index: None,
            enabled: false,
            enable_on_association: false,
            discard_on_crc,
            one_shot: false,
            force_crc: false,
            tiny_data: 0xFFFF,
            tiny_mask: 0xFFFF,
            tiny_anymatch: 0,
            pes_mask: 0,
            proprietary: vec![0; PROPRIETARY_FILTER_SIZE],
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// The contents of one CAM entry and its not-match control.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CamEntry {
    pub data_a: u64,
    pub mask_a: u64,
    pub data_b: u64,
    pub mask_b: u64,
    pub not_match_control: u64,
    pub not_match_value: u8,
}

/// Pads `bytes` to 16, or fills all 16 with 0xFF when there are none.
fn pad(bytes: &[u8], fill: u8) -> [u8; 16] {
    let mut out = [0xFF; 16];
    if !bytes.is_empty() {
        for (i, b) in out.iter_mut().enumerate() {
            *b = bytes.get(i).copied().unwrap_or(fill);
        }
    }
    out
}

/// Little endian: byte 0 of the section goes into the lowest 8 bits.
fn word(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0, |acc, &b| (acc << 8) | u64::from(b))
}

/// Works out the CAM entry for a CAM filter type.
pub(crate) fn cam_entry(filter_type: FilterType, data: &[u8], mask: &[u8], sense: &[u8]) -> CamEntry {
    let data = pad(data, 0);
    let mask = pad(mask, 0);
    let sense = pad(sense, 0xFF);

    let mut entry = CamEntry::default();
    let mut version_bits = 0;
    if filter_type.is_vnmm() && (mask[3] >> 1) & 0x1F != 0 {
        entry.not_match_control = 1;
        entry.not_match_value = (data[3] >> 1) & 0x1F;
        version_bits = VERSION_BITS;
    }

    match filter_type {
        FilterType::Short | FilterType::ShortVnmm => {
            entry.data_a = word(&data[..8]);
            entry.mask_a = word(&mask[..8]) & !version_bits;
        }
        FilterType::Pnmm | FilterType::PnmmVnmm => {
            let positive: Vec<u8> = mask.iter().zip(&sense).map(|(m, s)| m & s).collect();
            let negative: Vec<u8> = mask.iter().zip(&sense).map(|(m, s)| m & !s).collect();
            entry.data_a = word(&data[..8]);
            entry.mask_a = word(&positive[..8]) & !version_bits;
            entry.data_b = entry.data_a;
            entry.mask_b = word(&negative[..8]) & !version_bits;
            // A negative match on no bits at all would never fail; make bank B never match instead.
            if entry.mask_b == 0 {
                entry.data_b = !0;
                entry.mask_b = !0;
            }
        }
        _ => {
            entry.data_a = word(&data[..8]);
            entry.mask_a = word(&mask[..8]) & !version_bits;
            entry.data_b = word(&data[8..]);
            entry.mask_b = word(&mask[8..]);
        }
    }
    entry
}

/* ---------------------------------------------------------------------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FlushRecord {
    /// Bytes covered, counted from the end of the previous record.
    region: u32,
    filters: u64,
    slot_based: bool,
}

/// Filters flushed from a buffer, for the part of it written before each flush.
///
/// The firmware keeps writing sections into the buffer while a flush is requested, so sections of
/// flushed filters are not removed; they are hidden from the reader until it has read past the
/// point the buffer had reached when the flush was requested.
#[derive(Clone, Debug, Default)]
pub(crate) struct FlushArray {
    records: VecDeque<FlushRecord>,
}

impl FlushArray {
    /// Hides `filters` from the next `region` bytes of the buffer.
    ///
    /// Earlier flushes cover part of those bytes already, so they absorb the filters of this one,
    /// and only the remainder needs a record of its own. A flush the existing records cover
    /// entirely is accepted even when all [`FLUSH_RECORDS`] are in use.
    pub(crate) fn add(&mut self, region: u32, filters: u64, slot_based: bool) -> Result<()> {
        let mut remaining = region;
        for record in self.records.iter_mut() {
            record.filters |= filters;
            record.slot_based |= slot_based;
            if remaining < record.region {
                error!(
                    "Flushing {} bytes but an earlier flush still covers {}",
                    remaining, record.region
                );
                remaining = 0;
            } else {
                remaining -= record.region;
            }
        }

        if remaining > 0 {
            if self.records.len() >= FLUSH_RECORDS {
                return Err(Error::FlushFiltersNotSupported);
            }
            self.records.push_back(FlushRecord {
                region: remaining,
                filters,
                slot_based,
            });
        }
        Ok(())
    }

    /// The flushed filter bits and slot-based flag for the unit at the read offset.
    fn current(&self) -> (u64, bool) {
        self.records
            .front()
            .map_or((0, false), |r| (r.filters, r.slot_based))
    }

    /// Accounts for `size` bytes having been read.
    pub(crate) fn consume(&mut self, size: u32) {
        if let Some(front) = self.records.front_mut() {
            if front.region <= size {
                self.records.pop_front();
            } else {
                front.region -= size;
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl PDeviceState {
    pub(crate) fn filter_allocate(&mut self, parent: Handle, filter_type: FilterType) -> Result<Handle> {
        if filter_type == FilterType::No {
            return Err(Error::BadParameter);
        }
        let vdevice = self
            .links
            .ancestor(parent, ObjectKind::VDevice)
            .ok_or(Error::BadParameter)?;
        let discard = self.vdevices.get(vdevice)?.config.force_discard_on_crc_error;

        let handle = self.filters.insert(Filter::new(vdevice, filter_type, discard))?;
        self.links.add_child(parent, handle);

        if let Err(e) = self.filter_init(handle, vdevice, filter_type) {
            self.discard(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn filter_init(&mut self, handle: Handle, vdevice: Handle, filter_type: FilterType) -> Result<()> {
        if filter_type == FilterType::PesStreamId {
            let index = self.vdevices.get_mut(vdevice)?.pes_filters.add(handle)?;
            self.filters.get_mut(handle)?.filter_index = Some(index);
            return Ok(());
        }
        if filter_type.is_slot_based() {
            return Ok(());
        }

        let index = self.vdevices.get_mut(vdevice)?.section_filters.add(handle)?;
        self.filters.get_mut(handle)?.filter_index = Some(index);
        let tp = self.tp()?;
        let result = self.cam_set(&tp, handle, &[], &[], &[]);
        if result.is_err() {
            self.vdevices.get_mut(vdevice)?.section_filters.remove(index);
        }
        result
    }

    pub(crate) fn filter_associator(&mut self, _handle: Handle, other: Handle) -> Result<()> {
        match other.kind() {
            ObjectKind::Slot => Ok(()),
            _ => Err(Error::BadParameter),
        }
    }

    pub(crate) fn filter_disassociator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        if other.kind() != ObjectKind::Slot {
            error!("Filter {:?} was associated with {:?}", handle, other);
        }
        Ok(())
    }

    pub(crate) fn filter_deallocate(&mut self, handle: Handle) -> Result<()> {
        let (vdevice, filter_type, filter_index) = {
            let f = self.filters.get(handle)?;
            (f.vdevice, f.filter_type, f.filter_index)
        };

        if let Some(index) = filter_index {
            if filter_type == FilterType::PesStreamId {
                self.vdevices.get_mut(vdevice)?.pes_filters.remove(index);
            } else {
                // Leave the CAM entry matching nothing for the next filter to take it.
                match self.tp() {
                    Ok(tp) => {
                        self.filters.get_mut(handle)?.filter_type = FilterType::Long;
                        self.cam_set(&tp, handle, &[], &[], &[])?;
                    }
                    Err(e) => warn!("Not clearing CAM entry of {:?}: {}", handle, e),
                }
                self.vdevices.get_mut(vdevice)?.section_filters.remove(index);
            }
        }

        self.filters.remove(handle)?;
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Clears a vDevice's CAM table and leaves all its CAM entries matching nothing.
    pub(crate) fn filter_cam_table_init(&self, tp: &Tp, vdevice: Handle) -> Result<()> {
        let vd = self.vdevices.get(vdevice)?;
        let table = tp.cam_table(u32::from(vdevice.index()))?;

        table.one_shot_mask().write(0)?;
        table.force_crc_mask().write(0)?;
        table.pnmm_not_lmm_mask().write(0)?;
        table.not_match_value().fill(0)?;
        table.not_match_control().fill(0)?;

        match vd.cam_partition {
            Some(partition) => {
                let start = self.cam_partitions.start_of(partition);
                let size = self.cam_partitions.size_of(partition);
                table.filter_cam_offset().write(start)?;
                for entry in start..start + size {
                    for &bank in CAM_BANKS.iter() {
                        tp.cam_word(bank, entry)?.write(!0)?;
                    }
                }
            }
            None => table.filter_cam_offset().write(0xFFFF_FFFF)?,
        }
        Ok(())
    }

    /// Writes the CAM entry and the CAM table bits of a CAM filter.
    fn cam_set(&self, tp: &Tp, filter: Handle, data: &[u8], mask: &[u8], sense: &[u8]) -> Result<()> {
        let f = self.filters.get(filter)?;
        let index = f.filter_index.ok_or(Error::InvalidFilterHandle)?;
        if index >= MAX_FILTERS_PER_VDEVICE as usize {
            return Err(Error::InvalidFilterHandle);
        }
        let partition = self
            .vdevices
            .get(f.vdevice)?
            .cam_partition
            .ok_or(Error::InvalidFilterHandle)?;
        let cam_index = self.cam_partitions.start_of(partition) + index as u32;
        let entry = cam_entry(f.filter_type, data, mask, sense);

        let table = tp.cam_table(u32::from(f.vdevice.index()))?;
        let shift = (index * 2) % 64;
        table
            .not_match_control()
            .at(index * 2 / 64)?
            .modify(3 << shift, entry.not_match_control << shift)?;
        table.not_match_value().at(index)?.write(entry.not_match_value)?;

        tp.cam_word(CamBank::DataA, cam_index)?.write(entry.data_a)?;
        tp.cam_word(CamBank::MaskA, cam_index)?.write(entry.mask_a)?;
        tp.cam_word(CamBank::DataB, cam_index)?.write(entry.data_b)?;
        tp.cam_word(CamBank::MaskB, cam_index)?.write(entry.mask_b)?;

        let bit = 1u64 << index;
        let pnmm = f.filter_type.section_params() == section_params::PNMM;
        table.pnmm_not_lmm_mask().set_bits(bit, pnmm)?;
        table.one_shot_mask().set_bits(bit, f.one_shot)?;
        table.force_crc_mask().set_bits(bit, f.force_crc)?;
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Reprograms the filter on every slot it is attached to, leaving it on or off as it was.
    fn refresh_filter(&mut self, filter: Handle) -> Result<()> {
        for slot in self.links.associated_of_kind(filter, ObjectKind::Slot) {
            self.update_filter_state(slot, filter, false, false)?;
        }
        self.filters.get_mut(filter)?.enable_on_association = true;
        Ok(())
    }

    fn filter_set_discard_on_crc(&mut self, filter: Handle, discard: bool) -> Result<()> {
        self.filters.get_mut(filter)?.discard_on_crc = discard;
        let tp = self.tp()?;
        for slot in self.links.associated_of_kind(filter, ObjectKind::Slot) {
            if self.slots.get(slot)?.mode().is_section() {
                self.sync_discard_on_crc(&tp, slot)?;
            }
        }
        Ok(())
    }

    fn filter_enable(&mut self, filter: Handle, enable: bool) -> Result<()> {
        for slot in self.links.associated_of_kind(filter, ObjectKind::Slot) {
            self.update_filter_state(slot, filter, !enable, enable)?;
        }
        self.filters.get_mut(filter)?.enable_on_association = enable;
        Ok(())
    }

    fn filter_update(&mut self, filter: Handle, update: &FilterUpdate) -> Result<()> {
        let current = self.filters.get(filter)?.filter_type;
        let new = update.filter_type;
        if current.is_slot_based() && new != current {
            return Err(Error::InvalidFilterType);
        }
        if current.is_cam() && !new.is_cam() {
            return Err(Error::InvalidFilterType);
        }

        match new {
            FilterType::PesStreamId => {
                let mask = *update.data.first().ok_or(Error::InvalidFilterData)?;
                self.filters.get_mut(filter)?.pes_mask = mask;
            }
            FilterType::Tiny => {
                let f = self.filters.get_mut(filter)?;
                f.one_shot = update.one_shot;
                if update.data.len() >= 2 && update.mask.len() >= 2 {
                    f.tiny_data = u16::from_be_bytes([update.data[0], update.data[1]]);
                    f.tiny_mask = u16::from_be_bytes([update.mask[0], update.mask[1]]);
                    f.tiny_anymatch = match update.sense.get(..2) {
                        Some(s) => u16::from_be_bytes([s[0], s[1]]),
                        None => 0,
                    };
                } else {
                    f.tiny_data = 0xFFFF;
                    f.tiny_mask = 0xFFFF;
                    f.tiny_anymatch = 0;
                }
            }
            FilterType::Proprietary | FilterType::No => return Err(Error::InvalidFilterType),
            _ => {
                {
                    let f = self.filters.get_mut(filter)?;
                    f.filter_type = new;
                    f.one_shot = update.one_shot;
                    f.force_crc = update.force_crc_check;
                }
                let tp = self.tp()?;
                self.cam_set(&tp, filter, &update.data, &update.mask, &update.sense)?;
            }
        }

        debug!("Filter {:?} updated as {:?}", filter, new);
        self.refresh_filter(filter)
    }

    fn filter_update_proprietary(&mut self, filter: Handle, data: &[u8]) -> Result<()> {
        let f = self.filters.get_mut(filter)?;
        if f.filter_type != FilterType::Proprietary {
            return Err(Error::InvalidFilterType);
        }
        if data.len() != PROPRIETARY_FILTER_SIZE {
            return Err(Error::BadParameter);
        }
        f.proprietary.copy_from_slice(data);
        self.refresh_filter(filter)
    }

    /* ------------------------------------------------------------------------------------------ */

    /// The CAM bitmask of `filters`, and whether any of them is slot based.
    pub(crate) fn flush_mask(&self, filters: &[Handle]) -> Result<(u64, bool)> {
        let mut mask = 0;
        let mut slot_based = false;
        for &filter in filters {
            filter.expect_kind(ObjectKind::Filter)?;
            let f = self.filters.get(filter)?;
            if f.filter_type.is_slot_based() {
                slot_based = true;
            } else if let Some(i) = f.filter_index.filter(|&i| i < 64) {
                mask |= 1 << i;
            }
        }
        Ok((mask, slot_based))
    }

    /// Decodes the metadata around a section: `header` is the slot index followed by the match
    /// bytes, `crc` the trailing CRC status byte, and `size` the size of the section with both.
    ///
    /// Filters hidden by a flush are left out, and `size` is retired from `flush`.
    pub(crate) fn section_metadata(
        &self,
        vdevice: Handle,
        flush: &mut FlushArray,
        header: &[u8],
        crc: u8,
        size: u32,
    ) -> Result<SectionMetadata> {
        let (slot_index, matches) = match header.split_first() {
            Some((&slot, rest)) if rest.len() >= 8 => (slot, word(&rest[..8])),
            _ => return Err(Error::BadParameter),
        };
        let vd = self.vdevices.get(vdevice)?;
        let (flushed, slot_based_flushed) = flush.current();

        let mut metadata = SectionMetadata {
            filters: Vec::new(),
            crc_ok: crc == 0,
        };

        let visible = matches & !flushed;
        for bit in (0..64usize).filter(|&b| visible & (1u64 << b) != 0) {
            metadata.filters.push(vd.section_filters.get(bit));
        }

        // No CAM filter matched, so the slot's own filter did.
        if matches == 0 && !slot_based_flushed {
            match self.slot_handles.get(usize::from(slot_index)) {
                Some(slot) => {
                    let filters = self.links.associated_of_kind(slot, ObjectKind::Filter);
                    if let [filter] = filters.as_slice() {
                        if self.filters.get(*filter)?.filter_type.is_slot_based() {
                            metadata.filters.push(Some(*filter));
                        }
                    }
                }
                None => metadata.filters.push(None),
            }
        }

        flush.consume(size);
        Ok(metadata)
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Hal {
    fn filter_op<R>(&self, filter: Handle, f: impl FnOnce(&mut PDeviceState) -> Result<R>) -> Result<R> {
        filter.expect_kind(ObjectKind::Filter)?;
        self.with_write(filter, |s| {
            s.filters.get(filter)?;
            f(s)
        })
    }

    /// Whether sections failing their CRC check are dropped rather than delivered with a bad
    /// CRC status. A slot drops them only if all its filters ask for it.
    pub fn filter_set_discard_on_crc(&self, filter: Handle, discard: bool) -> Result<()> {
        self.filter_op(filter, |s| s.filter_set_discard_on_crc(filter, discard))
    }

    /// Switches the filter on or off on every slot it is attached to, and on those it will be
    /// attached to later.
    pub fn filter_enable(&self, filter: Handle, enable: bool) -> Result<()> {
        self.filter_op(filter, |s| s.filter_enable(filter, enable))
    }

    /// Sets new match criteria.
    ///
    /// A CAM filter may switch to another CAM type; other filters keep their type.
    pub fn filter_update(&self, filter: Handle, update: &FilterUpdate) -> Result<()> {
        self.filter_op(filter, |s| s.filter_update(filter, update))
    }

    pub fn filter_update_proprietary(&self, filter: Handle, data: &[u8]) -> Result<()> {
        self.filter_op(filter, |s| s.filter_update_proprietary(filter, data))
    }

    pub fn filter_get_type(&self, filter: Handle) -> Result<FilterType> {
        filter.expect_kind(ObjectKind::Filter)?;
        self.with_read(filter, |s| Ok(s.filters.get(filter)?.filter_type))
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
