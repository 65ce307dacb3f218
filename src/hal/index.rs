// SPDX-License-Identifier: MIT OR Apache-2.0

//! Indexes: records of where interesting things happened in a recorded stream.
//!
//! An index sits between a slot and a buffer. Whenever a packet on the slot carries one of the
//! selected events (a PUSI, a scrambling change, an adaptation field flag, an MPEG start code),
//! the firmware writes a parcel describing the event to the index's buffer, followed by an index
//! parcel saying where in the recording the packet went.
//!
//! Indexes can be chained into a ring. The slot starts at the head of the ring and moves on to the
//! next index each time one fires, which lets a caller look for a sequence of events.

/* ---------------------------------------------------------------------------------------------- */

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hal::{Hal, PDeviceState, NO_INDEX};
use crate::interface::{parcel, status_flags, IndexerInfo, Tp};
use crate::objman::{Handle, ObjectKind};
use crate::tsinput::Clk27MHz;

/* ---------------------------------------------------------------------------------------------- */

/// Packet events an index can fire on.
pub const INDEXABLE_EVENTS: u32 = status_flags::PUSI
    | status_flags::SCRAMBLE_TOEVEN
    | status_flags::SCRAMBLE_TOODD
    | status_flags::SCRAMBLE_TOCLEAR
    | status_flags::CLEAR_TOSCRAMBLE
    | status_flags::PES_PTS
    | status_flags::FIRST_RECORD_PKT;

/// Words in the start code selection mask, one bit per start code value.
pub const START_CODE_MASK_WORDS: usize = 8;

/// Whether an index reports MPEG start codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartCodeMode {
    NoStartCodeIndexing,
    /// Report the selected start codes, with the bytes that follow them in the packet.
    WithContext,
}

/// An MPEG start code found by an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartCode {
    pub value: u8,
    /// Offset of the start code in its packet.
    pub offset: u8,
    /// Picture coding type, for picture start codes.
    pub ipb: u8,
}

/// One index event, as returned by [`Hal::buffer_read`] on an index buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexEventData {
    pub slot: Option<Handle>,
    pub buffer: Option<Handle>,
    pub arrival_time: Clk27MHz,
    /// Only set for PCR adaptation field events.
    pub pcr: Clk27MHz,
    /// Packets written to the recording buffer before the indexed one.
    pub buffer_packet_count: u32,
    pub buffer_offset: u32,
    pub event_flags: u32,
    /// Adaptation field flags, see [`crate::interface::transport_index`].
    pub additional_flags: u8,
    pub start_code: Option<StartCode>,
}

#[derive(Debug)]
pub struct Index {
    pub(crate) vdevice: Handle,
    pub(crate) indexer_index: u16,
    /// Next index of the chain. An index that is not chained points back at itself.
    pub(crate) next: Option<Handle>,
    /// Head of the chain this index is a member of, for chained indexes other than the head.
    pub(crate) head: Option<Handle>,
}

impl Index {
    fn new(vdevice: Handle) -> Index {
        Index {
            vdevice,
            indexer_index: NO_INDEX,
            next: None,
            head: None,
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Puts an indexer record into its unused state: no events, no output, chained to itself.
pub(crate) fn blank_indexer_info(info: &IndexerInfo<'_>, index: u16) -> Result<()> {
    info.parcel_selection().write(0)?;
    info.indexer_config().write(0)?;
    info.index_on_event_mask().write(0)?;
    info.additional_transport_index_mask().write(0)?;
    info.output_dma_record().write(NO_INDEX)?;
    info.mpeg_sc_mask().fill(0)?;
    info.index_count().write(0)?;
    info.next_chained_indexer().write(index)?;
    Ok(())
}

/// Keeps the event parcel selection in step with the event masks.
fn update_parcel_selection(info: &IndexerInfo<'_>) -> Result<()> {
    let events = info.index_on_event_mask().read()? != 0;
    let transport = info.additional_transport_index_mask().read()? != 0;
    let selection = info.parcel_selection();
    selection.set_bits(parcel::OUTPUT_EVENT, events)?;
    selection.set_bits(parcel::OUTPUT_ADDITIONAL_TRANSPORT_EVENT, transport)?;
    Ok(())
}

impl PDeviceState {
    pub(crate) fn index_allocate(&mut self, parent: Handle) -> Result<Handle> {
        let vdevice = self
            .links
            .ancestor(parent, ObjectKind::VDevice)
            .ok_or(Error::BadParameter)?;
        let tp = self.tp()?;

        let handle = self.indexes.insert(Index::new(vdevice))?;
        self.links.add_child(parent, handle);

        let indexer_index = match self.index_handles.add(handle) {
            Ok(i) if i < tp.layout().number_of_indexers as usize => i as u16,
            Ok(i) => {
                self.index_handles.remove(i);
                self.discard(handle);
                return Err(Error::NoMemory);
            }
            Err(e) => {
                self.discard(handle);
                return Err(e);
            }
        };

        let blanked = tp
            .indexer_info(indexer_index)
            .map_err(Error::from)
            .and_then(|info| blank_indexer_info(&info, indexer_index));
        if let Err(e) = blanked {
            self.index_handles.remove(usize::from(indexer_index));
            self.discard(handle);
            return Err(e);
        }

        self.indexes.get_mut(handle)?.indexer_index = indexer_index;
        trace!("Index {:?} on indexer {}", handle, indexer_index);
        Ok(handle)
    }

    pub(crate) fn index_deallocate(&mut self, handle: Handle) -> Result<()> {
        let tp = self.tp()?;
        self.index_unchain(&tp, handle)?;

        let indexer_index = self.indexes.get(handle)?.indexer_index;
        blank_indexer_info(&tp.indexer_info(indexer_index)?, indexer_index)?;
        self.index_handles.remove(usize::from(indexer_index));
        self.indexes.remove(handle).map(drop)
    }

    pub(crate) fn index_associator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        let tp = self.tp()?;
        let index = self.indexes.get(handle)?;
        let info = tp.indexer_info(index.indexer_index)?;

        match other.kind() {
            ObjectKind::Slot => {
                if index.head.is_some() {
                    return Err(Error::IndexInUse);
                }
                if self.links.count_associated(handle, ObjectKind::Slot) > 1 {
                    return Err(Error::IndexSlotAlreadyAssociated);
                }
                Ok(())
            }
            ObjectKind::Buffer => {
                if self.links.count_associated(handle, ObjectKind::Buffer) > 1 {
                    return Err(Error::ObjectAlreadyAssociated);
                }
                let dma = self.buffers.get(other)?.buffer_index.ok_or(Error::BadParameter)?;
                info.output_dma_record().write(dma)?;
                Ok(())
            }
            _ => Err(Error::BadParameter),
        }
    }

    pub(crate) fn index_disassociator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        let tp = self.tp()?;
        let info = tp.indexer_info(self.indexes.get(handle)?.indexer_index)?;

        match other.kind() {
            ObjectKind::Slot => Ok(()),
            ObjectKind::Buffer => {
                info.output_dma_record().write(NO_INDEX)?;
                Ok(())
            }
            _ => {
                warn!("Index {:?} was never associated with {:?}", handle, other);
                Ok(())
            }
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// The indexes of the chain `handle` belongs to, head first.
    fn chain_of(&self, handle: Handle) -> Result<Vec<Handle>> {
        let index = self.indexes.get(handle)?;
        let head = index.head.unwrap_or(handle);
        let mut chain = vec![head];
        let mut next = self.indexes.get(head)?.next;

        while let Some(n) = next {
            if n == head || chain.len() > self.indexes.len() {
                break;
            }
            chain.push(n);
            next = self.indexes.get(n)?.next;
        }
        Ok(chain)
    }

    /// Links `from` to `to`, or to itself when `to` is `None`.
    fn link_indexer(&mut self, tp: &Tp, from: Handle, to: Option<Handle>) -> Result<()> {
        let target = match to {
            Some(to) => self.indexes.get(to)?.indexer_index,
            None => self.indexes.get(from)?.indexer_index,
        };
        let index = self.indexes.get_mut(from)?;
        index.next = to;
        tp.indexer_info(index.indexer_index)?
            .next_chained_indexer()
            .write(target)?;
        Ok(())
    }

    /// Points the slot of a chain back at the head of the chain.
    fn rewind_chain(&self, tp: &Tp, head: Handle) -> Result<()> {
        if let Some(slot) = self.links.associated_of_kind(head, ObjectKind::Slot).first() {
            let slot_index = self.slots.get(*slot)?.slot_index;
            tp.slot_info(slot_index)?
                .indexer()
                .write(self.indexes.get(head)?.indexer_index)?;
        }
        Ok(())
    }

    /// Takes an index out of its chain. Taking out the head dissolves the whole chain.
    fn index_unchain(&mut self, tp: &Tp, handle: Handle) -> Result<()> {
        let chain = self.chain_of(handle)?;
        if chain.len() == 1 {
            return Ok(());
        }
        let head = chain[0];

        if head == handle {
            for &index in &chain {
                self.link_indexer(tp, index, None)?;
                self.indexes.get_mut(index)?.head = None;
            }
            return Ok(());
        }

        let position = chain
            .iter()
            .position(|&i| i == handle)
            .ok_or(Error::BadParameter)?;
        let previous = chain[position - 1];
        let next = chain.get(position + 1).copied().unwrap_or(head);
        let next = if next == previous { None } else { Some(next) };
        self.link_indexer(tp, previous, next)?;
        self.link_indexer(tp, handle, None)?;
        self.indexes.get_mut(handle)?.head = None;
        self.rewind_chain(tp, head)
    }

    pub(crate) fn index_transport_events(
        &mut self,
        handle: Handle,
        event_flags: u32,
        additional_flags: u8,
        enable: bool,
    ) -> Result<()> {
        if event_flags & !INDEXABLE_EVENTS != 0 {
            return Err(Error::BadParameter);
        }
        let tp = self.tp()?;
        let info = tp.indexer_info(self.indexes.get(handle)?.indexer_index)?;

        info.index_on_event_mask().set_bits(event_flags, enable)?;
        info.additional_transport_index_mask()
            .set_bits(additional_flags, enable)?;
        update_parcel_selection(&info)
    }

    pub(crate) fn index_output_start_codes(
        &mut self,
        handle: Handle,
        mask: &[u32; START_CODE_MASK_WORDS],
        mode: StartCodeMode,
    ) -> Result<()> {
        let tp = self.tp()?;
        let info = tp.indexer_info(self.indexes.get(handle)?.indexer_index)?;

        match mode {
            StartCodeMode::NoStartCodeIndexing => {
                info.parcel_selection()
                    .set_bits(parcel::OUTPUT_START_CODE_EVENT, false)?;
                info.mpeg_sc_mask().fill(0)?;
            }
            StartCodeMode::WithContext => {
                info.mpeg_sc_mask().write_all(mask)?;
                info.parcel_selection().set_bits(
                    parcel::OUTPUT_START_CODE_EVENT,
                    mask.iter().any(|&w| w != 0),
                )?;
            }
        }
        Ok(())
    }

    pub(crate) fn index_reset(&mut self, handle: Handle) -> Result<()> {
        let tp = self.tp()?;
        let index = self.indexes.get(handle)?;
        let head = index.head.unwrap_or(handle);
        tp.indexer_info(index.indexer_index)?.index_count().write(0)?;

        if let Some(slot) = self.links.associated_of_kind(head, ObjectKind::Slot).first() {
            let info = tp.slot_info(self.slots.get(*slot)?.slot_index)?;
            info.raw_indexer_state().write(0)?;
        }
        self.rewind_chain(&tp, head)
    }

    /// Builds the ring `head`, `chain[0]`, ..., `chain[n - 1]`, `head`.
    pub(crate) fn index_chain(&mut self, head: Handle, chain: &[Handle]) -> Result<()> {
        let tp = self.tp()?;

        let vdevice = self.indexes.get(head)?.vdevice;
        let mut seen = vec![head];
        for &index in chain {
            index.expect_kind(ObjectKind::Index)?;
            if seen.contains(&index) || self.indexes.get(index)?.vdevice != vdevice {
                return Err(Error::BadParameter);
            }
            if !self.links.associated(index).is_empty() {
                return Err(Error::IndexInUse);
            }
            seen.push(index);
        }

        // Every index stands alone before the new ring is built.
        for &index in &seen {
            self.index_unchain(&tp, index)?;
        }

        let mut previous = head;
        for &index in chain {
            self.link_indexer(&tp, previous, Some(index))?;
            self.indexes.get_mut(index)?.head = Some(head);
            previous = index;
        }
        if previous != head {
            self.link_indexer(&tp, previous, Some(head))?;
        }

        self.rewind_chain(&tp, head)?;
        debug!("Index {:?} chained to {} others", head, chain.len());
        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Hal {
    fn index_op<R>(&self, index: Handle, f: impl FnOnce(&mut PDeviceState) -> Result<R>) -> Result<R> {
        index.expect_kind(ObjectKind::Index)?;
        self.with_write(index, |s| {
            s.indexes.get(index)?;
            f(s)
        })
    }

    /// Turns indexing on (or off) for packet events and adaptation field flags.
    ///
    /// `event_flags` may only name [`INDEXABLE_EVENTS`]; `additional_flags` takes the bits of
    /// [`crate::interface::transport_index`].
    pub fn index_transport_events(
        &self,
        index: Handle,
        event_flags: u32,
        additional_flags: u8,
        enable: bool,
    ) -> Result<()> {
        self.index_op(index, |s| {
            s.index_transport_events(index, event_flags, additional_flags, enable)
        })
    }

    /// Selects the MPEG start codes to index: bit `n % 32` of word `n / 32` selects value `n`.
    pub fn index_output_start_codes(
        &self,
        index: Handle,
        mask: &[u32; START_CODE_MASK_WORDS],
        mode: StartCodeMode,
    ) -> Result<()> {
        self.index_op(index, |s| s.index_output_start_codes(index, mask, mode))
    }

    pub fn index_reset(&self, index: Handle) -> Result<()> {
        self.index_op(index, |s| s.index_reset(index))
    }

    /// Chains `chain` behind `head`. The chained indexes must not be associated with anything;
    /// an empty `chain` leaves `head` on its own.
    pub fn index_chain(&self, head: Handle, chain: &[Handle]) -> Result<()> {
        self.index_op(head, |s| s.index_chain(head, chain))
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::testing::*;
    use crate::hal::{AllocParams, ReadQuantisation, SlotMode, UnitMetadata};
    use crate::interface::transport_index;

    fn tp(rig: &Rig) -> Tp {
        rig.hal.with_read(rig.pdevice, |s| s.tp()).unwrap()
    }

    fn index(rig: &Rig) -> Handle {
        rig.hal.allocate(rig.session, AllocParams::Index).unwrap()
    }

    fn indexer_index(rig: &Rig, index: Handle) -> u16 {
        rig.hal
            .with_read(index, |s| Ok(s.indexes.get(index)?.indexer_index))
            .unwrap()
    }

    fn next_of(rig: &Rig, index: Handle) -> u16 {
        tp(rig)
            .indexer_info(indexer_index(rig, index))
            .unwrap()
            .next_chained_indexer()
            .read()
            .unwrap()
    }

    fn index_parcel(buffer: u16, slot: u16, count: u32) -> Vec<u8> {
        let mut p = vec![parcel::INDEX, 18];
        p.extend_from_slice(&[0; 6]);
        p.extend_from_slice(&buffer.to_le_bytes());
        p.extend_from_slice(&slot.to_le_bytes());
        p.extend_from_slice(&count.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        p
    }

    fn read_event(rig: &Rig, buffer: Handle, at: u32, dest: &mut [u8]) -> (u32, u32, IndexEventData) {
        let read = rig
            .hal
            .buffer_read(buffer, ReadQuantisation::AsUnits, Some(at), 0, dest, &mut [])
            .unwrap();
        match read.metadata {
            UnitMetadata::Index(event) => (read.bytes_copied, read.next_read_offset, event),
            other => panic!("not an index event: {:?}", other),
        }
    }

    #[test]
    fn test_events_read_back_from_index_buffer() {
        let rig = rig();
        let index = index(&rig);
        let slot = rig.slot(SlotMode::Raw);
        let buffer = rig.buffer(1024);
        rig.hal.associate(slot, index).unwrap();
        rig.hal.associate(index, buffer).unwrap();
        let dma = rig.dma_index(buffer);
        let slot_index = rig.slot_index(slot);

        // A stray index ahead of the event, the event with no data of its own, then its index.
        let mut data = index_parcel(dma, slot_index, 1);
        data.extend_from_slice(&[parcel::EVENT, 4]);
        data.extend_from_slice(&status_flags::PUSI.to_le_bytes());
        data.extend(index_parcel(dma, slot_index, 2));
        let first_unit = data.len() as u32;

        // An event whose index only follows a start code event, then that start code's own index.
        data.extend_from_slice(&[parcel::EVENT, 4]);
        data.extend_from_slice(&status_flags::PUSI.to_le_bytes());
        data.extend_from_slice(&[parcel::STARTCODE_EVENT, 4, 0xB3, 20, 0xAA, 0x55]);
        data.extend(index_parcel(dma, slot_index, 3));
        rig.tp.inject(dma, &data).unwrap();

        let mut dest = [0u8; 64];
        let (copied, next, event) = read_event(&rig, buffer, 0, &mut dest);
        assert_eq!((copied, next), (0, first_unit));
        assert_eq!(event.event_flags, status_flags::PUSI);
        assert_eq!(event.buffer_packet_count, 2);
        assert_eq!(event.slot, Some(slot));
        assert_eq!(event.buffer, Some(buffer));

        let (copied, next, event) = read_event(&rig, buffer, first_unit, &mut dest);
        assert_eq!((copied, next), (0, first_unit + 6));
        assert_eq!(event.event_flags, status_flags::PUSI);
        assert_eq!(event.buffer_packet_count, 3);

        let (copied, next, event) = read_event(&rig, buffer, next, &mut dest);
        assert_eq!((copied, next), (2, data.len() as u32));
        assert_eq!(&dest[..2], &[0xAA, 0x55]);
        assert_eq!(event.start_code.map(|sc| sc.value), Some(0xB3));

        assert!(matches!(
            rig.hal.buffer_read(buffer, ReadQuantisation::AsUnits, Some(next), 0, &mut dest, &mut []),
            Err(Error::NoPacket)
        ));
    }

    #[test]
    fn test_allocation_exhausts_indexers() {
        let rig = rig();
        let all = (0..4).map(|_| index(&rig)).collect::<Vec<_>>();
        for (i, &index) in all.iter().enumerate() {
            assert_eq!(indexer_index(&rig, index), i as u16);
            assert_eq!(next_of(&rig, index), i as u16);
        }
        assert!(rig.hal.allocate(rig.session, AllocParams::Index).is_err());

        rig.hal.deallocate(all[1], false).unwrap();
        assert_eq!(indexer_index(&rig, index(&rig)), 1);
    }

    #[test]
    fn test_transport_events_select_parcels() {
        let rig = rig();
        let index = index(&rig);
        let info_index = indexer_index(&rig, index);

        rig.hal
            .index_transport_events(index, status_flags::PUSI, transport_index::PCR_FLAG, true)
            .unwrap();
        let tp = tp(&rig);
        let info = tp.indexer_info(info_index).unwrap();
        assert_eq!(info.index_on_event_mask().read().unwrap(), status_flags::PUSI);
        assert_eq!(
            info.parcel_selection().read().unwrap(),
            parcel::OUTPUT_EVENT | parcel::OUTPUT_ADDITIONAL_TRANSPORT_EVENT
        );

        rig.hal
            .index_transport_events(index, 0, transport_index::PCR_FLAG, false)
            .unwrap();
        assert_eq!(info.parcel_selection().read().unwrap(), parcel::OUTPUT_EVENT);

        assert!(matches!(
            rig.hal.index_transport_events(index, status_flags::CC_ERROR, 0, true),
            Err(Error::BadParameter)
        ));
    }

    #[test]
    fn test_start_codes() {
        let rig = rig();
        let index = index(&rig);
        let mut mask = [0u32; START_CODE_MASK_WORDS];
        mask[0] = 0x1;
        mask[7] = 0x8000_0000;

        rig.hal
            .index_output_start_codes(index, &mask, StartCodeMode::WithContext)
            .unwrap();
        let tp = tp(&rig);
        let info = tp.indexer_info(indexer_index(&rig, index)).unwrap();
        assert_eq!(info.mpeg_sc_mask().read_all().unwrap(), mask.to_vec());
        assert_eq!(
            info.parcel_selection().read().unwrap(),
            parcel::OUTPUT_START_CODE_EVENT
        );

        rig.hal
            .index_output_start_codes(index, &mask, StartCodeMode::NoStartCodeIndexing)
            .unwrap();
        assert_eq!(info.parcel_selection().read().unwrap(), 0);
        assert_eq!(info.mpeg_sc_mask().read_all().unwrap(), vec![0; 8]);
    }

    #[test]
    fn test_chain_is_circular_and_rewinds_slot() {
        let rig = rig();
        let head = index(&rig);
        let a = index(&rig);
        let b = index(&rig);
        let slot = rig.slot(SlotMode::Raw);
        rig.hal.associate(slot, head).unwrap();

        rig.hal.index_chain(head, &[a, b]).unwrap();
        assert_eq!(next_of(&rig, head), indexer_index(&rig, a));
        assert_eq!(next_of(&rig, a), indexer_index(&rig, b));
        assert_eq!(next_of(&rig, b), indexer_index(&rig, head));

        let tp = tp(&rig);
        let slot_info = tp.slot_info(rig.slot_index(slot)).unwrap();
        slot_info.indexer().write(indexer_index(&rig, b)).unwrap();
        rig.hal.index_reset(head).unwrap();
        assert_eq!(slot_info.indexer().read().unwrap(), indexer_index(&rig, head));

        // Rechaining without `a` leaves it on its own.
        rig.hal.index_chain(head, &[b]).unwrap();
        assert_eq!(next_of(&rig, a), indexer_index(&rig, a));
        assert_eq!(next_of(&rig, head), indexer_index(&rig, b));
        assert_eq!(next_of(&rig, b), indexer_index(&rig, head));
    }

    #[test]
    fn test_chained_index_must_be_bare() {
        let rig = rig();
        let head = index(&rig);
        let busy = index(&rig);
        let slot = rig.slot(SlotMode::Raw);
        rig.hal.associate(slot, busy).unwrap();

        assert!(matches!(
            rig.hal.index_chain(head, &[busy]),
            Err(Error::IndexInUse)
        ));
        assert!(matches!(
            rig.hal.index_chain(head, &[head]),
            Err(Error::BadParameter)
        ));
        assert_eq!(next_of(&rig, head), indexer_index(&rig, head));
    }

    #[test]
    fn test_deallocating_member_closes_ring() {
        let rig = rig();
        let head = index(&rig);
        let a = index(&rig);
        let b = index(&rig);
        rig.hal.index_chain(head, &[a, b]).unwrap();

        rig.hal.deallocate(a, false).unwrap();
        assert_eq!(next_of(&rig, head), indexer_index(&rig, b));
        assert_eq!(next_of(&rig, b), indexer_index(&rig, head));

        rig.hal.deallocate(head, false).unwrap();
        assert_eq!(next_of(&rig, b), indexer_index(&rig, b));
    }

    #[test]
    fn test_one_slot_per_index() {
        let rig = rig();
        let index = index(&rig);
        let first = rig.slot(SlotMode::Raw);
        let second = rig.slot(SlotMode::Raw);

        rig.hal.associate(first, index).unwrap();
        let tp = tp(&rig);
        let slot_info = tp.slot_info(rig.slot_index(first)).unwrap();
        assert_eq!(slot_info.indexer().read().unwrap(), indexer_index(&rig, index));

        assert!(matches!(
            rig.hal.associate(second, index),
            Err(Error::IndexSlotAlreadyAssociated)
        ));

        rig.hal.disassociate(first, Some(index)).unwrap();
        assert_eq!(slot_info.indexer().read().unwrap(), NO_INDEX);
    }
}

/* ---------------------------------------------------------------------------------------------- */
