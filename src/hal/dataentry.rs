// SPDX-License-Identifier: MIT OR Apache-2.0

//! Data entries: packets a RAW slot puts out in place of, or in between, the packets it collects.
//!
//! Entries queued on a slot are handed to the firmware one at a time through the data-entry
//! record of the slot. The firmware outputs the entry as many times as asked, then marks the
//! record complete and raises a status block naming the slot, upon which the entry is retired
//! from the queue and the next one is loaded.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hal::slot::SlotMode;
use crate::hal::{Hal, PDeviceState};
use crate::interface::{data_entry_state, DataEntryInfo, Tp, DATA_ENTRY_REPEAT_FOREVER};
use crate::objman::{Handle, ObjectKind};
use crate::regions::structured::{publish, retire};
use crate::regions::{SharedMemory, TpRegion};

/* ---------------------------------------------------------------------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataEntryConfig {
    /// Packets the entry can hold.
    pub number_of_packets: u8,
}

impl Default for DataEntryConfig {
    fn default() -> DataEntryConfig {
        DataEntryConfig {
            number_of_packets: 1,
        }
    }
}

/// What a data entry puts out, see [`Hal::data_entry_configure`].
#[derive(Clone, Copy, Debug)]
pub struct DataEntryParams<'a> {
    /// Whole packets.
    pub data: &'a [u8],
    /// Times to output the data, or `None` to repeat it until the entry is withdrawn.
    pub repeat_count: Option<u8>,
    /// Bytes of each replaced packet to keep before the entry's bytes take over.
    pub from_byte: u8,
    /// Whether the vDevice's handler hears about the entry completing.
    pub notify: bool,
}

#[derive(Debug)]
pub struct DataEntry {
    device_address: u32,
    memory: Arc<SharedMemory>,
    capacity: u32,
    packet_size: u8,

    size: u16,
    count: u16,
    from_byte: u8,
    notify: bool,
}

impl DataEntry {
    fn repeats_forever(&self) -> bool {
        self.count == DATA_ENTRY_REPEAT_FOREVER
    }
}

/// Clears a data-entry record, state first.
fn blank_record(record: &DataEntryInfo<'_>) -> Result<()> {
    retire(record.state(), data_entry_state::EMPTY, || {
        record.addr().write(0)?;
        record.from_byte().write(0)?;
        record.size().write(0)?;
        record.count().write(0)
    })?;
    Ok(())
}

/* ---------------------------------------------------------------------------------------------- */

impl PDeviceState {
    pub(crate) fn data_entry_allocate(
        &mut self,
        parent: Handle,
        config: DataEntryConfig,
    ) -> Result<Handle> {
        if config.number_of_packets == 0 {
            return Err(Error::BadParameter);
        }
        let vdevice = self
            .links
            .ancestor(parent, ObjectKind::VDevice)
            .ok_or(Error::BadParameter)?;
        let packet_size = self.vdevices.get(vdevice)?.config.packet_size;
        let capacity = u32::from(config.number_of_packets) * u32::from(packet_size);

        let dma = self.backend.allocate_dma(capacity as usize)?;
        let address = dma.device_address;
        let entry = DataEntry {
            device_address: address,
            memory: dma.memory,
            capacity,
            packet_size,
            size: 0,
            count: 0,
            from_byte: 0,
            notify: false,
        };
        let handle = match self.data_entries.insert(entry) {
            Ok(handle) => handle,
            Err(e) => {
                self.backend.free_dma(address);
                return Err(e);
            }
        };
        self.links.add_child(parent, handle);
        Ok(handle)
    }

    /// The DMA of an entry the firmware may still be reading stays with the slot until the
    /// firmware is done with it.
    pub(crate) fn data_entry_deallocate(&mut self, handle: Handle) -> Result<()> {
        let entry = self.data_entries.remove(handle)?;

        let holder = self
            .slots
            .iter()
            .find(|(_, s)| s.entry_in_flight == Some(handle))
            .map(|(slot, _)| slot);
        match holder {
            Some(slot) => {
                let s = self.slots.get_mut(slot)?;
                debug!("Slot {} keeps the DMA of deallocated {:?}", s.slot_index, handle);
                if let Some(previous) = s.orphaned_dma.replace(entry.device_address) {
                    self.backend.free_dma(previous);
                }
            }
            None => self.backend.free_dma(entry.device_address),
        }
        Ok(())
    }

    pub(crate) fn data_entry_associator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        if other.kind() != ObjectKind::Slot {
            return Err(Error::BadParameter);
        }
        if self.links.count_associated(handle, ObjectKind::Slot) > 1 {
            return Err(Error::ObjectAlreadyAssociated);
        }
        if self.data_entries.get(handle)?.size == 0 {
            return Err(Error::BadParameter);
        }
        {
            let s = self.slots.get(other)?;
            let takes_entries = s.config.data_entry_replacement || s.config.data_entry_insertion;
            if !matches!(s.mode(), SlotMode::Raw | SlotMode::PartialPes) || !takes_entries {
                return Err(Error::InvalidSlotType);
            }
        }

        let tp = self.tp()?;
        self.slots.get_mut(other)?.data_entries.push_back(handle);
        self.data_entry_load(&tp, other)
    }

    pub(crate) fn data_entry_disassociator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        let (slot_index, position) = {
            let s = self.slots.get(other)?;
            (s.slot_index, s.data_entries.iter().position(|&e| e == handle))
        };
        let position = match position {
            Some(position) => position,
            // Already retired.
            None => return Ok(()),
        };
        if position > 0 || self.slots.get(other)?.entry_in_flight.is_some() {
            self.slots.get_mut(other)?.data_entries.remove(position);
            return Ok(());
        }

        // The entry at the front is the one the firmware has.
        let tp = self.tp()?;
        if let Err(e) = self.slot_tp_sync(&tp) {
            warn!("Withdrawing data entry of slot {} without a sync: {}", slot_index, e);
        }
        let info = tp.slot_info(slot_index)?;
        let record = info.raw_data_entry();
        let state = record.state().read()?;
        let started = matches!(
            state,
            data_entry_state::PROCESSING | data_entry_state::COMPLETE
        );

        let s = self.slots.get_mut(other)?;
        s.data_entries.pop_front();
        if started && !self.data_entries.get(handle)?.repeats_forever() {
            trace!("Slot {}: {:?} left to finish", slot_index, handle);
            s.entry_in_flight = Some(handle);
            return Ok(());
        }

        blank_record(&record)?;
        self.data_entry_load(&tp, other)
    }

    /// Hands the entry at the front of the slot's queue to the firmware, unless the firmware is
    /// still busy with one.
    fn data_entry_load(&self, tp: &Tp, slot: Handle) -> Result<()> {
        let s = self.slots.get(slot)?;
        if s.entry_in_flight.is_some() {
            return Ok(());
        }
        let front = match s.data_entries.front() {
            Some(&front) => front,
            None => return Ok(()),
        };

        let info = tp.slot_info(s.slot_index)?;
        let record = info.raw_data_entry();
        if record.state().read()? != data_entry_state::EMPTY {
            return Ok(());
        }

        let e = self.data_entries.get(front)?;
        publish(
            || {
                record.addr().write(e.device_address)?;
                record.from_byte().write(e.from_byte)?;
                record.size().write(e.size)?;
                record.count().write(e.count)?;
                record.slot_index().write(s.slot_index)
            },
            record.state(),
            data_entry_state::LOADED,
        )?;
        trace!("Slot {}: loaded {:?}", s.slot_index, front);
        Ok(())
    }

    /// Retires the entry the firmware finished on a slot and loads the next one.
    ///
    /// Returns the finished entry if its completion is to be notified.
    pub(crate) fn data_entry_completed(&mut self, slot_index: u16) -> Result<Option<Handle>> {
        let slot = match self.slot_handles.get(usize::from(slot_index)) {
            Some(slot) => slot,
            None => {
                debug!("Data entry completion for unused slot {}", slot_index);
                return Ok(None);
            }
        };
        let tp = self.tp()?;

        let (finished, orphaned) = {
            let s = self.slots.get_mut(slot)?;
            let finished = match s.entry_in_flight.take() {
                Some(entry) => Some(entry),
                None => s.data_entries.pop_front(),
            };
            (finished, s.orphaned_dma.take())
        };
        if let Some(address) = orphaned {
            self.backend.free_dma(address);
        }

        blank_record(&tp.slot_info(slot_index)?.raw_data_entry())?;
        self.data_entry_load(&tp, slot)?;

        Ok(finished.filter(|&h| matches!(self.data_entries.get(h), Ok(e) if e.notify)))
    }

    fn data_entry_configure(&mut self, handle: Handle, params: &DataEntryParams<'_>) -> Result<()> {
        if self.links.count_associated(handle, ObjectKind::Slot) > 0 {
            return Err(Error::DeviceBusy);
        }
        let e = self.data_entries.get_mut(handle)?;
        let len = params.data.len();
        if len == 0 || len > e.capacity as usize || len % usize::from(e.packet_size) != 0 {
            return Err(Error::BadParameter);
        }
        if params.from_byte >= e.packet_size || params.repeat_count == Some(0) {
            return Err(Error::BadParameter);
        }

        e.memory.write_bytes(0, params.data)?;
        e.size = len as u16;
        e.count = params
            .repeat_count
            .map_or(DATA_ENTRY_REPEAT_FOREVER, u16::from);
        e.from_byte = params.from_byte;
        e.notify = params.notify;
        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Hal {
    /// Sets what the entry puts out. Only entries that are not queued on a slot can be changed.
    pub fn data_entry_configure(&self, entry: Handle, params: &DataEntryParams<'_>) -> Result<()> {
        entry.expect_kind(ObjectKind::DataEntry)?;
        self.with_write(entry, |s| s.data_entry_configure(entry, params))
    }

    /// Entries queued on a slot, the one the firmware has first.
    pub fn data_entry_queue(&self, slot: Handle) -> Result<VecDeque<Handle>> {
        slot.expect_kind(ObjectKind::Slot)?;
        self.with_read(slot, |s| Ok(s.slots.get(slot)?.data_entries.clone()))
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::testing::*;
    use crate::hal::{AllocParams, EventHandler, EventRecord, SlotConfig};
    use crate::interface::{status_flags, StatusBlock};
    use crate::tsinput::NullTsInput;
    use std::sync::mpsc;
    use std::time::Duration;

    fn entry_slot(rig: &Rig) -> Handle {
        rig.hal
            .allocate(
                rig.session,
                AllocParams::Slot(SlotConfig {
                    mode: SlotMode::Raw,
                    data_entry_replacement: true,
                    ..SlotConfig::default()
                }),
            )
            .unwrap()
    }

    fn entry(rig: &Rig, fill: u8, notify: bool) -> Handle {
        let entry = rig
            .hal
            .allocate(rig.session, AllocParams::DataEntry(DataEntryConfig::default()))
            .unwrap();
        let data = vec![fill; 188];
        rig.hal
            .data_entry_configure(
                entry,
                &DataEntryParams {
                    data: &data,
                    repeat_count: Some(1),
                    from_byte: 4,
                    notify,
                },
            )
            .unwrap();
        entry
    }

    fn address_of(rig: &Rig, entry: Handle) -> u32 {
        rig.hal
            .with_read(entry, |s| Ok(s.data_entries.get(entry)?.device_address))
            .unwrap()
    }

    /// State and address of the slot's data-entry record.
    fn record(rig: &Rig, slot: Handle) -> (u8, u32) {
        let index = rig.slot_index(slot);
        rig.hal
            .with_read(slot, |s| {
                let tp = s.tp()?;
                let info = tp.slot_info(index)?;
                let record = info.raw_data_entry();
                Ok((record.state().read()?, record.addr().read()?))
            })
            .unwrap()
    }

    /// Plays the firmware moving the record of a slot along.
    fn set_state(rig: &Rig, slot: Handle, state: u8) {
        let index = rig.slot_index(slot);
        rig.hal
            .with_read(slot, |s| {
                let tp = s.tp()?;
                tp.slot_info(index)?.raw_data_entry().state().write(state)?;
                Ok(())
            })
            .unwrap();
    }

    fn complete(rig: &Rig, slot: Handle) -> Option<Handle> {
        set_state(rig, slot, data_entry_state::COMPLETE);
        let index = rig.slot_index(slot);
        rig.hal
            .with_write(slot, |s| s.data_entry_completed(index))
            .unwrap()
    }

    #[test]
    fn test_configure_checks_data() {
        let rig = rig();
        let entry = rig
            .hal
            .allocate(
                rig.session,
                AllocParams::DataEntry(DataEntryConfig {
                    number_of_packets: 2,
                }),
            )
            .unwrap();
        fn params(data: &[u8]) -> DataEntryParams<'_> {
            DataEntryParams {
                data,
                repeat_count: Some(1),
                from_byte: 0,
                notify: false,
            }
        }

        for bad in [vec![0; 100], vec![0; 3 * 188], Vec::new()] {
            assert!(matches!(
                rig.hal.data_entry_configure(entry, &params(&bad)),
                Err(Error::BadParameter)
            ));
        }
        let two = vec![0; 2 * 188];
        rig.hal.data_entry_configure(entry, &params(&two)).unwrap();
        assert!(matches!(
            rig.hal.data_entry_configure(
                entry,
                &DataEntryParams {
                    from_byte: 188,
                    ..params(&two)
                }
            ),
            Err(Error::BadParameter)
        ));
        assert!(matches!(
            rig.hal.allocate(
                rig.session,
                AllocParams::DataEntry(DataEntryConfig {
                    number_of_packets: 0
                })
            ),
            Err(Error::BadParameter)
        ));
    }

    #[test]
    fn test_only_entry_slots_take_entries() {
        let rig = rig();
        let e = entry(&rig, 0xAA, false);

        let section = rig.slot(SlotMode::Section);
        assert!(matches!(rig.hal.associate(section, e), Err(Error::InvalidSlotType)));
        let plain_raw = rig.slot(SlotMode::Raw);
        assert!(matches!(rig.hal.associate(plain_raw, e), Err(Error::InvalidSlotType)));
        assert!(rig.hal.associated(e).unwrap().is_empty());

        let blank = rig
            .hal
            .allocate(rig.session, AllocParams::DataEntry(DataEntryConfig::default()))
            .unwrap();
        let slot = entry_slot(&rig);
        assert!(matches!(rig.hal.associate(slot, blank), Err(Error::BadParameter)));
        rig.hal.associate(slot, e).unwrap();
        assert!(matches!(
            rig.hal.data_entry_configure(
                e,
                &DataEntryParams {
                    data: &[0; 188],
                    repeat_count: None,
                    from_byte: 0,
                    notify: false,
                }
            ),
            Err(Error::DeviceBusy)
        ));
    }

    #[test]
    fn test_queue_is_fed_to_firmware_in_order() {
        let rig = rig();
        let slot = entry_slot(&rig);
        let first = entry(&rig, 0x11, true);
        let second = entry(&rig, 0x22, false);

        rig.hal.associate(slot, first).unwrap();
        rig.hal.associate(slot, second).unwrap();
        assert_eq!(
            record(&rig, slot),
            (data_entry_state::LOADED, address_of(&rig, first))
        );
        assert_eq!(rig.hal.data_entry_queue(slot).unwrap(), vec![first, second]);

        // Only entries that asked for it are reported.
        assert_eq!(complete(&rig, slot), Some(first));
        assert_eq!(
            record(&rig, slot),
            (data_entry_state::LOADED, address_of(&rig, second))
        );
        assert_eq!(complete(&rig, slot), None);
        assert_eq!(record(&rig, slot), (data_entry_state::EMPTY, 0));
        assert!(rig.hal.data_entry_queue(slot).unwrap().is_empty());

        // Retired entries stay associated until told otherwise.
        rig.hal.disassociate(first, Some(slot)).unwrap();
        rig.hal.associate(slot, first).unwrap();
        assert_eq!(record(&rig, slot).0, data_entry_state::LOADED);
    }

    #[test]
    fn test_untouched_entry_is_withdrawn() {
        let rig = rig();
        let slot = entry_slot(&rig);
        let first = entry(&rig, 0x11, false);
        let second = entry(&rig, 0x22, false);
        rig.hal.associate(slot, first).unwrap();
        rig.hal.associate(slot, second).unwrap();

        rig.hal.disassociate(first, Some(slot)).unwrap();
        assert_eq!(
            record(&rig, slot),
            (data_entry_state::LOADED, address_of(&rig, second))
        );
        assert_eq!(rig.hal.data_entry_queue(slot).unwrap(), vec![second]);
    }

    #[test]
    fn test_started_entry_is_left_to_finish() {
        let rig = rig();
        let slot = entry_slot(&rig);
        let first = entry(&rig, 0x11, true);
        let second = entry(&rig, 0x22, false);
        rig.hal.associate(slot, first).unwrap();
        rig.hal.associate(slot, second).unwrap();

        set_state(&rig, slot, data_entry_state::PROCESSING);
        rig.hal.disassociate(first, Some(slot)).unwrap();
        assert_eq!(
            record(&rig, slot),
            (data_entry_state::PROCESSING, address_of(&rig, first))
        );

        assert_eq!(complete(&rig, slot), Some(first));
        assert_eq!(
            record(&rig, slot),
            (data_entry_state::LOADED, address_of(&rig, second))
        );
    }

    #[test]
    fn test_deallocated_entry_dma_outlives_firmware_use() {
        let rig = rig();
        let slot = entry_slot(&rig);
        let e = entry(&rig, 0x11, true);
        rig.hal.associate(slot, e).unwrap();
        let before = rig.tp.dma_allocations();

        set_state(&rig, slot, data_entry_state::PROCESSING);
        rig.hal.deallocate(e, true).unwrap();
        assert_eq!(rig.tp.dma_allocations(), before);

        // Gone, so nobody to tell.
        assert_eq!(complete(&rig, slot), None);
        assert_eq!(rig.tp.dma_allocations(), before - 1);
    }

    #[test]
    fn test_repeating_entry_is_withdrawn_while_running() {
        let rig = rig();
        let slot = entry_slot(&rig);
        let e = rig
            .hal
            .allocate(rig.session, AllocParams::DataEntry(DataEntryConfig::default()))
            .unwrap();
        rig.hal
            .data_entry_configure(
                e,
                &DataEntryParams {
                    data: &[0x47; 188],
                    repeat_count: None,
                    from_byte: 0,
                    notify: false,
                },
            )
            .unwrap();
        rig.hal.associate(slot, e).unwrap();

        set_state(&rig, slot, data_entry_state::PROCESSING);
        rig.hal.disassociate(e, None).unwrap();
        assert_eq!(record(&rig, slot), (data_entry_state::EMPTY, 0));
    }

    #[derive(Debug)]
    struct Completions(parking_lot::Mutex<mpsc::Sender<EventRecord>>);

    impl EventHandler for Completions {
        fn data_entry_complete(&self, event: &EventRecord) {
            let _ = self.0.lock().send(*event);
        }
    }

    #[test]
    fn test_completion_reaches_handler() {
        let (tx, rx) = mpsc::channel();
        let rig = rig_with_handler(
            small_pdevice(),
            small_vdevice(),
            Arc::new(NullTsInput),
            Arc::new(Completions(parking_lot::Mutex::new(tx))),
        );
        let slot = entry_slot(&rig);
        let first = entry(&rig, 0x11, true);
        let second = entry(&rig, 0x22, false);
        rig.hal.associate(slot, first).unwrap();
        rig.hal.associate(slot, second).unwrap();

        set_state(&rig, slot, data_entry_state::COMPLETE);
        let block = StatusBlock {
            flags: status_flags::DATA_ENTRY_COMPLETE,
            slot_index: rig.slot_index(slot),
            dma_index: 0xFFFF,
            data_entry_slot_index: rig.slot_index(slot),
            vdevice: rig.vdevice.index() as u8,
            ..StatusBlock::default()
        };
        rig.tp.emit_status_block(&block).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.data_entry, Some(first));
        assert_eq!(event.slot, Some(slot));
        assert_eq!(rig.hal.data_entry_queue(slot).unwrap(), vec![second]);
    }
}

/* ---------------------------------------------------------------------------------------------- */
