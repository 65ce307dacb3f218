// SPDX-License-Identifier: MIT OR Apache-2.0

//! Firmware events, and their delivery to vDevice owners.
//!
//! The interrupt handler copies status blocks out of shared memory and queues them. A dedicated
//! task per pDevice takes them off the queue, resolves the slot, buffer and vDevice they refer to,
//! and calls the vDevice's [`EventHandler`] with no HAL lock held, so handlers may call back into
//! the HAL.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use log::{debug, trace, warn};
use parking_lot::RwLock;

use crate::hal::PDeviceState;
use crate::interface::{status_flags, StatusBlock};
use crate::objman::Handle;
use crate::sync::{MessageQueue, Wait};
use crate::tsinput::Clk27MHz;

/* ---------------------------------------------------------------------------------------------- */

pub(crate) enum EventMsg {
    Status(StatusBlock),
    Quit,
}

/// The kinds of event a vDevice can enable or disable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    BufferOverflow,
    CcError,
    ScrambleToClear,
    ClearToScramble,
    InvalidParameter,
    TransportError,
    PcrReceived,
    PesError,
    SectionsDiscardedOnCrc,
    InterruptFail,
    DataEntryComplete,
    MarkerError,
    InvalidSecondaryPidPacket,
    InvalidDescrambleKey,
}

impl EventType {
    /// Status block flags the firmware raises for this event, or `None` if the firmware cannot
    /// report it.
    pub(crate) fn status_flags(self) -> Option<u32> {
        use status_flags::*;
        let flags = match self {
            EventType::BufferOverflow => BUFFER_OVERFLOW,
            EventType::CcError => CC_ERROR | SECONDARY_PID_CC_ERROR,
            EventType::ScrambleToClear => SCRAMBLE_TOCLEAR,
            EventType::ClearToScramble => CLEAR_TOSCRAMBLE,
            EventType::InvalidParameter => INVALID_PARAMETER,
            EventType::TransportError => TRANSPORT_ERROR,
            EventType::PcrReceived => PCR_RECEIVED,
            EventType::PesError => PES_ERROR,
            EventType::SectionsDiscardedOnCrc => SECTION_CRC_DISCARD,
            EventType::InterruptFail => STATUS_BLK_OVERFLOW,
            EventType::DataEntryComplete => DATA_ENTRY_COMPLETE,
            EventType::MarkerError => MARKER_ERROR,
            EventType::InvalidSecondaryPidPacket => SECONDARY_PID_DISCARDED,
            EventType::InvalidDescrambleKey => return None,
        };
        Some(flags)
    }
}

/// Everything a status block says, with firmware indexes resolved to handles.
///
/// Handles may already be stale by the time the handler looks at them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub vdevice: Handle,
    pub slot: Option<Handle>,
    pub buffer: Option<Handle>,
    /// The data entry that finished, for [`EventHandler::data_entry_complete`].
    pub data_entry: Option<Handle>,
    pub arrival_time: Clk27MHz,
    pub pcr: Clk27MHz,
    pub buffer_packet_number: u32,
    pub expected_cc: u8,
    pub received_cc: u8,
    pub marker_type: u8,
    pub marker_id: [u32; 2],
    /// The raw status flags.
    pub flags: u32,
}

/// Receives the events of one vDevice.
///
/// Called from the pDevice's event task. Every method defaults to doing nothing.
pub trait EventHandler: Debug + Send + Sync {
    fn buffer_overflow(&self, _event: &EventRecord) {}
    fn cc_error(&self, _event: &EventRecord) {}
    fn scramble_to_clear(&self, _event: &EventRecord) {}
    fn clear_to_scramble(&self, _event: &EventRecord) {}
    fn invalid_parameter(&self, _event: &EventRecord) {}
    fn transport_error(&self, _event: &EventRecord) {}
    fn pcr_received(&self, _event: &EventRecord) {}
    fn pes_error(&self, _event: &EventRecord) {}
    fn sections_discarded_on_crc(&self, _event: &EventRecord) {}
    fn interrupt_fail(&self, _event: &EventRecord) {}
    fn data_entry_complete(&self, _event: &EventRecord) {}
    fn marker_error(&self, _event: &EventRecord) {}
    fn invalid_secondary_pid_packet(&self, _event: &EventRecord) {}
}

/* ---------------------------------------------------------------------------------------------- */

/// PCR words as the firmware stores them: the low 32 bits of the base, then bit 32 of the base in
/// bit 0 and the extension in bits 16 to 24.
fn pcr_clock(pcr: [u32; 2]) -> Clk27MHz {
    Clk27MHz {
        div300_bit32: pcr[1] & 1,
        div300_bit31to0: pcr[0],
        modulus300: ((pcr[1] >> 16) & 0x1FF) as u16,
    }
}

impl PDeviceState {
    /// Works out who a status block is for.
    pub(crate) fn resolve_event(
        &self,
        block: &StatusBlock,
        data_entry: Option<Handle>,
    ) -> Option<(Arc<dyn EventHandler>, EventRecord)> {
        let (vdevice, vd) = match self
            .vdevices
            .iter()
            .find(|(h, _)| h.index() == u16::from(block.vdevice))
        {
            Some(found) => found,
            None => {
                debug!("Status block for unused vDevice {}", block.vdevice);
                return None;
            }
        };

        let slot = self.slot_handles.get(usize::from(block.slot_index));
        let buffer = self.buffer_handles.get(usize::from(block.dma_index));

        let record = EventRecord {
            vdevice,
            slot,
            buffer,
            data_entry,
            arrival_time: Clk27MHz::from_tag(block.arrival_time[0], block.arrival_time[1]),
            pcr: pcr_clock(block.pcr),
            buffer_packet_number: block.buffer_packet_number,
            expected_cc: block.expected_cc,
            received_cc: block.received_cc,
            marker_type: block.marker_type,
            marker_id: block.marker_id,
            flags: block.flags,
        };
        Some((Arc::clone(&vd.handler), record))
    }
}

/// Calls one handler method per event flag set in the record.
pub(crate) fn deliver(handler: &dyn EventHandler, record: &EventRecord) {
    use status_flags::*;
    let flags = record.flags;

    if flags & BUFFER_OVERFLOW != 0 {
        handler.buffer_overflow(record);
    }
    if flags & (CC_ERROR | SECONDARY_PID_CC_ERROR) != 0 {
        handler.cc_error(record);
    }
    if flags & SCRAMBLE_TOCLEAR != 0 {
        handler.scramble_to_clear(record);
    }
    if flags & CLEAR_TOSCRAMBLE != 0 {
        handler.clear_to_scramble(record);
    }
    if flags & INVALID_PARAMETER != 0 {
        handler.invalid_parameter(record);
    }
    if flags & TRANSPORT_ERROR != 0 {
        handler.transport_error(record);
    }
    if flags & PCR_RECEIVED != 0 {
        handler.pcr_received(record);
    }
    if flags & PES_ERROR != 0 {
        handler.pes_error(record);
    }
    if flags & SECTION_CRC_DISCARD != 0 {
        handler.sections_discarded_on_crc(record);
    }
    if flags & STATUS_BLK_OVERFLOW != 0 {
        handler.interrupt_fail(record);
    }
    if flags & DATA_ENTRY_COMPLETE != 0 && record.data_entry.is_some() {
        handler.data_entry_complete(record);
    }
    if flags & MARKER_ERROR != 0 {
        handler.marker_error(record);
    }
    if flags & SECONDARY_PID_DISCARDED != 0 {
        handler.invalid_secondary_pid_packet(record);
    }
}

fn dispatch(state: &RwLock<PDeviceState>, block: &StatusBlock) {
    // A finished data entry is retired before anyone hears about it, so that the next entry is
    // already loaded when the handler runs.
    let data_entry = if block.flags & status_flags::DATA_ENTRY_COMPLETE != 0 {
        match state.write().data_entry_completed(block.data_entry_slot_index) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to retire data entry of slot {}: {}", block.data_entry_slot_index, e);
                None
            }
        }
    } else {
        None
    };

    let target = state.read().resolve_event(block, data_entry);
    if let Some((handler, record)) = target {
        trace!("Delivering {:#x} to {:?}", record.flags, record.vdevice);
        deliver(&*handler, &record);
    }
}

/// Body of the per-pDevice event task.
pub(crate) fn event_task(state: Weak<RwLock<PDeviceState>>, events: Arc<MessageQueue<EventMsg>>) {
    loop {
        let block = match events.recv(Wait::Forever) {
            Ok(EventMsg::Status(block)) => block,
            Ok(EventMsg::Quit) | Err(_) => break,
        };
        match state.upgrade() {
            Some(state) => dispatch(&state, &block),
            None => break,
        }
    }
    debug!("Event task exiting");
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
