// SPDX-License-Identifier: MIT OR Apache-2.0

//! Zoning: finding the next whole unit between a buffer's read offset and its write offset.
//!
//! The firmware only advances a buffer's quantised write offset once a whole unit has been
//! written, so the bytes between the read offset and that offset are a sequence of complete units
//! whose shape depends on what fills the buffer. Each zone function here looks at the unit at the
//! read offset and returns a [`Zone`]: where the caller's data starts, how much of it there is,
//! and how many bytes after it belong to the same unit but are not returned. Reading the zone
//! leaves the read offset at `start + len + skip`, the start of the next unit.
//!
//! Nothing here changes the buffer.

/* ---------------------------------------------------------------------------------------------- */

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::hal::index::{IndexEventData, StartCode};
use crate::interface::{
    parcel, transport_index, DMA_INFO_NO_SIGNALLING, MINIMUM_SECTION_LENGTH, PES_HEADER_LENGTH,
    PES_METADATA_LENGTH, SECTION_CRC_METADATA_LENGTH, SECTION_MATCHBYTES_LENGTH,
    SECTION_SLOT_INDEX_LENGTH,
};
use crate::regions::{SharedMemory, TpRegion};
use crate::tsinput::Clk27MHz;

/* ---------------------------------------------------------------------------------------------- */

/// A PCR unit: 6 bytes of PCR followed by 6 bytes of arrival time.
pub(crate) const PCR_UNIT_SIZE: u32 = 12;

const TS_PACKET_SIZE: u32 = 188;
const TS_PAYLOAD_SIZE: u32 = 184;
const TS_SYNC_BYTE: u8 = 0x47;

/// Slot index and match bytes in front of every section.
pub(crate) const SECTION_HEADER_SIZE: u32 = SECTION_SLOT_INDEX_LENGTH + SECTION_MATCHBYTES_LENGTH;

const PARCEL_HEADER_SIZE: u32 = 2;
const INDEX_PARCEL_MIN_SIZE: u8 = 18;
const INDEX_PARCEL_MAX_SIZE: u8 = 32;

/* ---------------------------------------------------------------------------------------------- */

/// A circular buffer in DMA memory.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Ring<'a> {
    memory: &'a SharedMemory,
    size: u32,
}

impl<'a> Ring<'a> {
    pub(crate) fn new(memory: &'a SharedMemory, size: u32) -> Ring<'a> {
        Ring {
            memory,
            size: size.max(1),
        }
    }

    pub(crate) fn advance(&self, offset: u32, n: u32) -> u32 {
        ((u64::from(offset) + u64::from(n)) % u64::from(self.size)) as u32
    }

    /// Bytes from `from` up to `to`, going forwards.
    pub(crate) fn distance(&self, from: u32, to: u32) -> u32 {
        if to >= from {
            to - from
        } else {
            self.size - (from - to)
        }
    }

    fn byte(&self, offset: u32, n: u32) -> Result<u8> {
        Ok(self.memory.read_u8(u64::from(self.advance(offset, n)))?)
    }

    /// Fills `dest` from `offset` onwards, wrapping at the end of the buffer, and returns the
    /// offset just past what was read.
    pub(crate) fn read(&self, offset: u32, dest: &mut [u8]) -> Result<u32> {
        if dest.len() > self.size as usize {
            return Err(Error::BadParameter);
        }
        let offset = offset % self.size;
        let first = dest.len().min((self.size - offset) as usize);
        let (head, tail) = dest.split_at_mut(first);
        self.memory.read_bytes(u64::from(offset), head)?;
        self.memory.read_bytes(0, tail)?;
        Ok(self.advance(offset, dest.len() as u32))
    }

    fn le_u16(&self, offset: u32) -> Result<u16> {
        let mut b = [0; 2];
        self.read(offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn le_u32(&self, offset: u32) -> Result<u32> {
        let mut b = [0; 4];
        self.read(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn be_u32(&self, offset: u32) -> Result<u32> {
        let mut b = [0; 4];
        self.read(offset, &mut b)?;
        Ok(u32::from_be_bytes(b))
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// The unit at the read offset, as the part returned to the caller plus the part dropped after it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Zone {
    pub start: u32,
    pub len: u32,
    pub skip: u32,
    /// The unit did not fit and lost its tail. A read only returns a truncated unit when asked to.
    pub truncated: bool,
}

impl Zone {
    fn new(start: u32, len: u32, skip: u32) -> Zone {
        Zone {
            start,
            len,
            skip,
            truncated: false,
        }
    }

    fn truncate(&mut self, room: u32) {
        if self.len > room {
            self.skip += self.len - room;
            self.len = room;
            self.truncated = true;
        }
    }

    /// Where the next unit starts.
    pub(crate) fn end(&self, ring: &Ring<'_>) -> u32 {
        ring.advance(self.start, self.len + self.skip)
    }
}

/// As many bytes as fit, with no regard for units.
pub(crate) fn unquantised(read: u32, bytes: u32, room: u32) -> Zone {
    Zone::new(read, bytes.min(room), 0)
}

/// Units of a fixed size.
pub(crate) fn fixed(read: u32, bytes: u32, room: u32, unit: u32) -> Result<Zone> {
    if unit > bytes {
        warn!("{} bytes in buffer, less than one {} byte unit", bytes, unit);
        return Err(Error::CorruptDataInBuffer);
    }
    let mut zone = Zone::new(read, unit, 0);
    zone.truncate(room);
    Ok(zone)
}

/// Transport packets, in groups of as many packets as it takes to reach the signalling threshold.
///
/// A group that does not fit the caller's room is cut short without complaint.
pub(crate) fn raw(read: u32, bytes: u32, room: u32, packet_size: u8, threshold: u32) -> Result<Zone> {
    let packet = u32::from(packet_size).max(1);
    let unit = if threshold == DMA_INFO_NO_SIGNALLING || threshold < packet {
        packet
    } else {
        threshold - threshold % packet
    };

    let len = if unit > bytes {
        if bytes % packet != 0 {
            warn!("{} bytes in buffer is not a whole number of {} byte packets", bytes, packet);
            return Err(Error::CorruptDataInBuffer);
        }
        bytes
    } else {
        unit
    };

    let mut zone = Zone::new(read, len, 0);
    zone.truncate(room);
    zone.truncated = false;
    Ok(zone)
}

/// A section with its metadata.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SectionZone {
    pub zone: Zone,
    /// Slot index and match bytes.
    pub header: [u8; SECTION_HEADER_SIZE as usize],
    pub crc: u8,
    /// Size of the whole unit, metadata included.
    pub size: u32,
}

/// A section, preceded by its slot index and match bytes and followed by its CRC status byte.
pub(crate) fn section(ring: &Ring<'_>, read: u32, bytes: u32, room: u32) -> Result<SectionZone> {
    if bytes < SECTION_HEADER_SIZE + MINIMUM_SECTION_LENGTH + SECTION_CRC_METADATA_LENGTH {
        warn!("{} bytes in buffer, too few for a section", bytes);
        return Err(Error::CorruptDataInBuffer);
    }

    let hi = ring.byte(read, SECTION_HEADER_SIZE + 1)?;
    let lo = ring.byte(read, SECTION_HEADER_SIZE + 2)?;
    let len = ((u32::from(hi & 0x0F) << 8) | u32::from(lo)) + MINIMUM_SECTION_LENGTH;
    let size = SECTION_HEADER_SIZE + len + SECTION_CRC_METADATA_LENGTH;
    if size > bytes {
        return Err(Error::IncompleteSectionInBuffer);
    }

    let mut header = [0; SECTION_HEADER_SIZE as usize];
    ring.read(read, &mut header)?;
    let crc = ring.byte(read, SECTION_HEADER_SIZE + len)?;

    let mut zone = Zone::new(
        ring.advance(read, SECTION_HEADER_SIZE),
        len,
        SECTION_CRC_METADATA_LENGTH,
    );
    zone.truncate(room);
    Ok(SectionZone {
        zone,
        header,
        crc,
        size,
    })
}

/// What the header of a transport packet says about its payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PacketInfo {
    pub continuity_counter: u8,
    pub payload_unit_start: bool,
    pub discontinuity: bool,
}

/// The payload of the first packet that has one. Packets without payload are skipped.
pub(crate) fn partial_pes(
    ring: &Ring<'_>,
    read: u32,
    qwrite: u32,
    bytes: u32,
    room: u32,
) -> Result<(Zone, PacketInfo)> {
    if bytes < TS_PACKET_SIZE {
        return Err(Error::NoPacket);
    }
    if room < TS_PAYLOAD_SIZE {
        return Err(Error::NotEnoughRoomToReturnData);
    }

    let mut offset = read;
    for _ in 0..bytes / TS_PACKET_SIZE {
        if offset == qwrite {
            break;
        }
        if ring.byte(offset, 0)? != TS_SYNC_BYTE {
            warn!("Lost sync at offset {}", offset);
            return Err(Error::CorruptDataInBuffer);
        }

        let flags = ring.byte(offset, 3)?;
        let has_adaptation = flags & 0x20 != 0;
        let info = PacketInfo {
            continuity_counter: flags & 0x0F,
            payload_unit_start: ring.byte(offset, 1)? & 0x40 != 0,
            discontinuity: has_adaptation
                && ring.byte(offset, 5)? & transport_index::DISCONTINUITY_INDICATOR != 0,
        };

        match flags & 0x30 {
            0x10 => return Ok((Zone::new(ring.advance(offset, 4), TS_PAYLOAD_SIZE, 0), info)),
            0x30 => {
                let af_len = u32::from(ring.byte(offset, 4)?);
                if af_len + 1 < TS_PAYLOAD_SIZE {
                    let start = ring.advance(offset, af_len + 5);
                    return Ok((Zone::new(start, TS_PAYLOAD_SIZE - (af_len + 1), 0), info));
                }
                if af_len + 1 > TS_PAYLOAD_SIZE {
                    warn!("Skipping packet with adaptation field length {}", af_len);
                }
            }
            _ => trace!("Skipping packet without payload at offset {}", offset),
        }
        offset = ring.advance(offset, TS_PACKET_SIZE);
    }
    Err(Error::NoPacket)
}

/// A PES packet, found by walking back from the write offset through the marker the firmware
/// leaves after each packet, holding the offset the packet starts at.
pub(crate) fn pes(ring: &Ring<'_>, read: u32, qwrite: u32, bytes: u32, room: u32) -> Result<Zone> {
    if bytes < PES_HEADER_LENGTH + PES_METADATA_LENGTH {
        warn!("{} bytes in buffer, too few for a PES packet", bytes);
        return Err(Error::CorruptDataInBuffer);
    }

    let mut prefix = [0; 3];
    ring.read(read, &mut prefix)?;
    if prefix != [0, 0, 1] {
        warn!("No PES start code at offset {}", read);
        return Err(Error::CorruptDataInBuffer);
    }

    // Each step goes back over at least one packet header and marker.
    let max_steps = bytes / (PES_HEADER_LENGTH + PES_METADATA_LENGTH) + 1;
    let mut end = qwrite;
    let mut marker = qwrite;
    let mut steps = 0;
    while end != read {
        if steps >= max_steps {
            warn!("PES markers do not lead back to offset {}", read);
            return Err(Error::CorruptDataInBuffer);
        }
        marker = ring.advance(end, ring.size - PES_METADATA_LENGTH);
        end = ring.be_u32(marker)?;
        if end >= ring.size {
            warn!("PES marker at {} points outside the buffer ({})", marker, end);
            return Err(Error::CorruptDataInBuffer);
        }
        steps += 1;
    }

    let mut zone = Zone::new(read, ring.distance(read, marker), PES_METADATA_LENGTH);
    zone.truncate(room);
    Ok(zone)
}

/* ---------------------------------------------------------------------------------------------- */

#[derive(Clone, Copy, Debug)]
struct Parcel {
    id: u8,
    size: u8,
    payload: u32,
    next: u32,
}

/// Reads the parcel at `offset`, of the `left` bytes remaining in the buffer.
fn read_parcel(ring: &Ring<'_>, offset: u32, left: &mut u32) -> Result<Parcel> {
    if *left == 0 {
        return Err(Error::NoPacket);
    }
    if *left < PARCEL_HEADER_SIZE {
        return Err(Error::CorruptDataInBuffer);
    }
    let id = ring.byte(offset, 0)?;
    let size = ring.byte(offset, 1)?;
    let total = PARCEL_HEADER_SIZE + u32::from(size);
    if *left < total {
        warn!("Parcel {:#x} of {} bytes overruns the buffer", id, size);
        return Err(Error::CorruptDataInBuffer);
    }
    *left -= total;
    Ok(Parcel {
        id,
        size,
        payload: ring.advance(offset, PARCEL_HEADER_SIZE),
        next: ring.advance(offset, total),
    })
}

/// PCR as carried by the adaptation field: 33 bits of base, 6 reserved, 9 of extension.
fn decode_pcr(ring: &Ring<'_>, offset: u32) -> Result<Clk27MHz> {
    let mut b = [0u8; 6];
    ring.read(offset, &mut b)?;
    let [b0, b1, b2, b3, b4, b5] = b;
    let w = u32::from;
    Ok(Clk27MHz {
        div300_bit32: w(b0) >> 7,
        div300_bit31to0: (w(b0) << 25) | (w(b1) << 17) | (w(b2) << 9) | (w(b3) << 1) | (w(b4) >> 7),
        modulus300: (u16::from(b4 & 1) << 8) | u16::from(b5),
    })
}

/// An index event read from an index buffer.
#[derive(Clone, Debug)]
pub(crate) struct IndexZone {
    pub zone: Zone,
    /// The event, with slot and buffer still to be resolved from the indexes below.
    pub event: IndexEventData,
    pub slot_index: u16,
    pub buffer_index: u16,
}

/// The next index event: an event parcel together with the index parcel that follows it.
///
/// Leading index parcels left behind by an earlier read are skipped. The event is not complete
/// until its index parcel has been written; the index parcel is consumed with the event only when
/// nothing else was written between them.
pub(crate) fn index(ring: &Ring<'_>, read: u32, bytes: u32, room: u32) -> Result<IndexZone> {
    let mut left = bytes;
    let mut offset = read;

    let event = loop {
        let p = read_parcel(ring, offset, &mut left)?;
        offset = p.next;
        if p.id != parcel::INDEX {
            break p;
        }
    };

    let mut data = IndexEventData::default();
    let mut zone = match event.id {
        parcel::EVENT => {
            if event.size < 4 {
                return Err(Error::CorruptDataInBuffer);
            }
            data.event_flags = ring.le_u32(event.payload)?;
            if event.size == 4 {
                Zone::new(event.next, 0, 0)
            } else {
                Zone::new(ring.advance(event.payload, 4), u32::from(event.size) - 4, 0)
            }
        }
        parcel::ADDITIONAL_TRANSPORT_EVENT => {
            if event.size < 1 {
                return Err(Error::CorruptDataInBuffer);
            }
            data.additional_flags = ring.byte(event.payload, 0)?;
            if data.additional_flags & transport_index::PCR_FLAG != 0 && event.size >= 7 {
                data.pcr = decode_pcr(ring, ring.advance(event.payload, 1))?;
            }
            Zone::new(event.payload, u32::from(event.size), 0)
        }
        parcel::STARTCODE_EVENT => {
            if event.size < 4 {
                return Err(Error::CorruptDataInBuffer);
            }
            data.start_code = Some(StartCode {
                value: ring.byte(event.payload, 0)?,
                offset: (TS_PACKET_SIZE as u8).wrapping_sub(ring.byte(event.payload, 1)?),
                ipb: ring.byte(event.payload, 3)?,
            });
            Zone::new(ring.advance(event.payload, 2), u32::from(event.size) - 2, 0)
        }
        id => {
            warn!("Unknown parcel {:#x} in index buffer", id);
            return Err(Error::CorruptDataInBuffer);
        }
    };
    zone.truncate(room);

    let mut immediate = true;
    let index = loop {
        let p = read_parcel(ring, offset, &mut left)?;
        offset = p.next;
        if p.id == parcel::INDEX {
            break p;
        }
        immediate = false;
    };
    if index.size < INDEX_PARCEL_MIN_SIZE || index.size > INDEX_PARCEL_MAX_SIZE {
        warn!("Index parcel of {} bytes", index.size);
        return Err(Error::CorruptDataInBuffer);
    }

    let p = index.payload;
    let arrival0 = ring.le_u32(p)?;
    let arrival1 = u32::from(ring.le_u16(ring.advance(p, 4))?);
    data.arrival_time = Clk27MHz {
        div300_bit32: (arrival1 & 0x200) >> 9,
        div300_bit31to0: ((arrival1 & 0x1FF) << 23) | (arrival0 >> 9),
        modulus300: (arrival0 & 0x1FF) as u16,
    };
    let buffer_index = ring.le_u16(ring.advance(p, 6))?;
    let slot_index = ring.le_u16(ring.advance(p, 8))?;
    data.buffer_packet_count = ring.le_u32(ring.advance(p, 10))?;
    data.buffer_offset = ring.le_u32(ring.advance(p, 14))?;

    if immediate {
        zone.skip += PARCEL_HEADER_SIZE + u32::from(index.size);
    }
    Ok(IndexZone {
        zone,
        event: data,
        slot_index,
        buffer_index,
    })
}

/// Counts the events in an index buffer, and the bytes of event data they would return.
pub(crate) fn index_units(ring: &Ring<'_>, read: u32, bytes: u32) -> (u32, u32) {
    let mut left = bytes;
    let mut offset = read;
    let mut units = 0;
    let mut extra = 0;

    while let Ok(p) = read_parcel(ring, offset, &mut left) {
        offset = p.next;
        let size = u32::from(p.size);
        match p.id {
            parcel::EVENT => {
                units += 1;
                extra += size.saturating_sub(4);
            }
            parcel::ADDITIONAL_TRANSPORT_EVENT => {
                units += 1;
                extra += size;
            }
            parcel::STARTCODE_EVENT => {
                units += 1;
                extra += size.saturating_sub(2);
            }
            _ => {}
        }
    }
    (units, extra)
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
