// SPDX-License-Identifier: MIT OR Apache-2.0

//! The shared-memory interface between the host and the transport processor firmware.
//!
//! The firmware owns a region of memory ("dDEM") that starts with an [`InterfaceBlock`]. The
//! block holds the initialisation parameters supplied by the host, the firmware version and layout
//! checksum, and a table of pointers (expressed as byte offsets into dDEM) to every other table:
//! slot information, DMA records, indexers, filter CAM, status blocks, and so on.
//!
//! Every record here is a view declared with [`tp_struct!`](crate::tp_struct), so field offsets
//! match the firmware's C layout byte for byte. [`Tp`] ties the views together once the pointer
//! table has been read into a [`TpLayout`].

/* ---------------------------------------------------------------------------------------------- */

use std::io::{self, ErrorKind};
use std::sync::Arc;

use crate::regions::structured::{TpArray, TpRegisterRw, TpRwArray, TpStruct};
use crate::regions::{AsTpSubregion, BackedByTpSubregion, SharedMemory, TpRegion};
use crate::tp_struct;

/* ---------------------------------------------------------------------------------------------- */

/// Firmware version this host is built against. Only the first 6 characters are compared.
pub const TP_VERSION_ID: &str = "01022501_TP_VERSION";

/// Number of version characters that must match.
pub const TP_VERSION_SIGNIFICANT_CHARS: usize = 6;

pub const MAX_CHAINED_SLOTS: usize = 8;
pub const MAX_NUMBER_OF_VDEVICES: u32 = 16;
pub const MAX_FILTERS_PER_VDEVICE: u32 = 64;
pub const SIGNALLING_QUEUE_LENGTH: usize = 256;

/// Playback channels addressable through the completion bits of the TP-to-host mailbox.
pub const NUMBER_OF_PLAYBACK_CHANNELS: u32 = 11;

/// Playback channels the start and stop bits of the host-to-TP mailbox can name.
pub const NUMBER_OF_STARTABLE_PLAYBACK_CHANNELS: u32 = 7;

/// Value of the `ActivityCounter` written before the firmware is started.
pub const ACTIVITY_COUNTER_RESET: u32 = 0xF000_0000;

pub const SYNC_TP_SLOT_WAIT: u16 = 0xFFFE;
pub const SYNC_TP_SYNCHRONISED: u16 = 0xFFFF;

/// Values of `pDeviceInfo.SyncTPClearEntry`.
pub mod sync_clear {
    pub const DONE: u32 = 0x0000_0000;
    pub const WAITING: u32 = 0xC000_0000;
    pub const CLEAR_SLOT: u32 = 0x8000_0000;
    pub const CLEAR_VDEVICE: u32 = 0x4000_0000;
    pub const DATA_MASK: u32 = 0x0000_FFFF;
}

/// Bits of `StatusBlk.Flags` (also used as event masks).
pub mod status_flags {
    pub const CC_ERROR: u32 = 0x0000_0001;
    pub const INVALID_PARAMETER: u32 = 0x0000_0002;
    pub const TRANSPORT_ERROR: u32 = 0x0000_0004;
    pub const PUSI: u32 = 0x0000_0008;
    pub const SCRAMBLE_TOEVEN: u32 = 0x0000_0010;
    pub const SCRAMBLE_TOODD: u32 = 0x0000_0020;
    pub const SCRAMBLE_TOCLEAR: u32 = 0x0000_0040;
    pub const CLEAR_TOSCRAMBLE: u32 = 0x0000_0080;
    pub const PES_PTS: u32 = 0x0000_0100;
    pub const SECONDARY_PID_DISCARDED: u32 = 0x0000_0400;
    pub const SECONDARY_PID_CC_ERROR: u32 = 0x0000_0800;
    pub const PCR_RECEIVED: u32 = 0x0000_1000;
    pub const DISCONTINUITY: u32 = 0x0000_2000;
    pub const MARKER_ERROR: u32 = 0x0000_4000;
    pub const PES_ERROR: u32 = 0x0001_0000;
    pub const SECTION_CRC_DISCARD: u32 = 0x0002_0000;
    pub const STATUS_BLK_OVERFLOW: u32 = 0x0004_0000;
    pub const BUFFER_OVERFLOW: u32 = 0x0008_0000;
    pub const DATA_ENTRY_COMPLETE: u32 = 0x0010_0000;
    pub const FIRST_RECORD_PKT: u32 = 0x0020_0000;
}

/// Default event masks derived from the per-event properties.
pub mod event_mask {
    use super::status_flags::*;

    /// Events that must be enabled on the slot to be raised.
    pub const SLOT_ENABLED: u32 = SCRAMBLE_TOCLEAR | CLEAR_TOSCRAMBLE | PCR_RECEIVED;

    /// Events that must be enabled on the vDevice to be raised.
    pub const VDEVICE_ENABLED: u32 = CC_ERROR
        | INVALID_PARAMETER
        | TRANSPORT_ERROR
        | SCRAMBLE_TOCLEAR
        | CLEAR_TOSCRAMBLE
        | PES_ERROR
        | SECTION_CRC_DISCARD
        | STATUS_BLK_OVERFLOW
        | BUFFER_OVERFLOW
        | DATA_ENTRY_COMPLETE
        | MARKER_ERROR
        | SECONDARY_PID_DISCARDED
        | SECONDARY_PID_CC_ERROR;

    /// Events raised on the first slot of a chain only.
    pub const ONCE_PER_PKT: u32 =
        CC_ERROR | INVALID_PARAMETER | TRANSPORT_ERROR | SECONDARY_PID_DISCARDED | SECONDARY_PID_CC_ERROR;

    /// Events that stay enabled after being raised.
    pub const PERSISTENT: u32 =
        SCRAMBLE_TOCLEAR | CLEAR_TOSCRAMBLE | PCR_RECEIVED | DATA_ENTRY_COMPLETE | MARKER_ERROR;

    pub const ALL: u32 = SLOT_ENABLED | VDEVICE_ENABLED;
}

/// `vDeviceInfo.mode`.
pub mod vdevice_mode {
    pub const DVB: u16 = 1;
    pub const BD: u16 = 4;
}

/// `vDeviceInfo.flags`.
pub mod vdevice_flags {
    pub const RAW_SLOT_INDEXES: u32 = 0x1;
    pub const DISABLE_RAW_SLOT_DMA: u32 = 0x2;
    pub const DISCARD_DUPLICATE_PKTS: u32 = 0x4;
}

/// `SlotInfo.slot_state`.
pub mod slot_state {
    pub const CC_MASK: u16 = 0x000F;
    pub const CC_VALID: u16 = 0x0010;
    pub const CC_DUPLICATE_REJECTED: u16 = 0x0020;
    pub const TS_SC_MASK: u16 = 0x00C0;
    pub const TS_SC_OFFSET: u16 = 6;
    pub const PES_SC_MASK: u16 = 0x0300;
    pub const PES_SC_OFFSET: u16 = 8;
    pub const TS_SC_NOT_SYNCED: u16 = 0x0400;
    pub const SEC_SC_MASK: u16 = 0x3000;
    pub const CC_RESET_MASK: u16 = 0xFFC0;
}

/// `SlotInfo.slot_mode`, the firmware's view of a slot type.
pub mod slot_mode {
    pub const NULL: u8 = 0;
    pub const SECTION: u8 = 1;
    pub const PES: u8 = 2;
    pub const RAW: u8 = 3;
    pub const PCR: u8 = 4;
    pub const EMM: u8 = 5;
    pub const ECM: u8 = 6;
    pub const ES: u8 = 7;
    pub const SCD: u8 = 8;
}

/// `SlotInfo.slot_flags`.
pub mod slot_flags {
    pub const SUPPRESS_CC: u16 = 0x0001;
    pub const SUPPRESS_METADATA: u16 = 0x0002;
    pub const NO_WINDBACK: u16 = 0x0004;
    pub const OUTPUT_SCR: u16 = 0x0010;
    pub const PREFIX_DNLA: u16 = 0x0040;
    pub const ENTRY_REPLACEMENT: u16 = 0x0080;
    pub const ENTRY_INSERTION: u16 = 0x0100;
    pub const SW_CD_FIFO: u16 = 0x0200;
    pub const CC_FIXUP: u16 = 0x0400;
    pub const COUNT_METADATA: u16 = 0x0800;
}

/// `DataEntryInfo.state`.
pub mod data_entry_state {
    pub const EMPTY: u8 = 0;
    pub const LOADED: u8 = 1;
    pub const PROCESSING: u8 = 2;
    pub const COMPLETE: u8 = 4;
}

/// Repeat count meaning "until replaced".
pub const DATA_ENTRY_REPEAT_FOREVER: u16 = 0x8000;

pub const DMA_INFO_NO_SIGNALLING: u32 = 0x7FFF_FFFF;
pub const DMA_INFO_ALLOW_OVERFLOW: u32 = 0x8000_0000;

/// Per-DMA overflow flag bytes.
pub mod dma_overflow {
    pub const MARK_OVERFLOWED_OVERWRITE: u8 = 0x01;
    pub const MARK_OVERFLOWED_DISCARD: u8 = 0x02;
    pub const MARK_RESET_OVERFLOW: u8 = 0x04;
}

/// `Playback.injection_flags`.
pub mod injection_flags {
    pub const EXCLUDES_TAGS: u32 = 0x0000_0001;
    pub const INCLUDES_DLNA_TAGS: u32 = 0x0000_0002;
    pub const DISCARD_PREVIOUS_PARTIAL_PKT: u32 = 0x8000_0000;
}

/// `Playback.tag_header0` bit saying the low bits name the destination vDevice.
pub const PLAYBACK_TAG_IS_VDEVICE_INDEX: u32 = 0x8000;

/// Parcel identifiers found in index buffers.
pub mod parcel {
    pub const EVENT: u8 = 0x00;
    pub const ADDITIONAL_TRANSPORT_EVENT: u8 = 0x01;
    pub const STARTCODE_EVENT: u8 = 0x02;
    pub const INDEX: u8 = 0x20;

    pub const OUTPUT_EVENT: u32 = 1 << EVENT;
    pub const OUTPUT_ADDITIONAL_TRANSPORT_EVENT: u32 = 1 << ADDITIONAL_TRANSPORT_EVENT;
    pub const OUTPUT_START_CODE_EVENT: u32 = 1 << STARTCODE_EVENT;

    /// `IndexerInfo.indexer_config`.
    pub const OUTPUT_REF_PUSI: u32 = 0x1;
}

/// Adaptation field flags an indexer can trigger on.
pub mod transport_index {
    pub const DISCONTINUITY_INDICATOR: u8 = 0x80;
    pub const RANDOM_ACCESS_INDICATOR: u8 = 0x40;
    pub const PRIORITY_INDICATOR: u8 = 0x20;
    pub const PCR_FLAG: u8 = 0x10;
    pub const OPCR_FLAG: u8 = 0x08;
    pub const SPLICING_POINT_FLAG: u8 = 0x04;
    pub const PRIVATE_DATA_FLAG: u8 = 0x02;
    pub const ADAPTION_EXTENSION_FLAG: u8 = 0x01;
}

/// `section_params` of a section slot.
pub mod section_params {
    pub const SHORT: u8 = 0x00;
    pub const LONG: u8 = 0x01;
    pub const PNMM: u8 = 0x02;
    pub const INVALID: u8 = 0x03;
    pub const TINY: u8 = 0x04;
    pub const PROPRIETARY: u8 = 0x08;
    pub const NONE: u8 = 0xFF;
}

/// `filter_flags` of a section slot.
pub mod filter_flags {
    pub const DISCARD_ON_CRC_ERROR: u8 = 0x01;
    pub const DISCARD_DUPLICATE_TIDS: u8 = 0x02;
}

/// `SlotInfo.secondary_pid_info`.
pub mod secondary_pid {
    pub const SUBSTITUTION: u16 = 0x0400;
    pub const INSERTION: u16 = 0x0800;
    pub const INSERTDELETE: u16 = 0x1000;
    pub const MODE_MASK: u16 = 0x1C00;
    pub const SECONDARY_SLOT: u16 = 0x4000;
    pub const PRIMARY_SLOT: u16 = 0x8000;
    pub const ENABLED_MASK: u16 = 0xC000;
    pub const SLOT_INDEX_MASK: u16 = 0x03FF;
}

pub const SECTION_CRC_METADATA_LENGTH: u32 = 1;
pub const MINIMUM_SECTION_LENGTH: u32 = 3;
pub const SECTION_SLOT_INDEX_LENGTH: u32 = 1;
pub const SECTION_MATCHBYTES_LENGTH: u32 = 8;
pub const PES_METADATA_LENGTH: u32 = 4;
pub const PES_HEADER_LENGTH: u32 = 6;

/// `InterfaceBlock.FirmwareConfig`.
pub mod firmware_config {
    pub const TIMER_COUNTER_MASK: u32 = 0x0000_000F;
    pub const RESET_SHARED_MEMORY: u32 = 0x0000_0010;
    pub const ALLOW_POWERDOWN: u32 = 0x0000_0020;
    pub const BYPASS_SECURE_COPRO: u32 = 0x0000_0040;
    pub const USE_TIMER_COUNTER: u32 = 0x0000_0080;
}

/// Host-to-TP mailbox bits.
pub mod mailbox_h2tp {
    pub const PRINTF_COMPLETE: u32 = 0x8000_0000;
    pub const STOP_PLAYBACK: u32 = 0x0100_0000;
    pub const START_PLAYBACK: u32 = 0x0001_0000;
    pub const SUPPLYING_INIT_PARAMS: u32 = 0x0000_8000;
    pub const UPDATING_NEW_PID_TABLE: u32 = 0x0000_0100;
    pub const STOP_LIVE: u32 = 0x0000_0010;
    pub const START_LIVE: u32 = 0x0000_0001;
}

/// TP-to-host mailbox bits.
pub mod mailbox_tp2h {
    pub const PRINTF_WAITING: u32 = 0x8000_0000;
    pub const PLAYBACK_COMPLETION_MASK: u32 = 0x0001_FFC0;
    pub const PLAYBACK_COMPLETION_OFFSET: u32 = 6;
    pub const STOP_STFE_FLUSH: u32 = 0x0000_0020;
    pub const START_STFE_FLUSH: u32 = 0x0000_0010;
    pub const STATUS_BLOCK_OVERFLOW: u32 = 0x0000_0008;
    pub const STATUS_BLOCK_SIGNALLED: u32 = 0x0000_0004;
    pub const BUFFER_SIGNALLED: u32 = 0x0000_0002;
    pub const ACK: u32 = 0x0000_0001;
}

/// The PES marker template the host loads into every marker buffer at initialisation.
pub const PES_MARKER_INIT_DATA: [u8; 26] = [
    0x00, 0x00, 0x01, 0xFB, 0x00, 0x14, 0x80, 0x01, 0x11, 0x80, 0x53, 0x54, 0x4D, 0x4D, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/* ---------------------------------------------------------------------------------------------- */

tp_struct! {
    /// `stptiTP_Interface_t`: lives at offset 0 of dDEM.
    pub struct InterfaceBlock<'a> : 424 {
        debug_scratch               @ 0..16     : TpRwArray<'a, u32>,
        version                     @ 16..24    : TpRwArray<'a, u8>,
        checksum                    @ 24        : TpRegisterRw<'a, u32>,
        activity_counter            @ 28        : TpRegisterRw<'a, u32>,
        waiting_on_streamer         @ 32        : TpRegisterRw<'a, u8>,
        timer_counter               @ 33        : TpRegisterRw<'a, u8>,
        output_debug_level          @ 34        : TpRegisterRw<'a, u8>,
        trigger                     @ 35        : TpRegisterRw<'a, u8>,
        number_of_vdevices          @ 36        : TpRegisterRw<'a, u32>,
        number_of_pids              @ 40        : TpRegisterRw<'a, u32>,
        number_of_slots             @ 44        : TpRegisterRw<'a, u32>,
        number_of_section_filters   @ 48        : TpRegisterRw<'a, u32>,
        number_of_dma_structures    @ 52        : TpRegisterRw<'a, u32>,
        number_of_indexers          @ 56        : TpRegisterRw<'a, u32>,
        number_of_status_blks       @ 60        : TpRegisterRw<'a, u32>,
        slow_rate_stream_timeout    @ 64        : TpRegisterRw<'a, u32>,
        firmware_config             @ 68        : TpRegisterRw<'a, u32>,
        number_of_live_channels     @ 72        : TpRegisterRw<'a, u32>,
        number_of_pes_markers       @ 76        : TpRegisterRw<'a, u32>,
        size_of_cam                 @ 80        : TpRegisterRw<'a, u32>,
        size_of_pid_table_region    @ 84        : TpRegisterRw<'a, u32>,
        size_of_shared_memory_region @ 88       : TpRegisterRw<'a, u32>,
        /// The pointer table, from `SharedMemory_p` to `StatusBlk_p`, as dDEM offsets.
        pointers                    @ 92..168   : TpRwArray<'a, u32>,
        debug_buffer                @ 168..424  : TpRwArray<'a, u8>,
    }

    /// `stptiTP_Live_t`
    pub struct Live<'a> : 16 {
        channel             @ 0  : TpRegisterRw<'a, u32>,
        buffer_base         @ 4  : TpRegisterRw<'a, u32>,
        buffer_size_in_pkts @ 8  : TpRegisterRw<'a, u32>,
        packet_len          @ 12 : TpRegisterRw<'a, u32>,
    }

    /// `stptiTP_Playback_t`
    pub struct Playback<'a> : 40 {
        channel         @ 0  : TpRegisterRw<'a, u32>,
        buffer_base     @ 4  : TpRegisterRw<'a, u32>,
        num_of_bytes    @ 8  : TpRegisterRw<'a, u32>,
        next_node       @ 12 : TpRegisterRw<'a, u32>,
        packet_len      @ 16 : TpRegisterRw<'a, u32>,
        injection_flags @ 20 : TpRegisterRw<'a, u32>,
        tag_header0     @ 24 : TpRegisterRw<'a, u32>,
        tag_header1     @ 28 : TpRegisterRw<'a, u32>,
        ctrl            @ 32 : TpRegisterRw<'a, u16>,
        key_index       @ 34 : TpRegisterRw<'a, u16>,
        checksum        @ 36 : TpRegisterRw<'a, u32>,
    }

    /// `stptiTP_pDeviceInfo_t`
    pub struct PDeviceInfo<'a> : 336 {
        status_blk_wr                   @ 0  : TpRegisterRw<'a, u32>,
        status_blk_rd                   @ 4  : TpRegisterRw<'a, u32>,
        signalling_queue_rd             @ 8  : TpRegisterRw<'a, u8>,
        signalling_queue_wr             @ 9  : TpRegisterRw<'a, u8>,
        sync_tp                         @ 10 : TpRegisterRw<'a, u16>,
        sync_tp_clear_entry             @ 16 : TpRegisterRw<'a, u32>,
        reset_idle_counters             @ 20 : TpRegisterRw<'a, u8>,
        debug_clp                       @ 24 : TpRegisterRw<'a, u32>,
        idle_count                      @ 28 : TpRegisterRw<'a, u32>,
        not_idle                        @ 32 : TpRegisterRw<'a, u32>,
        avg_idle                        @ 36 : TpRegisterRw<'a, u32>,
        avg_not_idle                    @ 40 : TpRegisterRw<'a, u32>,
        start_flush_stfe                @ 44 : TpRegisterRw<'a, u32>,
        stop_flush_stfe                 @ 48 : TpRegisterRw<'a, u32>,
        sw_leaky_pid_channels           @ 52 : TpRegisterRw<'a, u32>,
        packets_pre_header_processing   @ 56 : TpRegisterRw<'a, u32>,
        packets_with_sync_error         @ 60 : TpRegisterRw<'a, u32>,
        packets_pushed_to_sp            @ 64 : TpRegisterRw<'a, u32>,
        push_failures_to_sp             @ 68 : TpRegisterRw<'a, u32>,
        packets_pulled_from_sp          @ 72 : TpRegisterRw<'a, u32>,
        pid_table_base                  @ 76 : TpRegisterRw<'a, u32>,
        /// Buffer indexes that crossed their signalling threshold.
        signalling_queue                @ 80..336 : TpRwArray<'a, u8>,
    }

    /// `stptiTP_DataEntryInfo_t`, embedded in vDevice and RAW slot records.
    pub struct DataEntryInfo<'a> : 12 {
        addr       @ 0  : TpRegisterRw<'a, u32>,
        state      @ 4  : TpRegisterRw<'a, u8>,
        from_byte  @ 5  : TpRegisterRw<'a, u8>,
        size       @ 6  : TpRegisterRw<'a, u16>,
        slot_index @ 8  : TpRegisterRw<'a, u16>,
        count      @ 10 : TpRegisterRw<'a, u16>,
    }

    /// `stptiTP_vDeviceInfo_t`
    pub struct VDeviceInfo<'a> : 80 {
        input_packet_count  @ 0  : TpRegisterRw<'a, u32>,
        sync_err            @ 4  : TpRegisterRw<'a, u32>,
        ts_err              @ 8  : TpRegisterRw<'a, u32>,
        pid_mismatch        @ 12 : TpRegisterRw<'a, u32>,
        cc_err              @ 16 : TpRegisterRw<'a, u32>,
        buf_overflow        @ 20 : TpRegisterRw<'a, u32>,
        pes_hdr_err         @ 24 : TpRegisterRw<'a, u32>,
        stream_tag          @ 28 : TpRegisterRw<'a, u16>,
        pid_filter_base     @ 30 : TpRegisterRw<'a, u16>,
        pid_filter_size     @ 32 : TpRegisterRw<'a, u16>,
        mode                @ 34 : TpRegisterRw<'a, u16>,
        stc_word0           @ 36 : TpRegisterRw<'a, u32>,
        stc_word1           @ 40 : TpRegisterRw<'a, u32>,
        event_mask          @ 44 : TpRegisterRw<'a, u32>,
        flags               @ 48 : TpRegisterRw<'a, u32>,
        wildcard_slot_index @ 52 : TpRegisterRw<'a, u16>,
        use_tcu             @ 54 : TpRegisterRw<'a, u16>,
        data_entry          @ 56..68 : DataEntryInfo<'a>,
    }

    /// `stptiTP_SlotInfo_t`, with the mode-specific union flattened into prefixed accessors.
    pub struct SlotInfo<'a> : 64 {
        slot_state                  @ 0  : TpRegisterRw<'a, u16>,
        remaining_pes_header_length @ 2  : TpRegisterRw<'a, u8>,
        slot_mode                   @ 3  : TpRegisterRw<'a, u8>,
        secondary_pid_info          @ 4  : TpRegisterRw<'a, u16>,
        slot_flags                  @ 6  : TpRegisterRw<'a, u16>,
        next_slot                   @ 8  : TpRegisterRw<'a, u16>,
        key_index                   @ 10 : TpRegisterRw<'a, u16>,
        event_mask                  @ 12 : TpRegisterRw<'a, u32>,
        indexer                     @ 16 : TpRegisterRw<'a, u16>,
        dma_record                  @ 18 : TpRegisterRw<'a, u16>,
        packet_count                @ 20 : TpRegisterRw<'a, u32>,

        /// Bitmask of CAM filters (one bit per vDevice filter) enabled on a section slot.
        section_filters_associated  @ 24 : TpRegisterRw<'a, u64>,
        section_tiny_data           @ 24 : TpRegisterRw<'a, u16>,
        section_tiny_mask           @ 26 : TpRegisterRw<'a, u16>,
        section_tiny_anymatch       @ 28 : TpRegisterRw<'a, u16>,
        section_proprietary_index   @ 24 : TpRegisterRw<'a, u32>,
        section_params              @ 32 : TpRegisterRw<'a, u8>,
        section_filter_flags        @ 33 : TpRegisterRw<'a, u8>,
        section_stage               @ 34 : TpRegisterRw<'a, u8>,
        section_crc_mode            @ 35 : TpRegisterRw<'a, u8>,

        pes_state                   @ 24 : TpRegisterRw<'a, u8>,
        pes_remain_len              @ 26 : TpRegisterRw<'a, u16>,
        pes_marker_index            @ 28 : TpRegisterRw<'a, u8>,
        pes_streamid_filterdata     @ 36 : TpRegisterRw<'a, u8>,

        scd_stage                   @ 24 : TpRegisterRw<'a, u32>,
        scd_valid                   @ 28 : TpRegisterRw<'a, u32>,
        scd_state                   @ 32 : TpRegisterRw<'a, u8>,

        raw_corruption_offset       @ 24 : TpRegisterRw<'a, u8>,
        raw_corruption_value        @ 25 : TpRegisterRw<'a, u8>,
        raw_sc_remap                @ 26 : TpRegisterRw<'a, u8>,
        raw_cc_fixup                @ 27 : TpRegisterRw<'a, u8>,
        raw_remap_pid               @ 28 : TpRegisterRw<'a, u16>,
        raw_data_entry              @ 32..44 : DataEntryInfo<'a>,
        raw_indexer_state           @ 44 : TpRegisterRw<'a, u32>,

        /// The whole mode-specific area, for resetting it in one go.
        mode_area                   @ 24..64 : TpRwArray<'a, u32>,
    }

    /// `stptiTP_DMAInfo_t`
    pub struct DmaInfo<'a> : 32 {
        base                  @ 0  : TpRegisterRw<'a, u32>,
        size                  @ 4  : TpRegisterRw<'a, u32>,
        read_offset           @ 8  : TpRegisterRw<'a, u32>,
        write_offset          @ 12 : TpRegisterRw<'a, u32>,
        qwrite_offset_pending @ 16 : TpRegisterRw<'a, u32>,
        qwrite_offset         @ 20 : TpRegisterRw<'a, u32>,
        signal_threshold      @ 24 : TpRegisterRw<'a, u32>,
        buffer_unit_count     @ 28 : TpRegisterRw<'a, u32>,
    }

    /// `stptiTP_IndexerInfo_t`
    pub struct IndexerInfo<'a> : 64 {
        parcel_selection                @ 0  : TpRegisterRw<'a, u32>,
        indexer_config                  @ 4  : TpRegisterRw<'a, u32>,
        index_on_event_mask             @ 8  : TpRegisterRw<'a, u32>,
        additional_transport_index_mask @ 12 : TpRegisterRw<'a, u8>,
        output_dma_record               @ 14 : TpRegisterRw<'a, u16>,
        mpeg_sc_mask                    @ 16..48 : TpRwArray<'a, u32>,
        index_count                     @ 48 : TpRegisterRw<'a, u32>,
        next_chained_indexer            @ 52 : TpRegisterRw<'a, u16>,
    }

    /// `stptiTP_CamTable_t`, one per vDevice.
    pub struct CamTable<'a> : 112 {
        filter_cam_offset   @ 0  : TpRegisterRw<'a, u32>,
        one_shot_mask       @ 8  : TpRegisterRw<'a, u64>,
        force_crc_mask      @ 16 : TpRegisterRw<'a, u64>,
        pnmm_not_lmm_mask   @ 24 : TpRegisterRw<'a, u64>,
        not_match_value     @ 32..96  : TpRwArray<'a, u8>,
        not_match_control   @ 96..112 : TpRwArray<'a, u64>,
    }

    /// `stptiTP_ProprietaryFilter_t`: an opaque blob owned by a CA vendor.
    pub struct ProprietaryFilter<'a> : 80 {
        data @ 0..80 : TpRwArray<'a, u8>,
    }

    /// `marker_data_t`
    pub struct MarkerData<'a> : 28 {
        allocated  @ 0 : TpRegisterRw<'a, u8>,
        next_index @ 1 : TpRegisterRw<'a, u8>,
        data       @ 2..28 : TpRwArray<'a, u8>,
    }

    /// `stptiTP_StatusBlk_t`
    pub struct StatusBlk<'a> : 44 {
        flags                 @ 0  : TpRegisterRw<'a, u32>,
        slot_index            @ 4  : TpRegisterRw<'a, u16>,
        dma_index             @ 6  : TpRegisterRw<'a, u16>,
        arrival_time0         @ 8  : TpRegisterRw<'a, u32>,
        arrival_time1         @ 12 : TpRegisterRw<'a, u32>,
        pcr0                  @ 16 : TpRegisterRw<'a, u32>,
        pcr1                  @ 20 : TpRegisterRw<'a, u32>,
        buffer_packet_number  @ 24 : TpRegisterRw<'a, u32>,
        /// Expected CC in the low nibble, received CC in the high nibble.
        cc                    @ 28 : TpRegisterRw<'a, u8>,
        vdevice               @ 29 : TpRegisterRw<'a, u8>,
        data_entry_slot_index @ 30 : TpRegisterRw<'a, u16>,
        marker_type           @ 32 : TpRegisterRw<'a, u8>,
        marker_id0            @ 36 : TpRegisterRw<'a, u32>,
        marker_id1            @ 40 : TpRegisterRw<'a, u32>,
    }
}

/// Size of the section variant of the `SlotInfo` union.
const SECTION_INFO_SIZE: u64 = 40;

const fn size_of<T: TpStruct>() -> u64 {
    T::SIZE
}

/// Guards against the host and the firmware disagreeing on structure layouts.
pub const SHARED_MEMORY_INTERFACE_CHECKSUM: u32 = (size_of::<InterfaceBlock<'static>>()
    ^ (size_of::<Live<'static>>() << 1)
    ^ (size_of::<Playback<'static>>() << 2)
    ^ (size_of::<PDeviceInfo<'static>>() << 3)
    ^ (size_of::<VDeviceInfo<'static>>() << 4)
    ^ (size_of::<SlotInfo<'static>>() << 5)
    ^ (size_of::<CamTable<'static>>() << 6)
    ^ (size_of::<IndexerInfo<'static>>() << 7)
    ^ (size_of::<ProprietaryFilter<'static>>() << 8)
    ^ (SECTION_INFO_SIZE << 9)
    ^ (size_of::<DmaInfo<'static>>() << 10)
    ^ (size_of::<MarkerData<'static>>() << 11)
    ^ (size_of::<StatusBlk<'static>>() << 12)) as u32;

/* ---------------------------------------------------------------------------------------------- */

/// A status block copied out of shared memory, as queued for the event task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusBlock {
    pub flags: u32,
    pub slot_index: u16,
    pub dma_index: u16,
    pub arrival_time: [u32; 2],
    pub pcr: [u32; 2],
    pub buffer_packet_number: u32,
    pub expected_cc: u8,
    pub received_cc: u8,
    pub vdevice: u8,
    pub data_entry_slot_index: u16,
    pub marker_type: u8,
    pub marker_id: [u32; 2],
}

impl StatusBlock {
    pub fn read_from(blk: &StatusBlk<'_>) -> io::Result<StatusBlock> {
        let cc = blk.cc().read()?;
        Ok(StatusBlock {
            flags: blk.flags().read()?,
            slot_index: blk.slot_index().read()?,
            dma_index: blk.dma_index().read()?,
            arrival_time: [blk.arrival_time0().read()?, blk.arrival_time1().read()?],
            pcr: [blk.pcr0().read()?, blk.pcr1().read()?],
            buffer_packet_number: blk.buffer_packet_number().read()?,
            expected_cc: cc & 0x0F,
            received_cc: cc >> 4,
            vdevice: blk.vdevice().read()?,
            data_entry_slot_index: blk.data_entry_slot_index().read()?,
            marker_type: blk.marker_type().read()?,
            marker_id: [blk.marker_id0().read()?, blk.marker_id1().read()?],
        })
    }

    pub fn write_to(&self, blk: &StatusBlk<'_>) -> io::Result<()> {
        blk.slot_index().write(self.slot_index)?;
        blk.dma_index().write(self.dma_index)?;
        blk.arrival_time0().write(self.arrival_time[0])?;
        blk.arrival_time1().write(self.arrival_time[1])?;
        blk.pcr0().write(self.pcr[0])?;
        blk.pcr1().write(self.pcr[1])?;
        blk.buffer_packet_number().write(self.buffer_packet_number)?;
        blk.cc().write((self.expected_cc & 0x0F) | (self.received_cc << 4))?;
        blk.vdevice().write(self.vdevice)?;
        blk.data_entry_slot_index().write(self.data_entry_slot_index)?;
        blk.marker_type().write(self.marker_type)?;
        blk.marker_id0().write(self.marker_id[0])?;
        blk.marker_id1().write(self.marker_id[1])?;
        blk.flags().write(self.flags)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// The initialisation parameters and pointer table of a running firmware, read once after the
/// firmware acknowledged its initialisation parameters.
///
/// Pointers are byte offsets into dDEM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TpLayout {
    pub number_of_vdevices: u32,
    pub number_of_pids: u32,
    pub number_of_slots: u32,
    pub number_of_section_filters: u32,
    pub number_of_dma_structures: u32,
    pub number_of_indexers: u32,
    pub number_of_status_blks: u32,
    pub number_of_live_channels: u32,
    pub number_of_pes_markers: u32,
    pub size_of_cam: u32,
    pub size_of_pid_table_region: u32,
    pub size_of_shared_memory_region: u32,

    pub shared_memory: u32,
    pub live: u32,
    pub playback: u32,
    pub stream_availability: u32,
    pub pdevice_info: u32,
    pub vdevice_info: u32,
    pub pid_table_region: u32,
    pub pid_table: u32,
    pub pid_slot_mapping_table: u32,
    pub slot_info: u32,
    pub dma_info: u32,
    pub indexer_info: u32,
    pub filter_cam_region: u32,
    pub filter_cam_tables: u32,
    pub proprietary_filters: u32,
    pub pes_marker_buffers: u32,
    pub dma_overflow_flags: u32,
    pub dma_pointers: u32,
    pub status_blk: u32,
}

impl TpLayout {
    /// Number of entries in the pointer table.
    pub const POINTER_COUNT: usize = 19;

    pub fn read(interface: &InterfaceBlock<'_>) -> io::Result<TpLayout> {
        let p = interface.pointers().read_all()?;
        if p.len() != Self::POINTER_COUNT {
            return Err(io::Error::new(ErrorKind::InvalidData, "Truncated pointer table"));
        }

        Ok(TpLayout {
            number_of_vdevices: interface.number_of_vdevices().read()?,
            number_of_pids: interface.number_of_pids().read()?,
            number_of_slots: interface.number_of_slots().read()?,
            number_of_section_filters: interface.number_of_section_filters().read()?,
            number_of_dma_structures: interface.number_of_dma_structures().read()?,
            number_of_indexers: interface.number_of_indexers().read()?,
            number_of_status_blks: interface.number_of_status_blks().read()?,
            number_of_live_channels: interface.number_of_live_channels().read()?,
            number_of_pes_markers: interface.number_of_pes_markers().read()?,
            size_of_cam: interface.size_of_cam().read()?,
            size_of_pid_table_region: interface.size_of_pid_table_region().read()?,
            size_of_shared_memory_region: interface.size_of_shared_memory_region().read()?,
            shared_memory: p[0],
            live: p[1],
            playback: p[2],
            stream_availability: p[3],
            pdevice_info: p[4],
            vdevice_info: p[5],
            pid_table_region: p[6],
            pid_table: p[7],
            pid_slot_mapping_table: p[8],
            slot_info: p[9],
            dma_info: p[10],
            indexer_info: p[11],
            filter_cam_region: p[12],
            filter_cam_tables: p[13],
            proprietary_filters: p[14],
            pes_marker_buffers: p[15],
            dma_overflow_flags: p[16],
            dma_pointers: p[17],
            status_blk: p[18],
        })
    }

    /// Publishes the counts and pointer table, as the firmware does once it has laid out dDEM.
    pub fn write(&self, interface: &InterfaceBlock<'_>) -> io::Result<()> {
        interface.number_of_vdevices().write(self.number_of_vdevices)?;
        interface.number_of_pids().write(self.number_of_pids)?;
        interface.number_of_slots().write(self.number_of_slots)?;
        interface.number_of_section_filters().write(self.number_of_section_filters)?;
        interface.number_of_dma_structures().write(self.number_of_dma_structures)?;
        interface.number_of_indexers().write(self.number_of_indexers)?;
        interface.number_of_status_blks().write(self.number_of_status_blks)?;
        interface.number_of_live_channels().write(self.number_of_live_channels)?;
        interface.number_of_pes_markers().write(self.number_of_pes_markers)?;
        interface.size_of_cam().write(self.size_of_cam)?;
        interface.size_of_pid_table_region().write(self.size_of_pid_table_region)?;
        interface.size_of_shared_memory_region().write(self.size_of_shared_memory_region)?;

        interface.pointers().write_all(&[
            self.shared_memory,
            self.live,
            self.playback,
            self.stream_availability,
            self.pdevice_info,
            self.vdevice_info,
            self.pid_table_region,
            self.pid_table,
            self.pid_slot_mapping_table,
            self.slot_info,
            self.dma_info,
            self.indexer_info,
            self.filter_cam_region,
            self.filter_cam_tables,
            self.proprietary_filters,
            self.pes_marker_buffers,
            self.dma_overflow_flags,
            self.dma_pointers,
            self.status_blk,
        ])
    }
}

/// Reads the NUL-padded version string out of the interface block.
pub fn read_version(interface: &InterfaceBlock<'_>) -> io::Result<String> {
    let bytes = interface.version().read_all()?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Whether a firmware version string is compatible with [`TP_VERSION_ID`].
pub fn version_is_compatible(version: &str) -> bool {
    let wanted = &TP_VERSION_ID.as_bytes()[..TP_VERSION_SIGNIFICANT_CHARS];
    version.as_bytes().get(..TP_VERSION_SIGNIFICANT_CHARS) == Some(wanted)
}

/* ---------------------------------------------------------------------------------------------- */

/// CAM banks of a filter entry, in their order within the CAM region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CamBank {
    DataA = 0,
    MaskA = 1,
    DataB = 2,
    MaskB = 3,
}

/// Typed access to every firmware table, given the shared memory and a parsed layout.
#[derive(Clone, Debug)]
pub struct Tp {
    memory: Arc<SharedMemory>,
    layout: TpLayout,
}

impl Tp {
    pub fn new(memory: Arc<SharedMemory>, layout: TpLayout) -> Tp {
        Tp { memory, layout }
    }

    pub fn layout(&self) -> &TpLayout {
        &self.layout
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    fn region(&self) -> &dyn TpRegion {
        &*self.memory
    }

    fn table<'a, T>(&'a self, offset: u32, count: u32) -> TpArray<'a, T>
    where
        T: BackedByTpSubregion<'a> + TpStruct,
    {
        let start = u64::from(offset);
        let end = start + u64::from(count) * T::SIZE;
        TpArray::backed_by(self.region().subregion(start..end))
    }

    pub fn interface(&self) -> InterfaceBlock<'_> {
        InterfaceBlock::backed_by(self.region())
    }

    pub fn pdevice_info(&self) -> PDeviceInfo<'_> {
        PDeviceInfo::backed_by(self.region().subregion(u64::from(self.layout.pdevice_info)..))
    }

    pub fn vdevice_infos(&self) -> TpArray<'_, VDeviceInfo<'_>> {
        self.table(self.layout.vdevice_info, self.layout.number_of_vdevices)
    }

    pub fn vdevice_info(&self, index: u32) -> io::Result<VDeviceInfo<'_>> {
        self.vdevice_infos().at(index as usize)
    }

    pub fn slot_infos(&self) -> TpArray<'_, SlotInfo<'_>> {
        self.table(self.layout.slot_info, self.layout.number_of_slots)
    }

    pub fn slot_info(&self, index: u16) -> io::Result<SlotInfo<'_>> {
        self.slot_infos().at(usize::from(index))
    }

    pub fn dma_infos(&self) -> TpArray<'_, DmaInfo<'_>> {
        self.table(self.layout.dma_info, self.layout.number_of_dma_structures)
    }

    pub fn dma_info(&self, index: u16) -> io::Result<DmaInfo<'_>> {
        self.dma_infos().at(usize::from(index))
    }

    pub fn dma_overflow_flag(&self, index: u16) -> io::Result<TpRegisterRw<'_, u8>> {
        let flags: TpRwArray<'_, u8> =
            self.table(self.layout.dma_overflow_flags, self.layout.number_of_dma_structures);
        flags.at(usize::from(index))
    }

    pub fn indexer_infos(&self) -> TpArray<'_, IndexerInfo<'_>> {
        self.table(self.layout.indexer_info, self.layout.number_of_indexers)
    }

    pub fn indexer_info(&self, index: u16) -> io::Result<IndexerInfo<'_>> {
        self.indexer_infos().at(usize::from(index))
    }

    pub fn pid_table(&self) -> TpRwArray<'_, u16> {
        self.table(self.layout.pid_table, self.layout.number_of_pids)
    }

    pub fn pid_slot_mapping_table(&self) -> TpRwArray<'_, u16> {
        self.table(self.layout.pid_slot_mapping_table, self.layout.number_of_pids)
    }

    pub fn cam_table(&self, vdevice: u32) -> io::Result<CamTable<'_>> {
        let tables: TpArray<'_, CamTable<'_>> =
            self.table(self.layout.filter_cam_tables, self.layout.number_of_vdevices);
        tables.at(vdevice as usize)
    }

    /// One 64-bit word of the CAM region; `entry` is absolute (partition start included).
    pub fn cam_word(&self, bank: CamBank, entry: u32) -> io::Result<TpRegisterRw<'_, u64>> {
        if entry >= self.layout.size_of_cam {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("CAM entry {} out of range ({})", entry, self.layout.size_of_cam),
            ));
        }
        let banks: TpRwArray<'_, u64> =
            self.table(self.layout.filter_cam_region, self.layout.size_of_cam * 4);
        banks.at((bank as u32 * self.layout.size_of_cam + entry) as usize)
    }

    pub fn proprietary_filter(&self, index: u32) -> io::Result<ProprietaryFilter<'_>> {
        let filters: TpArray<'_, ProprietaryFilter<'_>> =
            self.table(self.layout.proprietary_filters, self.layout.number_of_slots);
        filters.at(index as usize)
    }

    pub fn pes_markers(&self) -> TpArray<'_, MarkerData<'_>> {
        self.table(self.layout.pes_marker_buffers, self.layout.number_of_pes_markers)
    }

    pub fn status_blks(&self) -> TpArray<'_, StatusBlk<'_>> {
        self.table(self.layout.status_blk, self.layout.number_of_status_blks)
    }

    pub fn live(&self, channel: u32) -> io::Result<Live<'_>> {
        let live: TpArray<'_, Live<'_>> =
            self.table(self.layout.live, self.layout.number_of_live_channels.max(1));
        live.at(channel as usize)
    }

    pub fn playback(&self, channel: u32) -> io::Result<Playback<'_>> {
        let playback: TpArray<'_, Playback<'_>> =
            self.table(self.layout.playback, NUMBER_OF_PLAYBACK_CHANNELS);
        playback.at(channel as usize)
    }

    pub fn dma_pointers(&self) -> TpRwArray<'_, u32> {
        self.table(self.layout.dma_pointers, self.layout.number_of_live_channels)
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_checksum() {
        assert_eq!(SHARED_MEMORY_INTERFACE_CHECKSUM, 170_664);
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(InterfaceBlock::SIZE, 424);
        assert_eq!(PDeviceInfo::SIZE, 336);
        assert_eq!(SlotInfo::SIZE, 64);
        assert_eq!(StatusBlk::SIZE, 44);
        assert_eq!(CamTable::SIZE, 112);
    }

    #[test]
    fn test_version_prefix() {
        assert!(version_is_compatible("010225FF"));
        assert!(version_is_compatible(TP_VERSION_ID));
        assert!(!version_is_compatible("01022601"));
        assert!(!version_is_compatible("0102"));
    }

    #[test]
    fn test_layout_roundtrip_through_interface() {
        let memory = Arc::new(SharedMemory::new(4096).unwrap());
        let layout = TpLayout {
            number_of_vdevices: 2,
            number_of_slots: 4,
            slot_info: 1024,
            status_blk: 2048,
            ..TpLayout::default()
        };
        let tp = Tp::new(memory.clone(), layout);
        layout.write(&tp.interface()).unwrap();

        assert_eq!(TpLayout::read(&tp.interface()).unwrap(), layout);
        assert_eq!(memory.read_le_u32(92 + 9 * 4).unwrap(), 1024);

        tp.slot_info(3).unwrap().next_slot().write(0xBEEF).unwrap();
        assert_eq!(memory.read_le_u16(1024 + 3 * 64 + 8).unwrap(), 0xBEEF);
        assert!(tp.slot_info(4).is_err());
    }

    #[test]
    fn test_status_block_cc_nibbles() {
        let memory = SharedMemory::new(64).unwrap();
        let blk = StatusBlk::backed_by(&memory);
        let block = StatusBlock {
            flags: status_flags::CC_ERROR,
            expected_cc: 0x3,
            received_cc: 0x5,
            ..StatusBlock::default()
        };
        block.write_to(&blk).unwrap();

        assert_eq!(memory.read_u8(28).unwrap(), 0x53);
        assert_eq!(StatusBlock::read_from(&blk).unwrap(), block);
    }
}

/* ---------------------------------------------------------------------------------------------- */
