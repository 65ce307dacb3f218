// SPDX-License-Identifier: MIT OR Apache-2.0

//! The error type shared by every HAL operation.

/* ---------------------------------------------------------------------------------------------- */

use std::io;

use thiserror::Error;

/* ---------------------------------------------------------------------------------------------- */

/// Result codes returned by HAL operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad parameter")]
    BadParameter,
    #[error("no memory")]
    NoMemory,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("feature not supported")]
    FeatureNotSupported,
    #[error("timeout")]
    Timeout,
    #[error("device suspended")]
    Suspended,
    #[error("device busy")]
    DeviceBusy,
    #[error("shared-memory interface unavailable (transport processor not running)")]
    InterfaceUnavailable,

    #[error("no packet in buffer")]
    NoPacket,
    #[error("incomplete section in buffer")]
    IncompleteSectionInBuffer,
    #[error("corrupt data in buffer")]
    CorruptDataInBuffer,
    #[error("not enough room to return data")]
    NotEnoughRoomToReturnData,
    #[error("buffer has no metadata")]
    BufferHasNoMetadata,

    #[error("objects already associated")]
    ObjectAlreadyAssociated,
    #[error("objects not associated")]
    ObjectsNotAssociated,
    #[error("only one signal may be associated with a buffer")]
    OnlyOneSignalPerBuffer,
    #[error("invalid slot type")]
    InvalidSlotType,
    #[error("too many slots with the same pid")]
    TooManySlotsWithSamePid,
    #[error("secondary pid already in use")]
    SlotSecondaryPidInUse,
    #[error("slot already linked")]
    SlotAlreadyLinked,
    #[error("slot not associated")]
    SlotNotAssociated,
    #[error("not allowed while a pid is set")]
    NotAllowedWhilstPidSet,
    #[error("slots sharing a pid have differing security path ids")]
    DifferingSecurityPathIds,
    #[error("index already associated with a slot")]
    IndexSlotAlreadyAssociated,
    #[error("index not associated")]
    IndexNotAssociated,
    #[error("index in use")]
    IndexInUse,

    #[error("invalid filter operating mode")]
    InvalidFilterOperatingMode,
    #[error("invalid filter type")]
    InvalidFilterType,
    #[error("invalid filter handle")]
    InvalidFilterHandle,
    #[error("invalid filter data")]
    InvalidFilterData,
    #[error("filters flush not supported (too many pending flushes)")]
    FlushFiltersNotSupported,
    #[error("invalid slot handle")]
    InvalidSlotHandle,

    #[error("signal aborted")]
    SignalAborted,
    #[error("software injector busy")]
    InjectorBusy,
    #[error("no free handles")]
    NoFreeHandles,

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/* ---------------------------------------------------------------------------------------------- */
