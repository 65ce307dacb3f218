// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mocks of the traits the HAL calls out through, for testing code built on top of it.

/* ---------------------------------------------------------------------------------------------- */

use mockall::mock;

use crate::error::Result;
use crate::hal::{EventHandler, EventRecord};
use crate::tsinput::{InputTimer, TsInput, TsInputPowerState};

/* ---------------------------------------------------------------------------------------------- */

mock! {
    /// Stands in for the TS input block. Expectations on [`TsInput::set_clear_pid`] are a handy
    /// way to check which PIDs a vDevice asked to see.
    #[derive(Debug)]
    pub TsInput {}

    impl TsInput for TsInput {
        fn set_clear_pid(&self, pdevice: u8, stream_id: u32, pid: u16, set: bool) -> Result<()>;
        fn map_hw(&self) -> Result<()>;
        fn unmap_hw(&self) -> Result<()>;
        fn set_power_state(&self, state: TsInputPowerState) -> Result<()>;
        fn notify_pdevice_power_state(&self, pdevice: u8, power_on: bool) -> Result<()>;
        fn get_timer(&self, stream_id: u32) -> Result<InputTimer>;
    }
}

mock! {
    #[derive(Debug)]
    pub EventHandler {}

    impl EventHandler for EventHandler {
        fn buffer_overflow(&self, event: &EventRecord);
        fn cc_error(&self, event: &EventRecord);
        fn scramble_to_clear(&self, event: &EventRecord);
        fn clear_to_scramble(&self, event: &EventRecord);
        fn invalid_parameter(&self, event: &EventRecord);
        fn transport_error(&self, event: &EventRecord);
        fn pcr_received(&self, event: &EventRecord);
        fn pes_error(&self, event: &EventRecord);
        fn sections_discarded_on_crc(&self, event: &EventRecord);
        fn interrupt_fail(&self, event: &EventRecord);
        fn data_entry_complete(&self, event: &EventRecord);
        fn marker_error(&self, event: &EventRecord);
        fn invalid_secondary_pid_packet(&self, event: &EventRecord);
    }
}

/* ---------------------------------------------------------------------------------------------- */
