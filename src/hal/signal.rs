// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signals: waiting for buffers to fill.
//!
//! A signal is associated with the buffers it watches, at most one signal per buffer. When a
//! buffer's fill level reaches its threshold the buffer's handle is posted to the signal's queue,
//! from the interrupt path when the firmware moved the level and from the host side when a
//! threshold or read offset changed. Both can report the same crossing, so [`Hal::signal_wait`]
//! looks at the buffer again before returning it and quietly drops posts that no longer hold.

/* ---------------------------------------------------------------------------------------------- */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::hal::{Hal, PDeviceState, TpStatus};
use crate::objman::{Handle, ObjectKind};
use crate::sync::{MessageQueue, Wait};

/* ---------------------------------------------------------------------------------------------- */

/// Posts a signal can hold before further ones are dropped.
const SIGNAL_QUEUE_DEPTH: usize = 32;

#[derive(Debug)]
pub struct Signal {
    /// Buffers that reached their threshold; `None` wakes a waiter without one.
    queue: Arc<MessageQueue<Option<Handle>>>,
    /// Callers blocked in [`Hal::signal_wait`].
    waiting: Arc<AtomicUsize>,
}

impl Signal {
    fn new() -> Signal {
        Signal {
            queue: Arc::new(MessageQueue::new(SIGNAL_QUEUE_DEPTH)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wakes every current waiter, or the next one if nobody is waiting.
    fn abort(&self) {
        let waiters = self.waiting.load(Ordering::SeqCst).max(1);
        for _ in 0..waiters {
            if self.queue.send(None).is_err() {
                // Full of posts: drop one to make room for the wake up.
                let _ = self.queue.recv(Wait::Poll);
                let _ = self.queue.send(None);
            }
        }
    }
}

/// What is left of `wait` once `start` is some time ago.
fn remaining(wait: Wait, start: Instant) -> Wait {
    match wait {
        Wait::For(duration) => match duration.checked_sub(start.elapsed()) {
            Some(left) if !left.is_zero() => Wait::For(left),
            _ => Wait::Poll,
        },
        other => other,
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl PDeviceState {
    pub(crate) fn signal_allocate(&mut self, parent: Handle) -> Result<Handle> {
        let handle = self.signals.insert(Signal::new())?;
        self.links.add_child(parent, handle);
        Ok(handle)
    }

    pub(crate) fn signal_deallocate(&mut self, handle: Handle) -> Result<()> {
        let signal = self.signals.remove(handle)?;
        if signal.waiting.load(Ordering::SeqCst) > 0 {
            debug!("Waking the waiters of deallocated {:?}", handle);
            signal.abort();
        }
        Ok(())
    }

    pub(crate) fn signal_associator(&mut self, handle: Handle, other: Handle) -> Result<()> {
        self.signals.get(handle)?;
        match other.kind() {
            ObjectKind::Buffer => Ok(()),
            _ => Err(Error::BadParameter),
        }
    }

    /// Posts left behind for the buffer are dropped by the waiter.
    pub(crate) fn signal_disassociator(&mut self, handle: Handle, _other: Handle) -> Result<()> {
        self.signals.get(handle).map(drop)
    }

    /// Queues `buffer` on the signal. A full queue already holds enough reasons to wake up.
    pub(crate) fn signal_post(&self, handle: Handle, buffer: Handle) -> Result<()> {
        if self.signals.get(handle)?.queue.send(Some(buffer)).is_err() {
            trace!("{:?} full, dropping post for {:?}", handle, buffer);
        }
        Ok(())
    }

    /// Whether a post for `buffer` still stands.
    fn signal_confirm(&self, handle: Handle, buffer: Handle) -> Result<bool> {
        if self.status() != TpStatus::Running {
            return Err(Error::SignalAborted);
        }
        self.signals.get(handle)?;
        match self.buffers.get(buffer) {
            Ok(b) if b.signal == Some(handle) => self.buffer_ready(b),
            _ => Ok(false),
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Hal {
    /// Waits for one of the signal's buffers to reach its threshold and returns it.
    ///
    /// `Some(0)` only looks, `None` waits for as long as it takes. [`Error::SignalAborted`] means
    /// [`Hal::signal_abort`] was called, the signal was deallocated, or the firmware stopped.
    pub fn signal_wait(&self, signal: Handle, timeout_ms: Option<u64>) -> Result<Handle> {
        signal.expect_kind(ObjectKind::Signal)?;
        let (queue, waiting) = self.with_read(signal, |s| {
            let sig = s.signals.get(signal)?;
            Ok((Arc::clone(&sig.queue), Arc::clone(&sig.waiting)))
        })?;

        let wait = Wait::from_millis(timeout_ms);
        let start = Instant::now();
        waiting.fetch_add(1, Ordering::SeqCst);

        let result = loop {
            let buffer = match queue.recv(remaining(wait, start)) {
                Ok(Some(buffer)) => buffer,
                Ok(None) => break Err(Error::SignalAborted),
                Err(e) => break Err(e),
            };
            match self.with_read(signal, |s| s.signal_confirm(signal, buffer)) {
                Ok(true) => break Ok(buffer),
                Ok(false) => trace!("Dropping stale post of {:?} on {:?}", buffer, signal),
                Err(Error::InvalidHandle) => break Err(Error::SignalAborted),
                Err(e) => break Err(e),
            }
        };

        waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Makes waiters on the signal return [`Error::SignalAborted`].
    pub fn signal_abort(&self, signal: Handle) -> Result<()> {
        signal.expect_kind(ObjectKind::Signal)?;
        self.with_read(signal, |s| {
            s.signals.get(signal)?.abort();
            Ok(())
        })
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::testing::*;
    use crate::hal::{AllocParams, SlotMode};
    use std::thread;
    use std::time::Duration;

    fn packet() -> Vec<u8> {
        let mut p = vec![0x47, 0x00, 0x64, 0x10];
        p.resize(188, 0xFF);
        p
    }

    /// A RAW slot feeding a buffer that signals at two packets.
    fn signalled_buffer(rig: &Rig) -> (Handle, Handle) {
        let slot = rig.slot(SlotMode::Raw);
        let buffer = rig.buffer(4096);
        rig.hal.associate(slot, buffer).unwrap();
        let signal = rig.hal.allocate(rig.session, AllocParams::Signal).unwrap();
        rig.hal.associate(signal, buffer).unwrap();
        rig.hal.buffer_set_threshold(buffer, 2 * 188).unwrap();
        (buffer, signal)
    }

    #[test]
    fn test_remaining_wait() {
        let start = Instant::now();
        assert_eq!(remaining(Wait::Forever, start), Wait::Forever);
        assert_eq!(remaining(Wait::Poll, start), Wait::Poll);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(remaining(Wait::For(Duration::from_millis(1)), start), Wait::Poll);
        assert!(matches!(
            remaining(Wait::For(Duration::from_secs(60)), start),
            Wait::For(_)
        ));
    }

    #[test]
    fn test_firmware_crossing_wakes_waiter() {
        let rig = rig();
        let (buffer, signal) = signalled_buffer(&rig);
        let dma = rig.dma_index(buffer);

        rig.tp.inject(dma, &packet()).unwrap();
        assert!(matches!(
            rig.hal.signal_wait(signal, Some(0)),
            Err(Error::Timeout)
        ));

        rig.tp.inject(dma, &packet()).unwrap();
        assert_eq!(rig.hal.signal_wait(signal, Some(0)).unwrap(), buffer);
    }

    #[test]
    fn test_duplicate_posts_are_dropped_once_read() {
        let rig = rig();
        let (buffer, signal) = signalled_buffer(&rig);
        let dma = rig.dma_index(buffer);

        // The firmware reports the crossing, and the host sees it again.
        rig.tp.inject(dma, &packet()).unwrap();
        rig.tp.inject(dma, &packet()).unwrap();
        rig.hal.buffer_set_threshold(buffer, 2 * 188).unwrap();

        assert_eq!(rig.hal.signal_wait(signal, Some(0)).unwrap(), buffer);
        rig.hal.buffer_set_read_offset(buffer, 2 * 188).unwrap();
        assert!(matches!(
            rig.hal.signal_wait(signal, Some(0)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_post_below_threshold_is_spurious() {
        let rig = rig();
        let (buffer, signal) = signalled_buffer(&rig);

        rig.hal
            .with_read(signal, |s| s.signal_post(signal, buffer))
            .unwrap();
        assert!(matches!(
            rig.hal.signal_wait(signal, Some(10)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_abort_wakes_blocked_waiter() {
        let rig = rig();
        let (_, signal) = signalled_buffer(&rig);

        thread::scope(|scope| {
            let waiter = scope.spawn(|| rig.hal.signal_wait(signal, None));
            thread::sleep(Duration::from_millis(20));
            rig.hal.signal_abort(signal).unwrap();
            assert!(matches!(waiter.join().unwrap(), Err(Error::SignalAborted)));
        });
    }

    #[test]
    fn test_deallocation_wakes_waiter_and_releases_buffer() {
        let rig = rig();
        let (buffer, signal) = signalled_buffer(&rig);

        thread::scope(|scope| {
            let waiter = scope.spawn(|| rig.hal.signal_wait(signal, Some(5_000)));
            thread::sleep(Duration::from_millis(20));
            rig.hal.deallocate(signal, true).unwrap();
            assert!(matches!(waiter.join().unwrap(), Err(Error::SignalAborted)));
        });

        assert!(rig.hal.associated(buffer).unwrap().iter().all(|h| h.kind() != ObjectKind::Signal));
        assert!(matches!(
            rig.hal.signal_wait(signal, Some(0)),
            Err(Error::InvalidHandle)
        ));
    }

    #[test]
    fn test_signal_only_watches_buffers() {
        let rig = rig();
        let signal = rig.hal.allocate(rig.session, AllocParams::Signal).unwrap();
        let slot = rig.slot(SlotMode::Raw);
        assert!(matches!(
            rig.hal.associate(signal, slot),
            Err(Error::BadParameter)
        ));
    }
}

/* ---------------------------------------------------------------------------------------------- */
