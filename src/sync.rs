// SPDX-License-Identifier: MIT OR Apache-2.0

//! Blocking primitives used by signals, the event task and software injectors.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/* ---------------------------------------------------------------------------------------------- */

/// How long a blocking receive may wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Return immediately if nothing is queued.
    Poll,
    For(Duration),
    Forever,
}

impl Wait {
    /// `0` polls, `None` waits forever, anything else waits that many milliseconds.
    pub fn from_millis(timeout: Option<u64>) -> Wait {
        match timeout {
            None => Wait::Forever,
            Some(0) => Wait::Poll,
            Some(ms) => Wait::For(Duration::from_millis(ms)),
        }
    }

    fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Poll => Some(Instant::now()),
            Wait::For(duration) => Some(Instant::now() + duration),
            Wait::Forever => None,
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A bounded multi-producer multi-consumer queue.
#[derive(Debug)]
pub struct MessageQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new(capacity: usize) -> MessageQueue<T> {
        MessageQueue {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
        }
    }

    /// Queues `item` without blocking. Gives the item back if the queue is full.
    pub fn send(&self, item: T) -> std::result::Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);

        self.available.notify_one();
        Ok(())
    }

    /// Takes the oldest item, waiting up to `wait` for one to arrive.
    pub fn recv(&self, wait: Wait) -> Result<T> {
        let deadline = wait.deadline();
        let mut items = self.items.lock();

        loop {
            if let Some(item) = items.pop_front() {
                return Ok(item);
            }

            match deadline {
                None => self.available.wait(&mut items),
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self.available.wait_until(&mut items, deadline).timed_out()
                    {
                        return items.pop_front().ok_or(Error::Timeout);
                    }
                }
            }
        }
    }

    /// Discards everything queued.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let count = items.len();
        items.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A one-shot flag that a waiter blocks on until some other context raises it.
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Completion {
        Completion::default()
    }

    pub fn complete(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// Lowers the flag again, before starting a new operation.
    pub fn reset(&self) {
        *self.done.lock() = false;
    }

    pub fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    pub fn wait(&self, wait: Wait) -> Result<()> {
        let deadline = wait.deadline();
        let mut done = self.done.lock();

        while !*done {
            match deadline {
                None => self.cond.wait(&mut done),
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self.cond.wait_until(&mut done, deadline).timed_out()
                    {
                        return if *done { Ok(()) } else { Err(Error::Timeout) };
                    }
                }
            }
        }

        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
