// SPDX-License-Identifier: MIT OR Apache-2.0

//! Carving a linear resource (PID table entries, CAM filter entries) into one contiguous
//! partition per vDevice.

/* ---------------------------------------------------------------------------------------------- */

use crate::error::{Error, Result};

/* ---------------------------------------------------------------------------------------------- */

/// Identifies a partition within a [`PartitionedResource`].
pub type PartitionId = usize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Partition {
    start: u32,
    size: u32,
}

/// A resource of `size` units starting at `start`, shared by up to `max_partitions` users.
///
/// Partitions are laid out first fit. A zero-sized entry in the table is free.
#[derive(Clone, Debug)]
pub struct PartitionedResource {
    start: u32,
    size: u32,
    partitions: Vec<Partition>,
}

impl PartitionedResource {
    pub fn new(start: u32, size: u32, max_partitions: usize) -> Result<PartitionedResource> {
        if max_partitions == 0 {
            return Err(Error::BadParameter);
        }

        Ok(PartitionedResource {
            start,
            size,
            partitions: vec![Partition::default(); max_partitions],
        })
    }

    pub fn total_size(&self) -> u32 {
        self.size
    }

    /// Reserves `required` contiguous units at the lowest possible position.
    pub fn alloc(&mut self, required: u32) -> Result<PartitionId> {
        if required == 0 || required > self.size {
            return Err(Error::NoMemory);
        }

        let id = self
            .partitions
            .iter()
            .position(|p| p.size == 0)
            .ok_or(Error::NoMemory)?;

        let limit = self.start + self.size - required;
        let mut candidate = self.start;
        while candidate <= limit {
            let last = candidate + required - 1;
            let collision = self
                .partitions
                .iter()
                .filter(|p| p.size > 0)
                .find(|p| !(p.start + p.size - 1 < candidate || last < p.start));

            match collision {
                Some(p) => candidate = p.start + p.size,
                None => {
                    self.partitions[id] = Partition {
                        start: candidate,
                        size: required,
                    };
                    return Ok(id);
                }
            }
        }

        Err(Error::NoMemory)
    }

    pub fn free(&mut self, id: PartitionId) {
        if let Some(p) = self.partitions.get_mut(id) {
            *p = Partition::default();
        }
    }

    /// Changes the size of a partition without moving it. Shrinking always succeeds; growing only
    /// succeeds if the space up to the next partition is free.
    pub fn resize(&mut self, id: PartitionId, new_size: u32) -> Result<()> {
        let current = *self.partitions.get(id).ok_or(Error::BadParameter)?;
        let current_end = current.start + current.size;

        let next_start = self
            .partitions
            .iter()
            .enumerate()
            .filter(|&(i, p)| i != id && p.size > 0 && current_end <= p.start)
            .map(|(_, p)| p.start)
            .fold(self.start + self.size, u32::min);

        if next_start >= current.start + new_size {
            self.partitions[id].size = new_size;
            Ok(())
        } else {
            Err(Error::NoMemory)
        }
    }

    pub fn start_of(&self, id: PartitionId) -> u32 {
        self.partitions.get(id).map_or(0, |p| p.start)
    }

    pub fn size_of(&self, id: PartitionId) -> u32 {
        self.partitions.get(id).map_or(0, |p| p.size)
    }

    /// Slides every partition down so there is no free space between them. Partitions end up
    /// ordered by id, so every user must rebuild whatever depends on its start.
    pub fn defragment(&mut self) {
        let mut base = self.start;
        for p in &mut self.partitions {
            if p.size > 0 {
                p.start = base;
                base += p.size;
            } else {
                p.start = 0;
            }
        }
    }

    /// Units not covered by any partition.
    pub fn unallocated(&self) -> u32 {
        self.size - self.partitions.iter().map(|p| p.size).sum::<u32>()
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_and_reuse() {
        let mut res = PartitionedResource::new(0, 48, 4).unwrap();
        let a = res.alloc(16).unwrap();
        let b = res.alloc(16).unwrap();
        assert_eq!((res.start_of(a), res.start_of(b)), (0, 16));

        res.free(a);
        let c = res.alloc(8).unwrap();
        assert_eq!(c, a);
        assert_eq!(res.start_of(c), 0);

        let d = res.alloc(16).unwrap();
        assert_eq!(res.start_of(d), 32);
        assert!(matches!(res.alloc(9), Err(Error::NoMemory)));
        assert_eq!(res.alloc(8).map(|id| res.start_of(id)).unwrap(), 8);
    }

    #[test]
    fn test_resize_in_place() {
        let mut res = PartitionedResource::new(0, 32, 3).unwrap();
        let a = res.alloc(8).unwrap();
        let b = res.alloc(8).unwrap();

        assert!(res.resize(a, 9).is_err());
        assert!(res.resize(b, 24).is_ok());
        assert!(res.resize(b, 25).is_err());
        assert!(res.resize(a, 4).is_ok());
        assert_eq!(res.unallocated(), 4);
    }

    #[test]
    fn test_defragment_then_grow() {
        let mut res = PartitionedResource::new(0, 30, 3).unwrap();
        let a = res.alloc(10).unwrap();
        let b = res.alloc(10).unwrap();
        let c = res.alloc(10).unwrap();
        res.free(b);

        res.free(a);
        res.defragment();
        assert_eq!(res.start_of(c), 0);

        let a = res.alloc(20).unwrap();
        assert_eq!(res.start_of(a), 10);
    }

    #[test]
    fn test_table_full() {
        let mut res = PartitionedResource::new(0, 100, 2).unwrap();
        res.alloc(1).unwrap();
        res.alloc(1).unwrap();
        assert!(matches!(res.alloc(1), Err(Error::NoMemory)));
        assert!(PartitionedResource::new(0, 10, 0).is_err());
    }
}

/* ---------------------------------------------------------------------------------------------- */
