// SPDX-License-Identifier: MIT OR Apache-2.0

//! Types representing memory shared with the transport processor, and other related types.
//!
//! ## Base machinery
//!
//! - [`trait TpRegion`](TpRegion). Sealed.
//!   - `&'a dyn TpRegion` implements `AsTpSubregion<'a>`, for all `'a`.
//!
//! - [`struct TpSubregion<'a>`](TpSubregion).
//!   - `TpSubregion<'a>` implements `TpRegion`, for all `'a`.
//!   - `TpSubregion<'a>` implements `AsTpSubregion<'a>`, for all `'a`.
//!
//! - [`trait AsTpSubregion<'a>`](AsTpSubregion). Unlike `TpRegion`, this trait is not sealed.
//!   - If `T` implements `AsTpSubregion<'a>`, then `&'b T` implements `AsTpSubregion<'a>`, for
//!     all `'a`, `'b`, `T`.
//!   - If `T` implements `AsTpSubregion<'a> + Debug + Send + Sync`, then `T` implements
//!     `TpRegion`, for all `'a`, `T`.
//!
//! ## `TpRegion` implementations
//!
//! - [`struct TpMemoryRegion<'a>`](TpMemoryRegion). A region backed by a `&'a [u8]`, `&'a mut
//!   [u8]`, or raw memory.
//! - [`struct SharedMemory`](SharedMemory). An owned, zeroed, cache-line aligned allocation. This
//!   is what backends hand out for the firmware interface block and for DMA buffers.
//!
//! All accesses are volatile and little-endian, since the transport processor is a little-endian
//! core that mutates the same memory concurrently with the host.

/* ---------------------------------------------------------------------------------------------- */

pub mod structured;

mod struct_macros;

use std::alloc::{self, Layout};
use std::fmt::{self, Debug};
use std::io::{self, ErrorKind};
use std::marker::PhantomData;
use std::mem;
use std::ops::{Bound, Range, RangeBounds};
use std::ptr::NonNull;

/* ---------------------------------------------------------------------------------------------- */

/// Describes which operations may be performed on some piece of memory or other data region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Permissions {
    /// Only reading is allowed.
    Read,
    /// Both reading and writing are allowed.
    ReadWrite,
}

impl Permissions {
    pub fn can_write(&self) -> bool {
        !matches!(self, Permissions::Read)
    }
}

/* ---------------------------------------------------------------------------------------------- */

pub(crate) use private::Sealed;
mod private {
    /// Keeps [`TpRegion`](super::TpRegion) closed to implementations from outside the crate.
    pub trait Sealed {}
}

/// A region of memory shared with the transport processor: the interface block, a DMA buffer, or
/// some part of one of those.
///
/// The region does not have RAM semantics from the host's point of view: the firmware changes
/// values at any time, so every access is a single volatile load or store.
///
/// Offsets are [`u64`], not [`usize`], so the same code works on 32-bit hosts.
///
/// This trait is _sealed_, and thus cannot be implemented by users of the crate.
#[allow(clippy::len_without_is_empty)]
pub trait TpRegion: Debug + Send + Sync + Sealed {
    /// The length of the region in bytes.
    fn len(&self) -> u64;

    /// Whether the region may be read, written, or both.
    fn permissions(&self) -> Permissions;

    /// Returns a `const` pointer to the beginning of the `TpRegion`.
    fn as_ptr(&self) -> Option<*const u8>;

    /// Returns a `mut` pointer to the beginning of the `TpRegion`.
    ///
    /// If the region is not writeable, this returns `None`.
    fn as_mut_ptr(&self) -> Option<*mut u8>;

    /// Read from a contiguous range of the region into a byte buffer.
    ///
    /// There is no guarantee that the access will be atomic in any sense.
    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()>;

    /// Write a byte buffer into a contiguous range of the region.
    fn write_bytes(&self, offset: u64, buffer: &[u8]) -> io::Result<()>;

    /// Read an [`u8`] at the given byte offset.
    fn read_u8(&self, offset: u64) -> io::Result<u8>;

    /// Write an [`u8`] at the given byte offset.
    fn write_u8(&self, offset: u64, value: u8) -> io::Result<()>;

    /// Read a little-endian [`u16`] at the given byte offset.
    ///
    /// This will fail if `offset + 2 > self.len()`, or if `offset` is not 2-byte aligned.
    fn read_le_u16(&self, offset: u64) -> io::Result<u16>;

    /// Write a little-endian [`u16`] at the given byte offset.
    fn write_le_u16(&self, offset: u64, value: u16) -> io::Result<()>;

    /// Read a little-endian [`u32`] at the given byte offset.
    ///
    /// This will fail if `offset + 4 > self.len()`, or if `offset` is not 4-byte aligned.
    fn read_le_u32(&self, offset: u64) -> io::Result<u32>;

    /// Write a little-endian [`u32`] at the given byte offset.
    fn write_le_u32(&self, offset: u64, value: u32) -> io::Result<()>;

    /// Read a little-endian [`u64`] at the given byte offset.
    ///
    /// This will fail if `offset + 8 > self.len()`, or if `offset` is not 8-byte aligned.
    fn read_le_u64(&self, offset: u64) -> io::Result<u64>;

    /// Write a little-endian [`u64`] at the given byte offset.
    fn write_le_u64(&self, offset: u64, value: u64) -> io::Result<()>;
}

/* ---------------------------------------------------------------------------------------------- */

/// A contiguous part of a [`TpRegion`], which is itself also a `TpRegion`.
///
/// Simply redirects accesses to the underlying `TpRegion`, offset by the `TpSubregion`'s offset.
/// Also makes sure those accesses don't exceed the `TpSubregion`'s end (offset + length).
#[derive(Clone, Copy, Debug)]
pub struct TpSubregion<'a> {
    region: &'a dyn TpRegion,
    offset: u64,
    length: u64,
}

impl<'a> TpSubregion<'a> {
    pub fn underlying_region(&self) -> &'a dyn TpRegion {
        self.region
    }

    pub fn offset_in_underlying_region(&self) -> u64 {
        self.offset
    }

    fn validate_access(&self, offset: u64, len: usize) -> io::Result<()> {
        let len = len as u64;

        if offset + len > self.length {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Tried to access region range [{:#x}, {:#x}), must be within [0x0, {:#x})",
                    offset,
                    offset + len,
                    self.length
                ),
            ));
        }

        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// For when it is possible to obtain a [`TpSubregion`] representation of a value cheaply.
///
/// Also provides a handy [`AsTpSubregion::subregion`] method with a default implementation.
pub trait AsTpSubregion<'a> {
    /// Returns a [`TpSubregion`] corresponding to `self`.
    fn as_subregion(&self) -> TpSubregion<'a>;

    /// Returns a [`TpSubregion`] corresponding to a range of `self`.
    fn subregion(&self, range: impl RangeBounds<u64>) -> TpSubregion<'a> {
        let subregion = Self::as_subregion(self);
        let range = clamp_range(range, subregion.len());

        TpSubregion {
            region: subregion.underlying_region(),
            offset: subregion.offset_in_underlying_region() + range.start,
            length: range.end - range.start,
        }
    }
}

/// Types that are views over a [`TpSubregion`], such as registers and firmware records.
pub trait BackedByTpSubregion<'a> {
    /// Creates a view that starts at the beginning of the given subregion.
    fn backed_by(as_subregion: impl AsTpSubregion<'a>) -> Self;
}

// If a `T` is `AsTpSubregion<'a>`, then any `&T` is also.
impl<'a, 'b, T> AsTpSubregion<'a> for &'b T
where
    T: AsTpSubregion<'a>,
{
    fn as_subregion(&self) -> TpSubregion<'a> {
        T::as_subregion(*self)
    }
}

impl<'a> AsTpSubregion<'a> for &'a dyn TpRegion {
    fn as_subregion(&self) -> TpSubregion<'a> {
        TpSubregion {
            region: *self,
            offset: 0,
            length: TpRegion::len(*self),
        }
    }
}

impl<'a> AsTpSubregion<'a> for TpSubregion<'a> {
    fn as_subregion(&self) -> TpSubregion<'a> {
        *self
    }
}

impl<'a, T> Sealed for T where T: AsTpSubregion<'a> + Debug + Send + Sync {}
impl<'a, T> TpRegion for T
where
    T: AsTpSubregion<'a> + Debug + Send + Sync,
{
    fn len(&self) -> u64 {
        let subregion = T::as_subregion(self);
        subregion.length
    }

    fn permissions(&self) -> Permissions {
        let subregion = T::as_subregion(self);
        subregion.region.permissions()
    }

    fn as_ptr(&self) -> Option<*const u8> {
        let subregion = T::as_subregion(self);
        let ptr = subregion.region.as_ptr()?;
        Some(unsafe { ptr.add(subregion.offset as usize) })
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        let subregion = T::as_subregion(self);
        let ptr = subregion.region.as_mut_ptr()?;
        Some(unsafe { ptr.add(subregion.offset as usize) })
    }

    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, buffer.len())?;
        subregion
            .region
            .read_bytes(subregion.offset + offset, buffer)
    }

    fn write_bytes(&self, offset: u64, buffer: &[u8]) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, buffer.len())?;
        subregion
            .region
            .write_bytes(subregion.offset + offset, buffer)
    }

    fn read_u8(&self, offset: u64) -> io::Result<u8> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u8>())?;
        subregion.region.read_u8(subregion.offset + offset)
    }

    fn write_u8(&self, offset: u64, value: u8) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u8>())?;
        subregion.region.write_u8(subregion.offset + offset, value)
    }

    fn read_le_u16(&self, offset: u64) -> io::Result<u16> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u16>())?;
        subregion.region.read_le_u16(subregion.offset + offset)
    }

    fn write_le_u16(&self, offset: u64, value: u16) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u16>())?;
        subregion
            .region
            .write_le_u16(subregion.offset + offset, value)
    }

    fn read_le_u32(&self, offset: u64) -> io::Result<u32> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u32>())?;
        subregion.region.read_le_u32(subregion.offset + offset)
    }

    fn write_le_u32(&self, offset: u64, value: u32) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u32>())?;
        subregion
            .region
            .write_le_u32(subregion.offset + offset, value)
    }

    fn read_le_u64(&self, offset: u64) -> io::Result<u64> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u64>())?;
        subregion.region.read_le_u64(subregion.offset + offset)
    }

    fn write_le_u64(&self, offset: u64, value: u64) -> io::Result<()> {
        let subregion = T::as_subregion(self);
        subregion.validate_access(offset, mem::size_of::<u64>())?;
        subregion
            .region
            .write_le_u64(subregion.offset + offset, value)
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[derive(Clone, Copy, Debug)]
pub struct TpMemoryRegion<'a> {
    ptr: *mut u8,
    length: usize,
    permissions: Permissions,
    phantom: PhantomData<&'a ()>,
}

unsafe impl Send for TpMemoryRegion<'_> {}
unsafe impl Sync for TpMemoryRegion<'_> {}

impl TpMemoryRegion<'_> {
    pub fn new(data: &[u8]) -> TpMemoryRegion {
        TpMemoryRegion {
            ptr: data.as_ptr() as *mut _,
            length: data.len(),
            permissions: Permissions::Read,
            phantom: PhantomData,
        }
    }

    pub fn new_mut(data: &mut [u8]) -> TpMemoryRegion {
        TpMemoryRegion {
            ptr: data.as_mut_ptr(),
            length: data.len(),
            permissions: Permissions::ReadWrite,
            phantom: PhantomData,
        }
    }

    /// # Safety
    ///
    /// The returned `TpMemoryRegion` must not outlive the data.
    pub unsafe fn new_raw<'a>(
        data: *mut u8,
        length: usize,
        permissions: Permissions,
    ) -> TpMemoryRegion<'a> {
        TpMemoryRegion {
            ptr: data,
            length,
            permissions,
            phantom: PhantomData,
        }
    }

    fn get_ptr<T>(&self, offset: u64) -> io::Result<*mut T> {
        let size = mem::size_of::<T>() as u64;

        match offset.checked_add(size) {
            Some(end) if end <= self.length as u64 => {}
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "Access falls outside region",
                ))
            }
        }

        if offset % size != 0 {
            return Err(io::Error::new(ErrorKind::InvalidInput, "Unaligned access"));
        }

        Ok(unsafe { self.ptr.add(offset as usize).cast::<T>() })
    }

    fn check_range(&self, offset: u64, len: usize) -> io::Result<()> {
        let end = offset + len as u64;

        if end > self.length as u64 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Invalid shared memory range [{:#x}, {:#x}), must be within [0x0, {:#x})",
                    offset,
                    end,
                    self.length
                ),
            ));
        }

        Ok(())
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.permissions.can_write() {
            Ok(())
        } else {
            Err(io::Error::new(
                ErrorKind::PermissionDenied,
                "Region is not writeable",
            ))
        }
    }
}

impl Sealed for TpMemoryRegion<'_> {}
impl TpRegion for TpMemoryRegion<'_> {
    fn len(&self) -> u64 {
        self.length as u64
    }

    fn permissions(&self) -> Permissions {
        self.permissions
    }

    fn as_ptr(&self) -> Option<*const u8> {
        Some(self.ptr)
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        if self.permissions.can_write() {
            Some(self.ptr)
        } else {
            None
        }
    }

    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, buffer.len())?;

        for (off, byte) in (offset..).zip(buffer) {
            *byte = unsafe { self.get_ptr::<u8>(off)?.read_volatile() };
        }

        Ok(())
    }

    fn write_bytes(&self, offset: u64, buffer: &[u8]) -> io::Result<()> {
        self.check_writable()?;
        self.check_range(offset, buffer.len())?;

        for (off, byte) in (offset..).zip(buffer) {
            unsafe { self.get_ptr::<u8>(off)?.write_volatile(*byte) };
        }

        Ok(())
    }

    fn read_u8(&self, offset: u64) -> io::Result<u8> {
        let v = unsafe { self.get_ptr::<u8>(offset)?.read_volatile() };
        Ok(v)
    }

    fn write_u8(&self, offset: u64, value: u8) -> io::Result<()> {
        self.check_writable()?;
        unsafe { self.get_ptr::<u8>(offset)?.write_volatile(value) };
        Ok(())
    }

    fn read_le_u16(&self, offset: u64) -> io::Result<u16> {
        let v = unsafe { self.get_ptr::<u16>(offset)?.read_volatile() };
        Ok(u16::from_le(v))
    }

    fn write_le_u16(&self, offset: u64, value: u16) -> io::Result<()> {
        self.check_writable()?;
        unsafe { self.get_ptr::<u16>(offset)?.write_volatile(value.to_le()) };
        Ok(())
    }

    fn read_le_u32(&self, offset: u64) -> io::Result<u32> {
        let v = unsafe { self.get_ptr::<u32>(offset)?.read_volatile() };
        Ok(u32::from_le(v))
    }

    fn write_le_u32(&self, offset: u64, value: u32) -> io::Result<()> {
        self.check_writable()?;
        unsafe { self.get_ptr::<u32>(offset)?.write_volatile(value.to_le()) };
        Ok(())
    }

    fn read_le_u64(&self, offset: u64) -> io::Result<u64> {
        let v = unsafe { self.get_ptr::<u64>(offset)?.read_volatile() };
        Ok(u64::from_le(v))
    }

    fn write_le_u64(&self, offset: u64, value: u64) -> io::Result<()> {
        self.check_writable()?;
        unsafe { self.get_ptr::<u64>(offset)?.write_volatile(value.to_le()) };
        Ok(())
    }
}

impl<'a> AsTpSubregion<'a> for &'a TpMemoryRegion<'_> {
    fn as_subregion(&self) -> TpSubregion<'a> {
        let region: &dyn TpRegion = *self;
        <&dyn TpRegion>::as_subregion(&region)
    }
}

/* ---------------------------------------------------------------------------------------------- */

const SHARED_MEMORY_ALIGNMENT: usize = 64;

/// An owned, zero-initialised allocation that both the host and the transport processor access.
///
/// The allocation is aligned to a cache line so that every record inside it can be accessed with
/// naturally aligned loads and stores.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    length: usize,
    layout: Layout,
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    pub fn new(length: usize) -> io::Result<SharedMemory> {
        let layout = Layout::from_size_align(length.max(1), SHARED_MEMORY_ALIGNMENT)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e.to_string()))?;

        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };

        Ok(SharedMemory {
            ptr,
            length,
            layout,
        })
    }

    fn region(&self) -> TpMemoryRegion<'_> {
        unsafe { TpMemoryRegion::new_raw(self.ptr.as_ptr(), self.length, Permissions::ReadWrite) }
    }

    /// Sets `len` bytes starting at `offset` to `value`.
    pub fn fill(&self, offset: u64, len: usize, value: u8) -> io::Result<()> {
        self.region().write_bytes(offset, &vec![value; len])
    }

    /// Copies the whole allocation out, e.g. to preserve it across a power-down.
    pub fn snapshot(&self, len: usize) -> io::Result<Vec<u8>> {
        let mut data = vec![0; len.min(self.length)];
        self.region().read_bytes(0, &mut data)?;
        Ok(data)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("ptr", &self.ptr)
            .field("length", &self.length)
            .finish()
    }
}

impl Sealed for SharedMemory {}
impl TpRegion for SharedMemory {
    fn len(&self) -> u64 {
        self.length as u64
    }

    fn permissions(&self) -> Permissions {
        Permissions::ReadWrite
    }

    fn as_ptr(&self) -> Option<*const u8> {
        Some(self.ptr.as_ptr())
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        Some(self.ptr.as_ptr())
    }

    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        self.region().read_bytes(offset, buffer)
    }

    fn write_bytes(&self, offset: u64, buffer: &[u8]) -> io::Result<()> {
        self.region().write_bytes(offset, buffer)
    }

    fn read_u8(&self, offset: u64) -> io::Result<u8> {
        self.region().read_u8(offset)
    }

    fn write_u8(&self, offset: u64, value: u8) -> io::Result<()> {
        self.region().write_u8(offset, value)
    }

    fn read_le_u16(&self, offset: u64) -> io::Result<u16> {
        self.region().read_le_u16(offset)
    }

    fn write_le_u16(&self, offset: u64, value: u16) -> io::Result<()> {
        self.region().write_le_u16(offset, value)
    }

    fn read_le_u32(&self, offset: u64) -> io::Result<u32> {
        self.region().read_le_u32(offset)
    }

    fn write_le_u32(&self, offset: u64, value: u32) -> io::Result<()> {
        self.region().write_le_u32(offset, value)
    }

    fn read_le_u64(&self, offset: u64) -> io::Result<u64> {
        self.region().read_le_u64(offset)
    }

    fn write_le_u64(&self, offset: u64, value: u64) -> io::Result<()> {
        self.region().write_le_u64(offset, value)
    }
}

impl<'a> AsTpSubregion<'a> for &'a SharedMemory {
    fn as_subregion(&self) -> TpSubregion<'a> {
        let region: &dyn TpRegion = *self;
        <&dyn TpRegion>::as_subregion(&region)
    }
}

/* ---------------------------------------------------------------------------------------------- */

fn clamp_range(range: impl RangeBounds<u64>, max_length: u64) -> Range<u64> {
    let start = match range.start_bound() {
        Bound::Included(&b) => b,
        Bound::Excluded(&b) => b + 1,
        Bound::Unbounded => 0,
    };

    let end = match range.end_bound() {
        Bound::Included(&b) => b + 1,
        Bound::Excluded(&b) => b,
        Bound::Unbounded => max_length,
    };

    Range {
        start: start.min(max_length),
        end: end.max(start).min(max_length),
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
