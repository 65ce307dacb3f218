// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed views over [`TpRegion`]s: single registers, arrays of records, and the ordered-publish
//! helpers used whenever a record is made visible to the transport processor.

/* ---------------------------------------------------------------------------------------------- */

use num_traits::{PrimInt, Unsigned};
use std::fmt::{self, Binary, Debug, LowerHex, UpperHex};
use std::io::{self, ErrorKind};
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{fence, Ordering};

use crate::regions::{AsTpSubregion, BackedByTpSubregion, TpRegion, TpSubregion};

/* ---------------------------------------------------------------------------------------------- */

use private::Sealed;
mod private {
    /// Like [`crate::regions::Sealed`].
    pub trait Sealed {}
}

/// Trait for types that represent the value of a field shared with the transport processor.
///
/// This is implemented for [`u8`], [`u16`], [`u32`], and [`u64`].
///
/// This trait is _sealed_, and thus cannot be implemented by users of the crate.
pub trait TpRegisterValue:
    PrimInt + Unsigned + Debug + LowerHex + UpperHex + Binary + Sealed
{
    /// Delegates to the [`TpRegion`] accessor of matching width.
    fn read(region: &dyn TpRegion, offset: u64) -> io::Result<Self>;

    /// Delegates to the [`TpRegion`] accessor of matching width.
    fn write(self, region: &dyn TpRegion, offset: u64) -> io::Result<()>;
}

impl Sealed for u8 {}
impl TpRegisterValue for u8 {
    fn read(region: &dyn TpRegion, offset: u64) -> io::Result<Self> {
        region.read_u8(offset)
    }

    fn write(self, region: &dyn TpRegion, offset: u64) -> io::Result<()> {
        region.write_u8(offset, self)
    }
}

impl Sealed for u16 {}
impl TpRegisterValue for u16 {
    fn read(region: &dyn TpRegion, offset: u64) -> io::Result<Self> {
        region.read_le_u16(offset)
    }

    fn write(self, region: &dyn TpRegion, offset: u64) -> io::Result<()> {
        region.write_le_u16(offset, self)
    }
}

impl Sealed for u32 {}
impl TpRegisterValue for u32 {
    fn read(region: &dyn TpRegion, offset: u64) -> io::Result<Self> {
        region.read_le_u32(offset)
    }

    fn write(self, region: &dyn TpRegion, offset: u64) -> io::Result<()> {
        region.write_le_u32(offset, self)
    }
}

impl Sealed for u64 {}
impl TpRegisterValue for u64 {
    fn read(region: &dyn TpRegion, offset: u64) -> io::Result<Self> {
        region.read_le_u64(offset)
    }

    fn write(self, region: &dyn TpRegion, offset: u64) -> io::Result<()> {
        region.write_le_u64(offset, self)
    }
}

fn print_debug_hex<T: Debug + LowerHex>(
    value: io::Result<T>,
    f: &mut fmt::Formatter,
) -> fmt::Result {
    if let Ok(v) = value {
        // Avoid newlines around short values, and print in hex since that is usually more useful.
        write!(f, "Ok({:#x})", v)
    } else {
        Debug::fmt(&value, f)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Records with a fixed size, so that they can be laid out back to back in a [`TpArray`].
pub trait TpStruct {
    /// Size of one record in bytes, including trailing padding.
    const SIZE: u64;
}

/* ---------------------------------------------------------------------------------------------- */

// READ-ONLY REGISTERS

/// A field that only the transport processor writes.
#[derive(Clone, Copy)]
pub struct TpRegisterRo<'a, T: TpRegisterValue> {
    region: &'a dyn TpRegion,
    offset: u64,
    phantom: PhantomData<T>,
}

impl<'a, T: TpRegisterValue> TpRegisterRo<'a, T> {
    /// Read the field.
    pub fn read(&self) -> io::Result<T> {
        T::read(self.region, self.offset)
    }
}

impl<'a, T: TpRegisterValue> BackedByTpSubregion<'a> for TpRegisterRo<'a, T> {
    fn backed_by(as_subregion: impl AsTpSubregion<'a>) -> Self {
        let subregion = as_subregion.as_subregion();
        TpRegisterRo {
            region: subregion.underlying_region(),
            offset: subregion.offset_in_underlying_region(),
            phantom: PhantomData,
        }
    }
}

impl<T: TpRegisterValue> TpStruct for TpRegisterRo<'_, T> {
    const SIZE: u64 = mem::size_of::<T>() as u64;
}

impl<T: TpRegisterValue> Debug for TpRegisterRo<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        print_debug_hex(self.read(), f)
    }
}

// READ-WRITE REGISTERS

/// A field that the host writes, and that the transport processor may also modify.
#[derive(Clone, Copy)]
pub struct TpRegisterRw<'a, T: TpRegisterValue> {
    region: &'a dyn TpRegion,
    offset: u64,
    phantom: PhantomData<T>,
}

impl<'a, T: TpRegisterValue> TpRegisterRw<'a, T> {
    /// Read the field.
    pub fn read(&self) -> io::Result<T> {
        T::read(self.region, self.offset)
    }

    /// Write the field.
    pub fn write(&self, value: T) -> io::Result<()> {
        value.write(self.region, self.offset)
    }

    /// Read-modify-write: clears the bits in `clear`, then sets the bits in `set`.
    ///
    /// This is not atomic with respect to the transport processor, so it is only used on fields
    /// that the firmware treats as host-owned.
    pub fn modify(&self, clear: T, set: T) -> io::Result<()> {
        let value = (self.read()? & !clear) | set;
        self.write(value)
    }

    /// Sets or clears the bits in `mask`.
    pub fn set_bits(&self, mask: T, enable: bool) -> io::Result<()> {
        if enable {
            self.modify(T::zero(), mask)
        } else {
            self.modify(mask, T::zero())
        }
    }
}

impl<'a, T: TpRegisterValue> BackedByTpSubregion<'a> for TpRegisterRw<'a, T> {
    fn backed_by(as_subregion: impl AsTpSubregion<'a>) -> Self {
        let subregion = as_subregion.as_subregion();
        TpRegisterRw {
            region: subregion.underlying_region(),
            offset: subregion.offset_in_underlying_region(),
            phantom: PhantomData,
        }
    }
}

impl<T: TpRegisterValue> TpStruct for TpRegisterRw<'_, T> {
    const SIZE: u64 = mem::size_of::<T>() as u64;
}

impl<T: TpRegisterValue> Debug for TpRegisterRw<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        print_debug_hex(self.read(), f)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A run of identical records laid out back to back, such as the `SlotInfo` table.
#[derive(Clone, Copy)]
pub struct TpArray<'a, T> {
    subregion: TpSubregion<'a>,
    len: usize,
    phantom: PhantomData<T>,
}

impl<'a, T> TpArray<'a, T>
where
    T: BackedByTpSubregion<'a> + TpStruct,
{
    /// Number of records in the array.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the record at `index`, or `None` if it is out of bounds.
    pub fn get(&self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }

        let start = index as u64 * T::SIZE;
        Some(T::backed_by(self.subregion.subregion(start..start + T::SIZE)))
    }

    /// Like [`TpArray::get`], but failing with an I/O error for out-of-bounds indices.
    pub fn at(&self, index: usize) -> io::Result<T> {
        self.get(index).ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("Index {} out of bounds, array has {} entries", index, self.len),
            )
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + 'a
    where
        T: 'a,
    {
        let subregion = self.subregion;
        (0..self.len as u64).map(move |i| {
            T::backed_by(subregion.subregion(i * T::SIZE..(i + 1) * T::SIZE))
        })
    }

    /// Restricts the view to `count` records starting at `first`.
    pub fn slice(&self, first: usize, count: usize) -> TpArray<'a, T> {
        let first = first.min(self.len);
        let count = count.min(self.len - first);
        let start = first as u64 * T::SIZE;

        TpArray {
            subregion: self.subregion.subregion(start..start + count as u64 * T::SIZE),
            len: count,
            phantom: PhantomData,
        }
    }
}

impl<'a, T> BackedByTpSubregion<'a> for TpArray<'a, T>
where
    T: BackedByTpSubregion<'a> + TpStruct,
{
    fn backed_by(as_subregion: impl AsTpSubregion<'a>) -> Self {
        let subregion = as_subregion.as_subregion();
        TpArray {
            subregion,
            len: (TpRegion::len(&subregion) / T::SIZE) as usize,
            phantom: PhantomData,
        }
    }
}

impl<'a, T> AsTpSubregion<'a> for TpArray<'a, T> {
    fn as_subregion(&self) -> TpSubregion<'a> {
        self.subregion
    }
}

impl<'a, T> Debug for TpArray<'a, T>
where
    T: BackedByTpSubregion<'a> + TpStruct + Debug + 'a,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// An array of host-writable fields, e.g. the PID table.
pub type TpRwArray<'a, T> = TpArray<'a, TpRegisterRw<'a, T>>;

impl<'a, T: TpRegisterValue> TpArray<'a, TpRegisterRw<'a, T>> {
    /// Reads every element into a vector.
    pub fn read_all(&self) -> io::Result<Vec<T>> {
        self.iter().map(|r| r.read()).collect()
    }

    /// Writes `values` starting at element 0.
    pub fn write_all(&self, values: &[T]) -> io::Result<()> {
        for (i, value) in values.iter().enumerate() {
            self.at(i)?.write(*value)?;
        }
        Ok(())
    }

    /// Sets every element to `value`.
    pub fn fill(&self, value: T) -> io::Result<()> {
        self.iter().try_for_each(|r| r.write(value))
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Makes a record visible to the transport processor.
///
/// Runs `fields`, which writes every field of the record, then issues a release fence, and only
/// then writes `value` into the record's state field. The firmware never observes the state field
/// set while some of the other fields still hold stale values.
pub fn publish<T, F>(fields: F, state: TpRegisterRw<'_, T>, value: T) -> io::Result<()>
where
    T: TpRegisterValue,
    F: FnOnce() -> io::Result<()>,
{
    fields()?;
    fence(Ordering::Release);
    state.write(value)
}

/// Takes a record away from the transport processor.
///
/// The state field is written first and fenced, so that the firmware stops using the record
/// before any of the remaining fields are touched by `fields`.
pub fn retire<T, F>(state: TpRegisterRw<'_, T>, value: T, fields: F) -> io::Result<()>
where
    T: TpRegisterValue,
    F: FnOnce() -> io::Result<()>,
{
    state.write(value)?;
    fence(Ordering::SeqCst);
    fields()
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use crate::regions::structured::{publish, retire, TpArray, TpRegisterRw};
    use crate::regions::{AsTpSubregion, BackedByTpSubregion, SharedMemory, TpRegion};

    #[test]
    fn test_register_modify() {
        let memory = SharedMemory::new(16).unwrap();
        let reg: TpRegisterRw<u32> = TpRegisterRw::backed_by((&memory).subregion(4..));

        reg.write(0xf0f0).unwrap();
        reg.modify(0xf000, 0x000f).unwrap();
        assert_eq!(reg.read().unwrap(), 0x00ff);
        reg.set_bits(0x100, true).unwrap();
        assert_eq!(memory.read_le_u32(4).unwrap(), 0x1ff);
        reg.set_bits(0x1, false).unwrap();
        assert_eq!(reg.read().unwrap(), 0x1fe);
    }

    #[test]
    fn test_array_bounds_and_slice() {
        let memory = SharedMemory::new(32).unwrap();
        let array: TpArray<TpRegisterRw<u16>> = TpArray::backed_by(&memory);

        assert_eq!(array.len(), 16);
        assert!(array.get(16).is_none());
        assert!(array.at(16).is_err());

        let slice = array.slice(4, 4);
        slice.fill(0xabcd).unwrap();
        assert_eq!(array.at(4).unwrap().read().unwrap(), 0xabcd);
        assert_eq!(array.at(7).unwrap().read().unwrap(), 0xabcd);
        assert_eq!(array.at(8).unwrap().read().unwrap(), 0);
        assert_eq!(slice.read_all().unwrap(), vec![0xabcd; 4]);
    }

    #[test]
    fn test_iter_outlives_array_view() {
        let memory = SharedMemory::new(8).unwrap();
        let array: TpArray<TpRegisterRw<u16>> = TpArray::backed_by(&memory);
        array.write_all(&[1, 2, 3, 4]).unwrap();

        let registers: Vec<_> = {
            let tail = array.slice(1, 3);
            tail.iter()
        }
        .collect();
        let values: Vec<u16> = registers.iter().map(|r| r.read().unwrap()).collect();
        assert_eq!(values, vec![2, 3, 4]);
    }

    #[test]
    fn test_publish_writes_state_last() {
        let memory = SharedMemory::new(8).unwrap();
        let state: TpRegisterRw<u8> = TpRegisterRw::backed_by(&memory);
        let field: TpRegisterRw<u32> = TpRegisterRw::backed_by((&memory).subregion(4..));

        publish(
            || {
                assert_eq!(state.read()?, 0);
                field.write(42)
            },
            state,
            1,
        )
        .unwrap();
        assert_eq!(state.read().unwrap(), 1);

        retire(state, 0, || {
            assert_eq!(state.read()?, 0);
            field.write(0)
        })
        .unwrap();
        assert_eq!(field.read().unwrap(), 0);
    }
}

/* ---------------------------------------------------------------------------------------------- */
