// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::mem::size_of;
use core::marker::PhantomData;
use core::borrow::{Borrow, BorrowMut};
use core::ops::Range;

//////////////////////////////////////////////////////////////////////////////
// Flash device interface.

/// Trait describing a byte-programmable flash device.
///
/// The device is divided into equal pages. A page can only be erased as a
/// whole (every byte becomes `0xFF`), and programming a byte can only clear
/// bits. Setting a bit back to 1 requires erasing the page that contains it.
pub trait Flash {
    /// Type of page, which is typically a `[u8; N]` for some page size `N`;
    /// this is a type rather than a `const` because of restrictions on the use
    /// of associated constants on type parameters in array sizes; see
    /// `rust-lang/rust#43408`.
    ///
    /// The size of this type must be a power of two.
    type Page: Sized + BorrowMut<[u8]> + Borrow<[u8]>;

    /// Error type that can be produced during flash accesses.
    type Error;

    /// Addresses the device will allow us to erase and program. A page is
    /// only writable if it falls entirely inside this range; everything else
    /// (boot code, lock bytes, and so on) is left alone.
    const WRITABLE: Range<u32>;

    /// Erases the page containing `base`, setting every byte in it to `0xFF`.
    ///
    /// Implementations must not be interruptible part way through.
    fn erase_page(&mut self, base: u32) -> Result<(), Self::Error>;

    /// Programs the byte at `addr`. The byte ends up holding
    /// `previous & value`: bits already clear stay clear. If `value` needs a
    /// bit that is currently clear, the caller should have erased the page
    /// first.
    fn program_byte(&mut self, addr: u32, value: u8) -> Result<(), Self::Error>;

    /// Reads the byte currently stored at `addr`, bypassing any caching.
    fn read_byte(&self, addr: u32) -> Result<u8, Self::Error>;

    /// Reads `dest.len()` consecutive bytes starting at `addr`.
    ///
    /// The default implementation uses `read_byte`. Drivers for
    /// memory-mapped parts can do better.
    fn read_into(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        for (a, byte) in (addr..).zip(dest.iter_mut()) {
            *byte = self.read_byte(a)?;
        }
        Ok(())
    }
}

/// Provides a way to hang constants off an implementation of the Flash trait
/// without them being overrideable to incorrect values by an implementation.
pub struct Constants<F>(PhantomData<F>);

impl<F: Flash> Constants<F> {
    /// Bytes per page.
    pub const PAGE_SIZE: u32 = {
        let n = size_of::<F::Page>();
        assert!(n.is_power_of_two(), "page size must be a power of two");
        n as u32
    };

    /// Mask selecting the in-page offset bits of an address.
    pub const OFFSET_MASK: u32 = Self::PAGE_SIZE - 1;
}

/// Splits `addr` into the base address of its page and its offset within
/// that page.
pub fn split_address<F: Flash>(addr: u32) -> (u32, usize) {
    let mask = Constants::<F>::OFFSET_MASK;
    (addr & !mask, (addr & mask) as usize)
}

/// Base address of the page containing `addr`.
pub fn page_base<F: Flash>(addr: u32) -> u32 {
    split_address::<F>(addr).0
}

/// Checks whether the page starting at `base` lies entirely within
/// `F::WRITABLE`.
pub fn is_writable_page<F: Flash>(base: u32) -> bool {
    match base.checked_add(Constants::<F>::PAGE_SIZE) {
        Some(end) => base >= F::WRITABLE.start && end <= F::WRITABLE.end,
        None => false,
    }
}

/// Checks whether every page touched by `len` bytes starting at `addr` is
/// writable. An empty range is trivially writable.
pub fn is_writable_range<F: Flash>(addr: u32, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    let last = match end_address(addr, len) {
        Some(end) => end - 1,
        None => return false,
    };
    let page = Constants::<F>::PAGE_SIZE;
    let mut base = page_base::<F>(addr);
    loop {
        if !is_writable_page::<F>(base) {
            return false;
        }
        if base >= page_base::<F>(last) {
            return true;
        }
        base += page;
    }
}

/// Address just past a run of `len` bytes at `addr`, if that fits in the
/// address space.
fn end_address(addr: u32, len: usize) -> Option<u32> {
    u32::try_from(len).ok().and_then(|l| addr.checked_add(l))
}

/// Things that can go wrong while moving bytes to or from the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessError<E> {
    /// The (given) address lies in a page outside `Flash::WRITABLE`.
    Protected(u32),
    /// A range ran off the end of the address space, or a memory slice was
    /// shorter than the requested length.
    OutOfBounds,
    /// The requested transfer direction is not supported.
    Unsupported,
    /// An underlying flash access error occurred.
    Flash(E),
}

impl<E> From<E> for AccessError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Block transfers.

/// Where a block transfer reads from.
#[derive(Copy, Clone, Debug)]
pub enum Source<'a> {
    /// Raw device bytes starting at the given address.
    Device(u32),
    /// Bytes in RAM.
    Memory(&'a [u8]),
}

/// Where a block transfer writes to.
#[derive(Debug)]
pub enum Destination<'a> {
    /// Device bytes starting at the given address. Writing here erases the
    /// pages involved.
    Device(u32),
    /// Bytes in RAM.
    Memory(&'a mut [u8]),
}

/// Copies `len` bytes from `src` to `dst`, one byte at a time.
///
/// Memory slices may be longer than `len`; only the first `len` bytes are
/// involved. Device-to-device copies are not supported and fail with
/// `Unsupported`.
///
/// There is no recovery from partial failure: if the device fails mid-copy,
/// the error is returned and the destination holds whatever got through.
pub fn copy_range<F: Flash>(
    flash: &mut F,
    dst: Destination<'_>,
    src: Source<'_>,
    len: usize,
) -> Result<(), AccessError<F::Error>> {
    match (dst, src) {
        (Destination::Memory(d), Source::Device(s)) => {
            let d = d.get_mut(..len).ok_or(AccessError::OutOfBounds)?;
            flash_to_ram(flash, d, s)
        }
        (Destination::Device(d), Source::Memory(s)) => {
            let s = s.get(..len).ok_or(AccessError::OutOfBounds)?;
            ram_to_flash(flash, d, s)
        }
        (Destination::Memory(d), Source::Memory(s)) => {
            let d = d.get_mut(..len).ok_or(AccessError::OutOfBounds)?;
            let s = s.get(..len).ok_or(AccessError::OutOfBounds)?;
            ram_to_ram(d, s);
            Ok(())
        }
        (Destination::Device(_), Source::Device(_)) => {
            Err(AccessError::Unsupported)
        }
    }
}

/// Fills `dst` with raw device bytes starting at `src`.
pub fn flash_to_ram<F: Flash>(
    flash: &F,
    dst: &mut [u8],
    src: u32,
) -> Result<(), AccessError<F::Error>> {
    end_address(src, dst.len()).ok_or(AccessError::OutOfBounds)?;
    flash.read_into(src, dst)?;
    Ok(())
}

/// Writes `src` to the device starting at `dst`.
///
/// Each page the destination touches is erased when the copy first enters
/// it, so bytes of those pages outside the destination range are lost. The
/// whole range is checked against `Flash::WRITABLE` before anything is
/// erased; a protected page fails the copy with `Protected` and leaves the
/// device untouched.
pub fn ram_to_flash<F: Flash>(
    flash: &mut F,
    dst: u32,
    src: &[u8],
) -> Result<(), AccessError<F::Error>> {
    end_address(dst, src.len()).ok_or(AccessError::OutOfBounds)?;
    if !is_writable_range::<F>(dst, src.len()) {
        return Err(AccessError::Protected(dst));
    }

    for (i, (addr, &byte)) in (dst..).zip(src).enumerate() {
        let (base, offset) = split_address::<F>(addr);
        if i == 0 || offset == 0 {
            flash.erase_page(base)?;
        }
        flash.program_byte(addr, byte)?;
    }
    Ok(())
}

/// Plain memory-to-memory copy.
///
/// # Panics
///
/// If the slices differ in length.
pub fn ram_to_ram(dst: &mut [u8], src: &[u8]) {
    dst.copy_from_slice(src);
}
