// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-addressable, writable view of a page-erased flash device.
//!
//! Flash can only be erased a page at a time and programming can only clear
//! bits, so rewriting a single byte in place generally means erasing and
//! reprogramming its whole page. `PageCache` keeps one page mirrored in RAM
//! and lets callers read and write arbitrary bytes; the page is committed to
//! the device (one erase, one full reprogram) only when an access moves to a
//! different page or when `PageCache::flush` is called.
//!
//! **Durability:** bytes written to the resident page live only in RAM until
//! they are flushed. Losing power before then loses them. Call `flush` before
//! any planned power-down.

#![cfg_attr(not(test), no_std)]

pub mod controller;
pub mod low_level;
pub mod record;

#[cfg(test)]
pub(crate) mod fake;

use core::borrow::BorrowMut;
use crate::low_level::{AccessError, Constants, Flash};

/// Write-back cache holding at most one flash page in RAM.
///
/// The buffer backing the cache is supplied by the caller so that it can live
/// wherever RAM is available (a `static`, the stack of `main`, ...).
///
/// Dropping the cache, or calling `into_inner`, discards any page that has
/// not been flushed.
pub struct PageCache<'b, F: Flash> {
    flash: F,
    slot: Slot<'b>,
}

/// What the page buffer currently holds. The buffer contents are only
/// reachable while `Bound`.
#[derive(Debug)]
enum Slot<'b> {
    /// No page is buffered; the buffer contents are meaningless.
    Empty(&'b mut [u8]),
    /// The buffer mirrors the page at `base`, possibly with changes that have
    /// not reached the device. Always treated as dirty.
    Bound { base: u32, page: &'b mut [u8] },
}

impl Default for Slot<'_> {
    fn default() -> Self {
        Slot::Empty(Default::default())
    }
}

impl<'b> Slot<'b> {
    /// Takes the buffer out, leaving a placeholder `Empty` behind.
    fn take_buffer(&mut self) -> &'b mut [u8] {
        match core::mem::take(self) {
            Slot::Empty(page) | Slot::Bound { page, .. } => page,
        }
    }

    fn resident(&self) -> Option<u32> {
        match self {
            Slot::Bound { base, .. } => Some(*base),
            Slot::Empty(_) => None,
        }
    }

    fn page(&self, base: u32) -> Option<&[u8]> {
        match self {
            Slot::Bound { base: b, page } if *b == base => Some(&page[..]),
            _ => None,
        }
    }

    fn page_mut(&mut self, base: u32) -> Option<&mut [u8]> {
        match self {
            Slot::Bound { base: b, page } if *b == base => Some(&mut page[..]),
            _ => None,
        }
    }
}

impl<'b, F: Flash> PageCache<'b, F> {
    /// Creates an empty cache over `flash`, using `buffer` as page storage.
    pub fn new(flash: F, buffer: &'b mut F::Page) -> Self {
        let page: &'b mut [u8] = buffer.borrow_mut();
        debug_assert_eq!(page.len(), Constants::<F>::PAGE_SIZE as usize);
        Self {
            flash,
            slot: Slot::Empty(page),
        }
    }

    /// Base address of the page currently held in RAM, if any.
    pub fn resident_page(&self) -> Option<u32> {
        self.slot.resident()
    }

    /// Shared access to the underlying device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Gives back the device. Any unflushed page is discarded.
    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Writes `value` at `addr`.
    ///
    /// Only the RAM copy of the page is changed. If `addr` lies in a different
    /// page than the one currently buffered, the buffered page is flushed and
    /// the new one loaded first.
    ///
    /// Writes to pages outside `F::WRITABLE` are ignored: the call succeeds
    /// and neither the cache nor the device changes.
    pub fn write_byte(
        &mut self,
        addr: u32,
        value: u8,
    ) -> Result<(), AccessError<F::Error>> {
        let (base, offset) = low_level::split_address::<F>(addr);
        if !low_level::is_writable_page::<F>(base) {
            log::debug!("ignoring write to protected address {addr:#x}");
            return Ok(());
        }

        if self.slot.resident() != Some(base) {
            self.load(base)?;
        }
        if let Some(page) = self.slot.page_mut(base) {
            page[offset] = value;
        }
        Ok(())
    }

    /// Reads the byte at `addr`.
    ///
    /// If `addr` is in the buffered page, the buffered value is returned
    /// without touching the device. Otherwise this is a raw device read, and
    /// does _not_ load the page into the cache.
    pub fn read_byte(&self, addr: u32) -> Result<u8, F::Error> {
        let (base, offset) = low_level::split_address::<F>(addr);
        match self.slot.page(base) {
            Some(page) => Ok(page[offset]),
            None => self.flash.read_byte(addr),
        }
    }

    /// Writes `data` starting at `addr`, one byte at a time through
    /// `write_byte`. A run crossing a page boundary flushes the first page
    /// when it moves on; bytes that land in protected pages are skipped.
    pub fn write_block(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> Result<(), AccessError<F::Error>> {
        check_span(addr, data.len())?;
        for (a, &byte) in (addr..).zip(data) {
            self.write_byte(a, byte)?;
        }
        Ok(())
    }

    /// Fills `out` with the bytes starting at `addr` as `read_byte` sees them.
    pub fn read_block(
        &self,
        addr: u32,
        out: &mut [u8],
    ) -> Result<(), AccessError<F::Error>> {
        check_span(addr, out.len())?;
        for (a, byte) in (addr..).zip(out.iter_mut()) {
            *byte = self.read_byte(a)?;
        }
        Ok(())
    }

    /// Commits the buffered page, if any, to the device by erasing it and
    /// reprogramming every byte from RAM. Afterwards the cache is empty.
    ///
    /// If the device fails part way, the page stays buffered so its contents
    /// are not lost, and the flush can be retried.
    pub fn flush(&mut self) -> Result<(), AccessError<F::Error>> {
        let base = match &self.slot {
            Slot::Bound { base, page } => {
                low_level::ram_to_flash(&mut self.flash, *base, page)?;
                *base
            }
            Slot::Empty(_) => return Ok(()),
        };
        log::trace!("flushed page {base:#x}");

        let page = self.slot.take_buffer();
        self.slot = Slot::Empty(page);
        Ok(())
    }

    /// Flushes whatever is buffered and then binds the page at `base`,
    /// reading its current contents from the device.
    fn load(&mut self, base: u32) -> Result<(), AccessError<F::Error>> {
        self.flush()?;

        let page = self.slot.take_buffer();
        match low_level::flash_to_ram(&self.flash, page, base) {
            Ok(()) => {
                log::trace!("loaded page {base:#x}");
                self.slot = Slot::Bound { base, page };
                Ok(())
            }
            Err(e) => {
                self.slot = Slot::Empty(page);
                Err(e)
            }
        }
    }
}

/// Rejects runs that would wrap around the end of the address space.
fn check_span<E>(addr: u32, len: usize) -> Result<(), AccessError<E>> {
    u32::try_from(len).ok()
        .and_then(|l| addr.checked_add(l))
        .map(|_| ())
        .ok_or(AccessError::OutOfBounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeFlash, Op};

    const N: usize = 512;
    type F = FakeFlash<N>;

    // Writable pages of FakeFlash<512>.
    const P: u32 = 0x400;
    const Q: u32 = 0x600;
    const R: u32 = 0x800;

    #[test]
    fn starts_empty() {
        let mut buf = [0u8; N];
        let cache = PageCache::new(F::new(), &mut buf);
        assert_eq!(cache.resident_page(), None);
    }

    #[test]
    fn read_after_write_before_and_after_flush() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);

        cache.write_byte(P + 7, 0x3c).unwrap();
        assert_eq!(cache.read_byte(P + 7).unwrap(), 0x3c);
        assert_eq!(cache.resident_page(), Some(P));

        cache.flush().unwrap();
        assert_eq!(cache.resident_page(), None);
        assert_eq!(cache.read_byte(P + 7).unwrap(), 0x3c);
        assert_eq!(cache.flash().peek(P + 7, 1), &[0x3c]);
    }

    #[test]
    fn write_can_set_bits_again() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);

        cache.write_byte(P, 0x00).unwrap();
        cache.flush().unwrap();
        cache.write_byte(P, 0xA5).unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.flash().peek(P, 1), &[0xA5]);
    }

    #[test]
    fn writes_stay_in_ram_until_flush() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);

        cache.write_byte(P + 1, 0x11).unwrap();
        assert_eq!(cache.flash().peek(P + 1, 1), &[0xFF]);
        assert_eq!(cache.flash().erases(), 0);
        assert_eq!(cache.flash().programs(), 0);
    }

    #[test]
    fn same_page_writes_coalesce() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);

        for i in 0..100u32 {
            cache.write_byte(P + i * 3, i as u8).unwrap();
        }
        assert_eq!(cache.flash().erases(), 0);

        cache.flush().unwrap();
        assert_eq!(cache.flash().erase_log(), vec![P]);
        assert_eq!(cache.flash().programs(), N);

        // A second flush with nothing bound does nothing.
        cache.flush().unwrap();
        assert_eq!(cache.flash().erases(), 1);
        assert_eq!(cache.flash().programs(), N);
    }

    #[test]
    fn page_change_flushes_whole_old_page_before_loading() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);

        cache.write_byte(P + 5, 0x55).unwrap();
        let mut flash = cache.into_inner();
        flash.clear_log();
        let mut cache = PageCache::new(flash, &mut buf);

        cache.write_byte(P + 5, 0x55).unwrap();
        cache.write_byte(Q + 9, 0x99).unwrap();

        let log = cache.flash().log();
        // Load of P: N reads.
        assert!(log[..N].iter().all(|op| matches!(op, Op::Read(_))));
        // Then erase P and reprogram all of it from the buffer.
        assert_eq!(log[N], Op::Erase(P));
        let programs = &log[N + 1..2 * N + 1];
        for (i, op) in programs.iter().enumerate() {
            let expected = if i == 5 { 0x55 } else { 0xFF };
            assert_eq!(*op, Op::Program(P + i as u32, expected));
        }
        // Only then is Q read in.
        let loads = &log[2 * N + 1..];
        assert_eq!(loads.len(), N);
        assert_eq!(loads[0], Op::Read(Q));

        assert_eq!(cache.resident_page(), Some(Q));
        assert_eq!(cache.flash().peek(P + 5, 1), &[0x55]);
    }

    #[test]
    fn resident_reads_do_not_touch_device() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);

        cache.write_byte(P, 0x12).unwrap();
        let reads = cache.flash().reads();
        for i in 0..N as u32 {
            cache.read_byte(P + i).unwrap();
        }
        assert_eq!(cache.flash().reads(), reads);
        // The device still says 0xFF; the cache disagrees, and wins.
        assert_eq!(cache.flash().peek(P, 1), &[0xFF]);
        assert_eq!(cache.read_byte(P).unwrap(), 0x12);
    }

    #[test]
    fn non_resident_reads_go_to_device_without_loading() {
        let mut flash = F::new();
        flash.poke(Q + 3, &[0x42]);
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(flash, &mut buf);

        cache.write_byte(P, 0).unwrap();
        assert_eq!(cache.read_byte(Q + 3).unwrap(), 0x42);
        assert_eq!(cache.resident_page(), Some(P));
    }

    #[test]
    fn evicted_page_reads_come_from_device() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);

        cache.write_byte(P + 2, 0x22).unwrap();
        cache.write_byte(Q, 0x01).unwrap();
        assert_eq!(cache.resident_page(), Some(Q));

        // Change P behind the cache's back; a stale buffer would hide this.
        let mut flash = cache.into_inner();
        flash.poke(P + 2, &[0x20]);
        let mut cache = PageCache::new(flash, &mut buf);
        cache.write_byte(Q, 0x01).unwrap();

        assert_eq!(cache.read_byte(P + 2).unwrap(), 0x20);
    }

    #[test]
    fn pages_are_isolated() {
        let mut flash = F::new();
        flash.poke(Q, &[1, 2, 3, 4]);
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(flash, &mut buf);

        for i in 0..N as u32 {
            cache.write_byte(P + i, 0).unwrap();
        }
        assert_eq!(cache.read_byte(Q).unwrap(), 1);

        // Touching Q flushes P.
        cache.write_byte(Q + 100, 0x77).unwrap();
        let mut q = [0u8; 4];
        cache.read_block(Q, &mut q).unwrap();
        assert_eq!(q, [1, 2, 3, 4]);
        cache.flush().unwrap();
        assert_eq!(cache.flash().peek(Q, 4), &[1, 2, 3, 4]);
        assert_eq!(cache.flash().peek(R, 4), &[0xFF; 4]);
    }

    #[test]
    fn protected_writes_are_ignored() {
        let mut flash = F::new();
        flash.poke(0x10, &[0x5a]);
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(flash, &mut buf);

        cache.write_byte(0x10, 0x00).unwrap();
        assert_eq!(cache.resident_page(), None);
        assert_eq!(cache.read_byte(0x10).unwrap(), 0x5a);

        // Also while another page is bound.
        cache.write_byte(P, 0x01).unwrap();
        cache.write_byte(0xE00, 0x00).unwrap();
        assert_eq!(cache.resident_page(), Some(P));
        assert_eq!(cache.flash().erases(), 0);
        assert_eq!(cache.flash().programs(), 0);
        assert_eq!(cache.read_byte(0xE00).unwrap(), 0xFF);
    }

    #[test]
    fn block_write_crosses_pages() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);

        let data: Vec<u8> = (0..16).collect();
        cache.write_block(Q - 8, &data).unwrap();
        assert_eq!(cache.resident_page(), Some(Q));
        assert_eq!(cache.flash().erase_log(), vec![P]);

        let mut out = [0u8; 16];
        cache.read_block(Q - 8, &mut out).unwrap();
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn block_write_skips_protected_bytes() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);

        cache.write_block(P - 2, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        cache.read_block(P - 2, &mut out).unwrap();
        assert_eq!(out, [0xFF, 0xFF, 3, 4]);
    }

    #[test]
    fn block_span_overflow_rejected() {
        let mut buf = [0u8; N];
        let mut cache = PageCache::new(F::new(), &mut buf);
        assert_eq!(
            cache.write_block(u32::MAX, &[0, 0]),
            Err(AccessError::OutOfBounds),
        );
    }

    #[test]
    fn failed_flush_keeps_page() {
        let mut buf = [0u8; N];
        let mut flash = F::new();
        flash.fail_programs_after(10);
        let mut cache = PageCache::new(flash, &mut buf);

        cache.write_byte(P + 1, 0x01).unwrap();
        assert!(matches!(cache.flush(), Err(AccessError::Flash(_))));
        assert_eq!(cache.resident_page(), Some(P));
        assert_eq!(cache.read_byte(P + 1).unwrap(), 0x01);

        // Switching pages also fails rather than losing P.
        assert!(cache.write_byte(Q, 0).is_err());
        assert_eq!(cache.resident_page(), Some(P));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const SPAN: u32 = N as u32 * crate::fake::PAGES as u32;

        #[derive(Clone, Debug)]
        enum Action {
            Write(u32, u8),
            Flush,
        }

        fn action() -> impl Strategy<Value = Action> {
            prop_oneof![
                8 => (0..SPAN, any::<u8>()).prop_map(|(a, v)| Action::Write(a, v)),
                1 => Just(Action::Flush),
            ]
        }

        proptest! {
            #[test]
            fn cache_matches_model(actions in prop::collection::vec(action(), 1..200)) {
                let mut buf = [0u8; N];
                let mut cache = PageCache::new(F::new(), &mut buf);
                let mut model = vec![0xFFu8; SPAN as usize];

                for action in &actions {
                    match *action {
                        Action::Write(a, v) => {
                            cache.write_byte(a, v).unwrap();
                            if low_level::is_writable_page::<F>(low_level::page_base::<F>(a)) {
                                model[a as usize] = v;
                            }
                            prop_assert_eq!(cache.read_byte(a).unwrap(), model[a as usize]);
                        }
                        Action::Flush => cache.flush().unwrap(),
                    }
                }

                for a in 0..SPAN {
                    prop_assert_eq!(cache.read_byte(a).unwrap(), model[a as usize]);
                }
                cache.flush().unwrap();
                prop_assert_eq!(cache.flash().peek(0, SPAN as usize), &model[..]);
            }
        }
    }
}
