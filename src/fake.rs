// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory flash device for tests.

use core::cell::RefCell;
use core::ops::Range;
use crate::low_level::Flash;

/// Number of pages in a `FakeFlash`.
pub const PAGES: usize = 8;

/// One device operation, as recorded in the fake's log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Erase(u32),
    Program(u32, u8),
    Read(u32),
}

/// Flash with `PAGES` pages of `N` bytes. Pages 2 through 5 are writable;
/// the two pages at either end are protected and any attempt to erase or
/// program them is an error.
pub struct FakeFlash<const N: usize> {
    bytes: Vec<u8>,
    log: RefCell<Vec<Op>>,
    programs_left: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FakeFlashError {
    Protected(u32),
    Injected,
}

impl<const N: usize> FakeFlash<N> {
    /// Creates a fake with every byte erased.
    pub fn new() -> Self {
        Self {
            bytes: vec![0xFF; N * PAGES],
            log: RefCell::new(Vec::new()),
            programs_left: None,
        }
    }

    /// Sets bytes directly, bypassing erase/program rules and the log.
    pub fn poke(&mut self, addr: u32, data: &[u8]) {
        let a = addr as usize;
        self.bytes[a..a + data.len()].copy_from_slice(data);
    }

    pub fn peek(&self, addr: u32, len: usize) -> &[u8] {
        let a = addr as usize;
        &self.bytes[a..a + len]
    }

    pub fn log(&self) -> Vec<Op> {
        self.log.borrow().clone()
    }

    pub fn clear_log(&mut self) {
        self.log.get_mut().clear();
    }

    pub fn erase_log(&self) -> Vec<u32> {
        self.log.borrow().iter()
            .filter_map(|op| match op {
                Op::Erase(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    pub fn erases(&self) -> usize {
        self.erase_log().len()
    }

    pub fn programs(&self) -> usize {
        self.log.borrow().iter()
            .filter(|op| matches!(op, Op::Program(..)))
            .count()
    }

    pub fn reads(&self) -> usize {
        self.log.borrow().iter()
            .filter(|op| matches!(op, Op::Read(_)))
            .count()
    }

    /// Makes every program after the next `n` fail.
    pub fn fail_programs_after(&mut self, n: usize) {
        self.programs_left = Some(n);
    }

    fn check_writable(addr: u32) -> Result<(), FakeFlashError> {
        if Self::WRITABLE.contains(&addr) {
            Ok(())
        } else {
            Err(FakeFlashError::Protected(addr))
        }
    }
}

impl<const N: usize> Flash for FakeFlash<N> {
    type Page = [u8; N];
    type Error = FakeFlashError;

    const WRITABLE: Range<u32> = (2 * N) as u32..(6 * N) as u32;

    fn erase_page(&mut self, base: u32) -> Result<(), Self::Error> {
        Self::check_writable(base)?;
        let start = base as usize / N * N;
        self.bytes[start..start + N].fill(0xFF);
        self.log.get_mut().push(Op::Erase(base));
        Ok(())
    }

    fn program_byte(&mut self, addr: u32, value: u8) -> Result<(), Self::Error> {
        Self::check_writable(addr)?;
        if let Some(left) = &mut self.programs_left {
            if *left == 0 {
                return Err(FakeFlashError::Injected);
            }
            *left -= 1;
        }
        self.bytes[addr as usize] &= value;
        self.log.get_mut().push(Op::Program(addr, value));
        Ok(())
    }

    fn read_byte(&self, addr: u32) -> Result<u8, Self::Error> {
        self.log.borrow_mut().push(Op::Read(addr));
        Ok(self.bytes[addr as usize])
    }
}
