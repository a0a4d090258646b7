// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the on-chip flash controller of C8051F34x-family parts.
//!
//! These parts erase in 512-byte pages and program a byte at a time. Every
//! erase or program must be preceded by writing a two-byte key to `FLKEY`;
//! a wrong key (or a flash write without one) locks the controller out until
//! the next reset. The key sequence is timing sensitive, so interrupts are
//! masked for the whole operation.
//!
//! The registers themselves are reached through the `Registers` trait, which
//! a board support layer implements with real SFR accesses.

use core::ops::{Deref, DerefMut, Range};
use crate::low_level::{self, Flash};

/// Bytes per flash page.
pub const PAGE_SIZE: usize = 512;

/// First `FLKEY` unlock byte.
pub const FLKEY_FIRST: u8 = 0xA5;
/// Second `FLKEY` unlock byte.
pub const FLKEY_SECOND: u8 = 0xF1;

/// `FLKEY` lock status (low two bits when read): no key written yet.
pub const FLKEY_LOCKED: u8 = 0b00;
/// `FLKEY` lock status: both keys accepted, one write or erase is allowed.
pub const FLKEY_UNLOCKED: u8 = 0b10;
/// `FLKEY` lock status: a bad key was written; locked until reset.
pub const FLKEY_LOCKED_OUT: u8 = 0b11;

/// `PSCTL` bit redirecting MOVX stores to flash.
pub const PSCTL_PSWE: u8 = 0x01;
/// `PSCTL` bit turning a redirected store into a page erase.
pub const PSCTL_PSEE: u8 = 0x02;

/// `PFE0CN` flash block write enable. Must be clear for single-byte writes.
pub const PFE0CN_FLBWE: u8 = 0x01;

/// Access to the special function registers involved in flash writes.
pub trait Registers {
    /// Sets the global interrupt enable (`EA`), returning its previous value.
    fn set_interrupts(&mut self, enabled: bool) -> bool;

    fn write_flkey(&mut self, value: u8);
    fn read_flkey(&self) -> u8;

    fn write_psctl(&mut self, value: u8);

    fn read_pfe0cn(&self) -> u8;
    fn write_pfe0cn(&mut self, value: u8);

    /// `MOVX` store into external data space. While `PSCTL_PSWE` is set this
    /// goes to flash instead.
    fn movx_write(&mut self, addr: u16, value: u8);

    /// `MOVC` load from code space, i.e. a flash read.
    fn movc_read(&self, addr: u16) -> u8;
}

/// Keeps interrupts masked for as long as it lives, and puts the interrupt
/// enable back the way it found it when dropped.
pub struct Masked<'a, R: Registers> {
    regs: &'a mut R,
    was_enabled: bool,
}

impl<'a, R: Registers> Masked<'a, R> {
    pub fn new(regs: &'a mut R) -> Self {
        let was_enabled = regs.set_interrupts(false);
        Self { regs, was_enabled }
    }
}

impl<R: Registers> Deref for Masked<'_, R> {
    type Target = R;
    fn deref(&self) -> &R {
        &*self.regs
    }
}

impl<R: Registers> DerefMut for Masked<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut *self.regs
    }
}

impl<R: Registers> Drop for Masked<'_, R> {
    fn drop(&mut self) {
        self.regs.set_interrupts(self.was_enabled);
    }
}

/// Things the flash controller driver can refuse to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerError {
    /// The address (given) is outside the user-writable pages.
    Protected(u32),
    /// The address (given) does not fit the 16-bit code space.
    OutOfRange(u32),
    /// The controller did not report itself unlocked after the key sequence
    /// (given: `FLKEY` status). This is fatal: the controller stays locked
    /// until reset, and the driver refuses all further erases and programs.
    KeyRejected(u8),
}

/// Flash device backed by the on-chip controller.
pub struct C8051Flash<R> {
    regs: R,
    locked_out: bool,
}

impl<R: Registers> C8051Flash<R> {
    pub fn new(regs: R) -> Self {
        Self { regs, locked_out: false }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn into_inner(self) -> R {
        self.regs
    }

    /// Whether an earlier key rejection has disabled writes.
    pub fn is_locked_out(&self) -> bool {
        self.locked_out
    }

    /// Validates a write target and converts it to a code-space address.
    fn write_target(&self, addr: u32) -> Result<u16, ControllerError> {
        if self.locked_out {
            return Err(ControllerError::KeyRejected(FLKEY_LOCKED_OUT));
        }
        let target = u16::try_from(addr)
            .map_err(|_| ControllerError::OutOfRange(addr))?;
        if !low_level::is_writable_page::<Self>(low_level::page_base::<Self>(addr)) {
            return Err(ControllerError::Protected(addr));
        }
        Ok(target)
    }

    fn record(&mut self, r: Result<(), ControllerError>) -> Result<(), ControllerError> {
        if let Err(ControllerError::KeyRejected(status)) = r {
            log::error!("flash key rejected (FLKEY status {status:#04b}); writes disabled");
            self.locked_out = true;
        }
        r
    }
}

/// Writes the key sequence and checks that the controller accepted it.
fn unlock<R: Registers>(regs: &mut R) -> Result<(), ControllerError> {
    regs.write_flkey(FLKEY_FIRST);
    regs.write_flkey(FLKEY_SECOND);
    let status = regs.read_flkey() & 0b11;
    if status == FLKEY_UNLOCKED {
        Ok(())
    } else {
        Err(ControllerError::KeyRejected(status))
    }
}

impl<R: Registers> Flash for C8051Flash<R> {
    type Page = [u8; PAGE_SIZE];
    type Error = ControllerError;

    // The top 4 KiB of code space: pages 0xF000 through 0xFE00.
    const WRITABLE: Range<u32> = 0xF000..0x1_0000;

    fn erase_page(&mut self, base: u32) -> Result<(), Self::Error> {
        let target = self.write_target(base)?;
        let r = {
            let mut regs = Masked::new(&mut self.regs);
            unlock(&mut *regs).map(|()| {
                regs.write_psctl(PSCTL_PSEE | PSCTL_PSWE);
                regs.movx_write(target, 0xFF);
                regs.write_psctl(0);
            })
        };
        self.record(r)
    }

    fn program_byte(&mut self, addr: u32, value: u8) -> Result<(), Self::Error> {
        let target = self.write_target(addr)?;
        let r = {
            let mut regs = Masked::new(&mut self.regs);
            let pfe0cn = regs.read_pfe0cn();
            regs.write_pfe0cn(pfe0cn & !PFE0CN_FLBWE);
            regs.write_psctl(PSCTL_PSWE);
            let r = unlock(&mut *regs).map(|()| {
                regs.movx_write(target, value);
            });
            regs.write_psctl(0);
            r
        };
        self.record(r)
    }

    fn read_byte(&self, addr: u32) -> Result<u8, Self::Error> {
        let target = u16::try_from(addr)
            .map_err(|_| ControllerError::OutOfRange(addr))?;
        Ok(self.regs.movc_read(target))
    }
}
