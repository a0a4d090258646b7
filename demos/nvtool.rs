// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::ops::Range;
use clap::Parser;
use anyhow::{Context, anyhow, bail};
use rustyline::error::ReadlineError;
use std::cell::RefCell;
use std::io::{Seek, Read, Write, SeekFrom};
use mneme::PageCache;
use mneme::low_level::{self, Flash};
use mneme::record::{self, RecordKind};

const PAGE_SIZE: usize = 512;
const IMAGE_SIZE: u64 = 0x1_0000;

#[derive(Parser)]
struct Nvtool {
    #[clap(subcommand)]
    cmd: Cmd,

    image_file: std::path::PathBuf,
}

#[derive(Parser)]
enum Cmd {
    /// Hex dump bytes as the cache sees them.
    Read {
        #[clap(parse(try_from_str = parse_addr))]
        addr: u32,
        #[clap(default_value = "64")]
        len: usize,
    },
    /// Write text at an address and flush.
    Write {
        #[clap(parse(try_from_str = parse_addr))]
        addr: u32,
        text: String,
    },
    /// Erase the page containing an address.
    Erase {
        #[clap(parse(try_from_str = parse_addr))]
        addr: u32,
    },
    /// Store a checksummed record and flush.
    Put {
        #[clap(parse(try_from_str = parse_addr))]
        addr: u32,
        #[clap(arg_enum)]
        kind: ArgKind,
        text: String,
    },
    /// Load and verify a record.
    Get {
        #[clap(parse(try_from_str = parse_addr))]
        addr: u32,
    },
    /// Interactive session; the cache lives until exit.
    Shell,
}

#[derive(Copy, Clone, Debug, clap::ArgEnum)]
enum ArgKind {
    Settings,
    Calibration,
}

impl From<ArgKind> for RecordKind {
    fn from(a: ArgKind) -> Self {
        match a {
            ArgKind::Settings => Self::Settings,
            ArgKind::Calibration => Self::Calibration,
        }
    }
}

fn parse_addr(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Nvtool::parse();

    let img = FlashImage::open(&args.image_file)
        .with_context(|| {
            format!("opening image file {}", args.image_file.display())
        })?;
    let mut buffer = [0; PAGE_SIZE];
    let mut cache = PageCache::new(img, &mut buffer);

    match args.cmd {
        Cmd::Read { addr, len } => {
            let mut out = vec![0; len];
            cache.read_block(addr, &mut out)
                .map_err(|e| anyhow!("read failed: {e:?}"))?;
            println!("{}", pretty_hex::pretty_hex(&out));
        }
        Cmd::Write { addr, text } => {
            if !low_level::is_writable_range::<FlashImage>(addr, text.len()) {
                println!("note: bytes outside {:#x?} will be dropped", FlashImage::WRITABLE);
            }
            cache.write_block(addr, text.as_bytes())
                .map_err(|e| anyhow!("write failed: {e:?}"))?;
            cache.flush()
                .map_err(|e| anyhow!("flush failed: {e:?}"))?;
            println!("ok");
        }
        Cmd::Erase { addr } => {
            let base = low_level::page_base::<FlashImage>(addr);
            println!("erasing page {base:#06x}");
            let mut img = cache.into_inner();
            img.erase_page(base)?;
        }
        Cmd::Put { addr, kind, text } => {
            match record::store(&mut cache, addr, kind.into(), text.as_bytes()) {
                Ok(()) => {
                    cache.flush()
                        .map_err(|e| anyhow!("flush failed: {e:?}"))?;
                    println!("ok");
                }
                Err(e) => println!("error: {e:?}"),
            }
        }
        Cmd::Get { addr } => {
            let mut out = [0; u16::MAX as usize];
            match record::load(&cache, addr, &mut out) {
                Ok(info) => {
                    println!("{:?} record, {} bytes", info.kind, info.length);
                    println!("{}", pretty_hex::pretty_hex(&&out[..usize::from(info.length)]));
                }
                Err(e) => println!("error: {e:?}"),
            }
        }
        Cmd::Shell => shell(&mut cache)?,
    }

    Ok(())
}

fn shell(cache: &mut PageCache<'_, FlashImage>) -> Result<(), anyhow::Error> {
    let mut rl = rustyline::Editor::<()>::new()?;
    println!("commands: r ADDR [LEN] | w ADDR TEXT | f | res | q");

    loop {
        match rl.readline(">> ") {
            Ok(line) => {
                rl.add_history_entry(line.as_str());
                match shell_command(cache, line.trim()) {
                    Ok(true) => (),
                    Ok(false) => break,
                    Err(e) => println!("error: {e:#}"),
                }
            }
            Err(ReadlineError::Eof) => break,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(ReadlineError::Io(e)) => return Err(e.into()),
            Err(e) => {
                println!("unexpected error: {e:?}");
                break;
            }
        }
    }

    println!("flushing and exiting.");
    cache.flush().map_err(|e| anyhow!("flush failed: {e:?}"))?;
    Ok(())
}

/// Runs one shell line. Returns `Ok(false)` when the user asks to quit.
fn shell_command(
    cache: &mut PageCache<'_, FlashImage>,
    line: &str,
) -> Result<bool, anyhow::Error> {
    let mut words = line.splitn(3, ' ');
    match words.next() {
        Some("r") => {
            let addr = next_addr(&mut words)?;
            let len = match words.next() {
                Some(n) => n.parse()?,
                None => 16,
            };
            let mut out = vec![0; len];
            cache.read_block(addr, &mut out)
                .map_err(|e| anyhow!("read failed: {e:?}"))?;
            println!("{}", pretty_hex::pretty_hex(&out));
        }
        Some("w") => {
            let addr = next_addr(&mut words)?;
            let text = words.next().unwrap_or("");
            cache.write_block(addr, text.as_bytes())
                .map_err(|e| anyhow!("write failed: {e:?}"))?;
        }
        Some("f") => {
            cache.flush().map_err(|e| anyhow!("flush failed: {e:?}"))?;
        }
        Some("res") => match cache.resident_page() {
            Some(base) => println!("page {base:#06x} buffered (unflushed)"),
            None => println!("nothing buffered"),
        },
        Some("q") => return Ok(false),
        Some("") | None => (),
        Some(other) => bail!("unknown command {other:?}"),
    }
    Ok(true)
}

fn next_addr<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<u32, anyhow::Error> {
    let word = words.next().ok_or_else(|| anyhow!("missing address"))?;
    Ok(parse_addr(word)?)
}

/// A 64 KiB flash image file that behaves like the real part: 512-byte
/// pages, the top 4 KiB writable, and programming that can only clear bits.
struct FlashImage {
    file: RefCell<std::fs::File>,
}

impl FlashImage {
    fn open(path: impl AsRef<std::path::Path>) -> Result<Self, anyhow::Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        if file_len != IMAGE_SIZE {
            bail!("image must be exactly {IMAGE_SIZE} bytes, not {file_len}");
        }

        Ok(Self {
            file: file.into(),
        })
    }

    fn check_writable(addr: u32) -> std::io::Result<()> {
        if Self::WRITABLE.contains(&addr) {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("address {addr:#x} is protected"),
            ))
        }
    }
}

impl Flash for FlashImage {
    type Page = [u8; PAGE_SIZE];
    type Error = std::io::Error;

    const WRITABLE: Range<u32> = 0xF000..0x1_0000;

    fn erase_page(&mut self, base: u32) -> Result<(), Self::Error> {
        Self::check_writable(base)?;
        let base = low_level::page_base::<Self>(base);
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(base)))?;
        file.write_all(&[0xFF; PAGE_SIZE])?;
        Ok(())
    }

    fn program_byte(&mut self, addr: u32, value: u8) -> Result<(), Self::Error> {
        Self::check_writable(addr)?;
        let old = self.read_byte(addr)?;
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.write_all(&[old & value])?;
        Ok(())
    }

    fn read_byte(&self, addr: u32) -> Result<u8, Self::Error> {
        let mut b = [0];
        self.read_into(addr, &mut b)?;
        Ok(b[0])
    }

    fn read_into(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.read_exact(dest)?;
        Ok(())
    }
}
