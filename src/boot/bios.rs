//! BIOS ROM, VGA ROM tags, IVT, and E820 map.
//!
//! Real-mode guest firmware is not executed code generated by this
//! crate; it is a handful of fixed memory regions a real-mode kernel
//! expects to find populated before it looks at them, plus a real-mode
//! interrupt vector table pointing IRQ 0x10/0x15 at stub handlers that
//! simply `iret`.
//!
//! ```text
//! 0x00000000  IVT (1 KiB)
//! 0x00000400  BDA (256 B)
//! 0x0009FC00  EBDA (1 KiB) -- E820 map lives at EBDA_START + 8
//! 0x000A0000  VGA display buffer window
//! 0x000C0000  VGA ROM (32 KiB)
//! 0x000F0000  BIOS ROM (64 KiB)
//! 0x00100000  protected-mode kernel image
//! ```

use super::memory::{MemoryError, GAP_SIZE, GAP_START};
use super::GuestMemory;
use thiserror::Error;
use tracing::debug;

pub const REAL_MODE_IVT_BEGIN: u64 = 0x0000_0000;
pub const IVT_SIZE: usize = 1024;

pub const BDA_START: u64 = 0x0000_0400;
const BDA_SIZE: usize = 256;

pub const EBDA_START: u64 = 0x0009_fc00;
const EBDA_SIZE: usize = 1024;

pub const E820_MAP_START: u64 = EBDA_START + 0x8;
const E820_MAX_ENTRIES: usize = 128;

pub const VGA_RAM_BEGIN: u64 = 0x000a_0000;
pub const VGA_ROM_BEGIN: u64 = 0x000c_0000;
const VGA_ROM_SIZE: usize = 32 * 1024;
const VGA_ROM_OEM_STRING_OFFSET: u64 = 0x1a;
const VGA_ROM_OEM_STRING_SIZE: usize = 16;
const VGA_ROM_MODES_OFFSET: u64 = 0x0a;

pub const MB_BIOS_BEGIN: u64 = 0x000f_0000;
const MB_BIOS_SIZE: usize = 64 * 1024;

pub const BZ_KERNEL_START: u64 = 0x0010_0000;

const E820_RAM: u32 = 1;
const E820_RESERVED: u32 = 2;

/// A fake interrupt stub: one `iret` (0xCF) instruction.
const BIOS_INTFAKE: &[u8] = &[0xcf];
/// INT 0x10 AH=0x0E (teletype output): forwards AL to the UART at 0x3f8
/// so a real-mode bootloader's early status prints reach the console
/// before protected mode and the guest's own drivers take over. Any
/// other AH falls straight through to `iret`.
const BIOS_INT10: &[u8] = &[
    0x80, 0xfc, 0x0e, // cmp ah, 0x0e
    0x75, 0x04, // jne +4 (to iret)
    0xba, 0xf8, 0x03, // mov dx, 0x3f8
    0xee, // out dx, al
    0xcf, // iret
];
/// INT 0x15 (system services) stub also just `iret`; nothing in this
/// core emulates E820/APM calls, the guest reads the E820 map we wrote
/// directly instead of calling back into BIOS for it.
const BIOS_INT15: &[u8] = &[0xcf];

const BIOS_INTFAKE_OFFSET: u64 = 0x0000;
const BIOS_INT10_OFFSET: u64 = 0x0010;
const BIOS_INT15_OFFSET: u64 = 0x0020;

#[derive(Error, Debug)]
pub enum BiosError {
    #[error("bios memory access failed: {0}")]
    Memory(#[from] MemoryError),
    #[error("too many e820 entries ({0}), max {E820_MAX_ENTRIES}")]
    TooManyE820Entries(usize),
}

/// A 4-byte real-mode interrupt descriptor: `(offset, segment)`.
#[derive(Clone, Copy, Default)]
#[repr(C, packed)]
struct RealIntrDesc {
    offset: u16,
    segment: u16,
}

/// 256-entry IVT, built in host memory and copied to guest physical 0
/// in a single write.
struct InterruptTable {
    entries: [RealIntrDesc; 256],
}

impl InterruptTable {
    fn new(default: RealIntrDesc) -> Self {
        Self {
            entries: [default; 256],
        }
    }

    fn set(&mut self, vector: u8, entry: RealIntrDesc) {
        self.entries[vector as usize] = entry;
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: RealIntrDesc is repr(C, packed) of two u16s, so the
        // whole array has no padding and is safely viewable as bytes.
        unsafe {
            std::slice::from_raw_parts(
                self.entries.as_ptr() as *const u8,
                std::mem::size_of_val(&self.entries),
            )
        }
    }
}

fn write_irq_handler(
    memory: &GuestMemory,
    itable: &mut InterruptTable,
    vector: u8,
    offset_in_rom: u64,
    code: &[u8],
) -> Result<(), BiosError> {
    let address = MB_BIOS_BEGIN + offset_in_rom;
    memory.write(address, code)?;
    itable.set(
        vector,
        RealIntrDesc {
            segment: (MB_BIOS_BEGIN >> 4) as u16,
            offset: (address - MB_BIOS_BEGIN) as u16,
        },
    );
    Ok(())
}

fn setup_vga_rom(memory: &GuestMemory) -> Result<(), BiosError> {
    let mut oem = [0u8; VGA_ROM_OEM_STRING_SIZE];
    let banner = b"KVM VESA";
    oem[..banner.len()].copy_from_slice(banner);
    memory.write(VGA_ROM_BEGIN + VGA_ROM_OEM_STRING_OFFSET, &oem)?;

    memory.write_u16(VGA_ROM_BEGIN + VGA_ROM_MODES_OFFSET, 0x0112)?;
    memory.write_u16(VGA_ROM_BEGIN + VGA_ROM_MODES_OFFSET + 2, 0xffff)?;
    Ok(())
}

struct E820Writer {
    entries: Vec<(u64, u64, u32)>,
}

impl E820Writer {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn push(&mut self, addr: u64, size: u64, kind: u32) -> Result<(), BiosError> {
        if self.entries.len() >= E820_MAX_ENTRIES {
            return Err(BiosError::TooManyE820Entries(self.entries.len() + 1));
        }
        self.entries.push((addr, size, kind));
        Ok(())
    }

    fn write(&self, memory: &GuestMemory) -> Result<(), BiosError> {
        // nr_map: u32 followed by up to 128 (addr: u64, size: u64, type: u32) entries.
        memory.write_u32(E820_MAP_START, self.entries.len() as u32)?;
        let mut offset = E820_MAP_START + 8; // align like the original struct's padding
        for &(addr, size, kind) in &self.entries {
            memory.write_u64(offset, addr)?;
            memory.write_u64(offset + 8, size)?;
            memory.write_u32(offset + 16, kind)?;
            offset += 20;
        }
        Ok(())
    }
}

fn setup_e820(memory: &GuestMemory, ram_size: u64) -> Result<(), BiosError> {
    let mut writer = E820Writer::new();

    writer.push(
        REAL_MODE_IVT_BEGIN,
        EBDA_START - REAL_MODE_IVT_BEGIN,
        E820_RAM,
    )?;
    writer.push(EBDA_START, VGA_RAM_BEGIN - EBDA_START, E820_RESERVED)?;
    writer.push(MB_BIOS_BEGIN, MB_BIOS_SIZE as u64, E820_RESERVED)?;

    if ram_size < GAP_START {
        writer.push(BZ_KERNEL_START, ram_size - BZ_KERNEL_START, E820_RAM)?;
    } else {
        writer.push(BZ_KERNEL_START, GAP_START - BZ_KERNEL_START, E820_RAM)?;
        let high_start = GAP_START + GAP_SIZE;
        writer.push(high_start, ram_size - GAP_START, E820_RAM)?;
    }

    writer.write(memory)
}

/// Populate BDA, EBDA, VGA ROM, BIOS ROM, E820 map, and IVT in guest
/// memory. Must run after guest RAM is allocated but before the first
/// vCPU reset.
pub fn setup_bios(memory: &GuestMemory, ram_size: u64) -> Result<(), BiosError> {
    memory.write(BDA_START, &vec![0u8; BDA_SIZE])?;
    memory.write(EBDA_START, &vec![0u8; EBDA_SIZE])?;
    memory.write(MB_BIOS_BEGIN, &vec![0u8; MB_BIOS_SIZE])?;
    memory.write(VGA_ROM_BEGIN, &vec![0u8; VGA_ROM_SIZE])?;
    debug!("bios: zeroed BDA/EBDA/BIOS ROM/VGA ROM regions");

    setup_e820(memory, ram_size)?;
    setup_vga_rom(memory)?;

    let fake_desc = RealIntrDesc {
        segment: (MB_BIOS_BEGIN >> 4) as u16,
        offset: BIOS_INTFAKE_OFFSET as u16,
    };
    memory.write(MB_BIOS_BEGIN + BIOS_INTFAKE_OFFSET, BIOS_INTFAKE)?;
    let mut itable = InterruptTable::new(fake_desc);

    write_irq_handler(memory, &mut itable, 0x10, BIOS_INT10_OFFSET, BIOS_INT10)?;
    write_irq_handler(memory, &mut itable, 0x15, BIOS_INT15_OFFSET, BIOS_INT15)?;

    memory.write(REAL_MODE_IVT_BEGIN, itable.as_bytes())?;
    debug!("bios: ivt installed, e820 map and vga rom tags written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ivt_round_trips_default_entry() {
        let mem = GuestMemory::new(4 * 1024 * 1024).unwrap();
        setup_bios(&mem, 4 * 1024 * 1024).unwrap();

        let mut raw = [0u8; 4];
        mem.read(REAL_MODE_IVT_BEGIN + 0x10 * 4, &mut raw).unwrap();
        let offset = u16::from_le_bytes([raw[0], raw[1]]);
        let segment = u16::from_le_bytes([raw[2], raw[3]]);
        assert_eq!(segment, (MB_BIOS_BEGIN >> 4) as u16);
        assert_eq!(offset as u64, BIOS_INT10_OFFSET);
    }

    #[test]
    fn int10_handler_writes_al_to_uart_on_teletype() {
        let mem = GuestMemory::new(4 * 1024 * 1024).unwrap();
        setup_bios(&mem, 4 * 1024 * 1024).unwrap();

        let mut code = [0u8; BIOS_INT10.len()];
        mem.read(MB_BIOS_BEGIN + BIOS_INT10_OFFSET, &mut code).unwrap();
        assert_eq!(code, *BIOS_INT10);
    }

    #[test]
    fn vga_rom_oem_string_and_modes() {
        let mem = GuestMemory::new(4 * 1024 * 1024).unwrap();
        setup_bios(&mem, 4 * 1024 * 1024).unwrap();

        let mut oem = [0u8; 8];
        mem.read(VGA_ROM_BEGIN + VGA_ROM_OEM_STRING_OFFSET, &mut oem)
            .unwrap();
        assert_eq!(&oem, b"KVM VESA");

        let mut modes = [0u8; 4];
        mem.read(VGA_ROM_BEGIN + VGA_ROM_MODES_OFFSET, &mut modes)
            .unwrap();
        assert_eq!(u16::from_le_bytes([modes[0], modes[1]]), 0x0112);
        assert_eq!(u16::from_le_bytes([modes[2], modes[3]]), 0xffff);
    }

    #[test]
    fn e820_small_ram_single_entry() {
        let mem = GuestMemory::new(4 * 1024 * 1024).unwrap();
        setup_bios(&mem, 4 * 1024 * 1024).unwrap();

        let mut nr_map = [0u8; 4];
        mem.read(E820_MAP_START, &mut nr_map).unwrap();
        assert_eq!(u32::from_le_bytes(nr_map), 4);
    }
}
