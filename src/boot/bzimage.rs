//! Linux bzImage loader, real-mode boot protocol.
//!
//! Unlike a 64-bit direct-boot loader (which synthesizes a zero page
//! and jumps straight to the protected-mode entry point), this loader
//! reproduces what a real BIOS bootloader does: it places the setup
//! sectors at the real-mode load segment, the protected-mode payload
//! at 1 MiB, patches a handful of fields directly into the in-guest
//! copy of the boot header, and lets the kernel's own real-mode
//! trampoline take over from `0x1000:0x0200`.
//!
//! ```text
//! +------------------+ (0x1000<<4) + 0x0000
//! |  Boot sector +   | (setup_sects + 1) * 512 bytes
//! |  setup code      |
//! +------------------+ 0x00100000
//! |  Protected-mode  |
//! |  kernel payload  |
//! +------------------+
//! ```

use super::bios::BZ_KERNEL_START;
use super::memory::GuestMemory;
use super::BootError;
use std::fs::File;
use std::io::Read;

/// Linux boot protocol magic number "HdrS".
const BOOT_MAGIC: u32 = 0x5372_6448;
const MAGIC_OFFSET: usize = 0x202;
const SETUP_SECTS_OFFSET: usize = 0x1f1;
const LOADFLAGS_OFFSET: usize = 0x211;

const CMD_LINE_PTR_OFFSET: usize = 0x228;
const TYPE_OF_LOADER_OFFSET: usize = 0x210;
const HEAP_END_PTR_OFFSET: usize = 0x224;
const VID_MODE_OFFSET: usize = 0x1fa;
const RAMDISK_IMAGE_OFFSET: usize = 0x218;
const RAMDISK_SIZE_OFFSET: usize = 0x21c;

const CAN_USE_HEAP: u8 = 0x80;

/// Real-mode segment the setup sectors are loaded at: `0x1000:0x0000`.
const REAL_MODE_SEGMENT: u64 = 0x1000;

const CMDLINE_ADDRESS: u64 = 0x0002_0000;
const TYPE_OF_LOADER_UNKNOWN: u8 = 0xff;
const HEAP_END_PTR: u16 = 0xfe00;
const VID_MODE_NORMAL: u16 = 0;

const MIB: u64 = 1024 * 1024;

/// Addresses patched into the loaded boot header after placement, so
/// callers can assert on them (tests, diagnostics).
pub struct LoadedKernel {
    pub setup_sects: u8,
    pub real_mode_base: u64,
    pub protected_mode_base: u64,
    pub cmdline_address: u64,
    pub initrd_address: Option<u64>,
}

fn patch_u32(memory: &GuestMemory, base: u64, field_offset: usize, value: u32) -> Result<(), BootError> {
    memory
        .write_u32(base + field_offset as u64, value)
        .map_err(Into::into)
}

fn patch_u16(memory: &GuestMemory, base: u64, field_offset: usize, value: u16) -> Result<(), BootError> {
    memory
        .write_u16(base + field_offset as u64, value)
        .map_err(Into::into)
}

fn patch_u8(memory: &GuestMemory, base: u64, field_offset: usize, value: u8) -> Result<(), BootError> {
    memory
        .write_u8(base + field_offset as u64, value)
        .map_err(Into::into)
}

/// Load a bzImage kernel (and optional initrd) into guest memory.
pub fn load_kernel(
    memory: &GuestMemory,
    kernel_path: &str,
    cmdline: &str,
    cmdline_max_size: usize,
    initrd_path: Option<&str>,
) -> Result<LoadedKernel, BootError> {
    let mut file = File::open(kernel_path).map_err(BootError::ReadKernel)?;
    let mut kernel_data = Vec::new();
    file.read_to_end(&mut kernel_data).map_err(BootError::ReadKernel)?;

    if kernel_data.len() < MAGIC_OFFSET + 4 {
        return Err(BootError::InvalidKernel(
            "image too small to contain a setup header".into(),
        ));
    }

    let magic = u32::from_le_bytes([
        kernel_data[MAGIC_OFFSET],
        kernel_data[MAGIC_OFFSET + 1],
        kernel_data[MAGIC_OFFSET + 2],
        kernel_data[MAGIC_OFFSET + 3],
    ]);
    if magic != BOOT_MAGIC {
        return Err(BootError::InvalidKernel(format!(
            "invalid boot magic: expected {BOOT_MAGIC:#x}, got {magic:#x}"
        )));
    }

    let setup_sects = kernel_data[SETUP_SECTS_OFFSET];
    let setup_sects = if setup_sects == 0 { 4 } else { setup_sects };
    let setup_size = (setup_sects as usize + 1) * 512;
    if setup_size > kernel_data.len() {
        return Err(BootError::InvalidKernel(
            "setup size exceeds kernel image size".into(),
        ));
    }

    let real_mode_base = (REAL_MODE_SEGMENT << 4) + 0x0000;
    memory.write(real_mode_base, &kernel_data[..setup_size])?;

    let protected_mode_base = BZ_KERNEL_START;
    memory.write(protected_mode_base, &kernel_data[setup_size..])?;

    let mut cmdline_bytes = cmdline.as_bytes().to_vec();
    cmdline_bytes.truncate(cmdline_max_size.saturating_sub(1));
    cmdline_bytes.push(0);
    memory.write(CMDLINE_ADDRESS, &cmdline_bytes)?;

    patch_u32(memory, real_mode_base, CMD_LINE_PTR_OFFSET, CMDLINE_ADDRESS as u32)?;
    patch_u8(memory, real_mode_base, TYPE_OF_LOADER_OFFSET, TYPE_OF_LOADER_UNKNOWN)?;
    patch_u16(memory, real_mode_base, HEAP_END_PTR_OFFSET, HEAP_END_PTR)?;
    patch_u16(memory, real_mode_base, VID_MODE_OFFSET, VID_MODE_NORMAL)?;

    let mut loadflags = [0u8; 1];
    memory.read(real_mode_base + LOADFLAGS_OFFSET as u64, &mut loadflags)?;
    loadflags[0] |= CAN_USE_HEAP;
    memory.write(real_mode_base + LOADFLAGS_OFFSET as u64, &loadflags)?;

    let initrd_address = if let Some(path) = initrd_path {
        let mut initrd_file = File::open(path).map_err(BootError::ReadKernel)?;
        let mut initrd_data = Vec::new();
        initrd_file
            .read_to_end(&mut initrd_data)
            .map_err(BootError::ReadKernel)?;

        let initrd_size = initrd_data.len() as u64;
        let ram_size = memory.ram_size();
        // initrd_addr_max is a boot-header field; without reading it
        // back we use ram_size as the ceiling, which is always <= it
        // for images that specify no explicit maximum.
        let initrd_addr_max = ram_size;

        let mut addr = initrd_addr_max & !(MIB - 1);
        let placed = loop {
            if addr < MIB {
                return Err(BootError::InvalidKernel(
                    "no room below 1 MiB boundary search for initrd placement".into(),
                ));
            }
            if addr + initrd_size <= ram_size {
                break addr;
            }
            addr -= MIB;
        };

        memory.write(placed, &initrd_data)?;
        patch_u32(memory, real_mode_base, RAMDISK_IMAGE_OFFSET, placed as u32)?;
        patch_u32(memory, real_mode_base, RAMDISK_SIZE_OFFSET, initrd_size as u32)?;
        Some(placed)
    } else {
        None
    };

    Ok(LoadedKernel {
        setup_sects,
        real_mode_base,
        protected_mode_base,
        cmdline_address: CMDLINE_ADDRESS,
        initrd_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_bzimage(setup_sects: u8, payload_len: usize) -> Vec<u8> {
        let total_setup_sectors = if setup_sects == 0 { 4 } else { setup_sects } as usize + 1;
        let mut data = vec![0u8; total_setup_sectors * 512 + payload_len];
        data[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&BOOT_MAGIC.to_le_bytes());
        data[SETUP_SECTS_OFFSET] = setup_sects;
        data
    }

    #[test]
    fn rejects_bad_magic() {
        let mem = GuestMemory::new(16 * 1024 * 1024).unwrap();
        let mut data = make_bzimage(4, 4096);
        data[MAGIC_OFFSET] = 0;
        let dir = std::env::temp_dir().join("carbon-core-test-badmagic.img");
        std::fs::File::create(&dir).unwrap().write_all(&data).unwrap();

        let result = load_kernel(&mem, dir.to_str().unwrap(), "console=ttyS0", 2048, None);
        assert!(result.is_err());
        let _ = std::fs::remove_file(dir);
    }

    #[test]
    fn setup_sects_zero_defaults_to_four() {
        let mem = GuestMemory::new(16 * 1024 * 1024).unwrap();
        let data = make_bzimage(0, 4096);
        let path = std::env::temp_dir().join("carbon-core-test-zero-sects.img");
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let loaded = load_kernel(&mem, path.to_str().unwrap(), "console=ttyS0", 2048, None).unwrap();
        assert_eq!(loaded.setup_sects, 4);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn patches_cmdline_pointer_and_loader_type() {
        let mem = GuestMemory::new(16 * 1024 * 1024).unwrap();
        let data = make_bzimage(4, 4096);
        let path = std::env::temp_dir().join("carbon-core-test-patch.img");
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let loaded = load_kernel(&mem, path.to_str().unwrap(), "console=ttyS0", 2048, None).unwrap();

        let mut raw = [0u8; 4];
        mem.read(loaded.real_mode_base + CMD_LINE_PTR_OFFSET as u64, &mut raw)
            .unwrap();
        assert_eq!(u32::from_le_bytes(raw), CMDLINE_ADDRESS as u32);

        let mut loader_type = [0u8; 1];
        mem.read(
            loaded.real_mode_base + TYPE_OF_LOADER_OFFSET as u64,
            &mut loader_type,
        )
        .unwrap();
        assert_eq!(loader_type[0], TYPE_OF_LOADER_UNKNOWN);

        let mut cmdline = [0u8; 14];
        mem.read(CMDLINE_ADDRESS, &mut cmdline).unwrap();
        assert_eq!(&cmdline, b"console=ttyS0\0");
        let _ = std::fs::remove_file(path);
    }
}
