//! Guest physical memory management using the `vm-memory` crate.
//!
//! Guest RAM is a single host allocation, registered with KVM as one or
//! two banks depending on whether `ram_size` crosses the 32-bit MMIO
//! gap. When it does, the 768 MiB hole
//! `[0xFFFF_FFFF - 768 MiB + 1, 0xFFFF_FFFF]` is carved out of the host
//! allocation and marked `PROT_NONE` so a stray host access into the
//! hole faults instead of silently touching RAM meant for the high
//! bank.
//!
//! ```text
//! Guest Virtual → Guest Physical → Host Virtual → Host Physical
//!     (kernel)       (GPA)         (vm-memory)      (hardware)
//! ```

use nix::sys::mman::{mmap_anonymous, mprotect, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use thiserror::Error;
use vm_memory::mmap::MmapRegion;
use vm_memory::{
    Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap, GuestRegionMmap,
};

/// Start of the 32-bit MMIO gap: 4 GiB - 768 MiB.
pub const GAP_START: u64 = 0x1_0000_0000 - 0x3000_0000;
/// Size of the MMIO gap.
pub const GAP_SIZE: u64 = 0x3000_0000;

/// Errors from guest memory setup and address translation.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to allocate guest memory: {0}")]
    Alloc(#[source] std::io::Error),

    #[error("failed to build guest memory region: {0}")]
    Region(String),

    #[error("guest address {0:#x} is not backed by any memory bank")]
    Unmapped(u64),

    #[error("guest memory access at {0:#x} out of bounds")]
    OutOfBounds(u64),
}

/// One contiguous guest RAM bank with its host-side backing.
struct Bank {
    guest_base: u64,
    size: u64,
}

/// Guest physical memory, possibly split around the MMIO gap.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    banks: Vec<Bank>,
    /// Host address and length of the entire raw allocation, including
    /// any protected gap, so it can be unmapped on drop and so the VM
    /// can register each bank's slice with KVM.
    host_base: *mut u8,
    host_len: usize,
}

// SAFETY: the raw mmap'd region is owned exclusively by this struct and
// never aliased mutably from multiple threads without the guest
// memory's own synchronization (vm-memory regions are Sync).
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Allocate `ram_size` bytes of guest RAM starting at guest
    /// physical 0. When `ram_size` reaches into the 32-bit MMIO gap,
    /// the host allocation grows by `GAP_SIZE` and the gap is
    /// protected `PROT_NONE`, with guest RAM continuing past it.
    pub fn new(ram_size: u64) -> Result<Self, MemoryError> {
        let host_len = if ram_size >= GAP_START {
            ram_size + GAP_SIZE
        } else {
            ram_size
        } as usize;

        // SAFETY: anonymous, private mapping; no file descriptor involved.
        let host_base = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(host_len).ok_or_else(|| {
                    MemoryError::Alloc(std::io::Error::other("zero-sized guest memory"))
                })?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
            )
        }
        .map_err(|e| MemoryError::Alloc(std::io::Error::from(e)))?
        .as_ptr() as *mut u8;

        let mut banks = Vec::new();
        let mut regions = Vec::new();

        if ram_size >= GAP_START {
            // Protect the hole so stray accesses fault instead of
            // landing on the high bank's backing memory.
            unsafe {
                mprotect(
                    NonNull::new(host_base.add(GAP_START as usize)).unwrap(),
                    GAP_SIZE as usize,
                    ProtFlags::PROT_NONE,
                )
            }
            .map_err(|e| MemoryError::Alloc(std::io::Error::from(e)))?;

            banks.push(Bank {
                guest_base: 0,
                size: GAP_START,
            });
            regions.push((0u64, host_base, GAP_START as usize));

            let high_size = ram_size - GAP_START;
            let high_guest_base = GAP_START + GAP_SIZE;
            banks.push(Bank {
                guest_base: high_guest_base,
                size: high_size,
            });
            regions.push((
                high_guest_base,
                unsafe { host_base.add((GAP_START + GAP_SIZE) as usize) },
                high_size as usize,
            ));
        } else {
            banks.push(Bank {
                guest_base: 0,
                size: ram_size,
            });
            regions.push((0u64, host_base, ram_size as usize));
        }

        let mut guest_regions = Vec::with_capacity(regions.len());
        for (guest_base, host_ptr, size) in regions {
            // SAFETY: `host_ptr` points `size` bytes into the live
            // allocation owned by this struct for its whole lifetime.
            let mmap_region = unsafe {
                MmapRegion::build_raw(host_ptr, size, libc::PROT_READ | libc::PROT_WRITE, 0)
            }
            .map_err(|e| MemoryError::Region(e.to_string()))?;
            let region = GuestRegionMmap::new(mmap_region, GuestAddress(guest_base))
                .map_err(|e| MemoryError::Region(e.to_string()))?;
            guest_regions.push(region);
        }

        let inner = GuestMemoryMmap::from_regions(guest_regions)
            .map_err(|e| MemoryError::Region(e.to_string()))?;

        Ok(Self {
            inner,
            banks,
            host_base,
            host_len,
        })
    }

    /// Host (base address, length) of each registered bank, in the
    /// order they should be handed to `VmFd::set_user_memory_region`.
    pub fn host_regions(&self) -> Vec<(u64, u64, u64)> {
        // (guest_phys_base, host_userspace_addr, size)
        self.inner
            .iter()
            .map(|r| (r.start_addr().0, r.as_ptr() as u64, r.len()))
            .collect()
    }

    /// Translate a flat guest physical address to a host pointer.
    pub fn flat_to_host(&self, addr: u64) -> Result<*mut u8, MemoryError> {
        self.inner
            .get_host_address(GuestAddress(addr))
            .map_err(|_| MemoryError::Unmapped(addr))
    }

    /// Translate a real-mode segment:offset pair to a host pointer.
    pub fn real_to_host(&self, segment: u16, offset: u16) -> Result<*mut u8, MemoryError> {
        let linear = ((segment as u64) << 4) + offset as u64;
        self.flat_to_host(linear)
    }

    /// Write bytes at a guest physical address.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds(addr))
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Read bytes from a guest physical address into a buffer.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds(addr))
    }

    /// Total guest-visible RAM size, excluding the protected gap.
    pub fn ram_size(&self) -> u64 {
        self.banks.iter().map(|b| b.size).sum()
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        // The GuestMemoryMmap regions borrow into this allocation via
        // raw pointers (MmapRegion::build_raw does not take ownership),
        // so it must outlive them and be unmapped only once they're gone.
        drop(std::mem::take(&mut self.banks));
        unsafe {
            libc::munmap(self.host_base as *mut libc::c_void, self.host_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn allocate_small() {
        let mem = GuestMemory::new(4096).unwrap();
        assert_eq!(mem.ram_size(), 4096);
        assert_eq!(mem.host_regions().len(), 1);
    }

    #[test]
    fn write_read_roundtrip() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn write_u32_little_endian() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write_u32(100, 0x1234_5678).unwrap();
        assert_eq!(read_vec(&mem, 100, 4), vec![0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn out_of_bounds_write_fails() {
        let mem = GuestMemory::new(100).unwrap();
        assert!(mem.write(99, &[1, 2]).is_err());
    }

    #[test]
    fn real_mode_translation() {
        let mem = GuestMemory::new(0x2_0000).unwrap();
        let base = mem.flat_to_host(0).unwrap();
        let translated = mem.real_to_host(0x1000, 0x10).unwrap();
        assert_eq!(translated as usize - base as usize, 0x1_0010);
    }

    #[test]
    fn gap_straddling_bank_split() {
        // ram_size above GAP_START produces two banks with a protected hole.
        let ram_size = GAP_START + 16 * 1024 * 1024;
        let mem = GuestMemory::new(ram_size).unwrap();
        assert_eq!(mem.ram_size(), ram_size);
        assert_eq!(mem.host_regions().len(), 2);
        // low bank still reachable
        mem.write_u8(0x1000, 0xAB).unwrap();
        assert_eq!(read_vec(&mem, 0x1000, 1), vec![0xAB]);
        // high bank reachable at its guest base
        let high_base = GAP_START + GAP_SIZE;
        mem.write_u8(high_base, 0xCD).unwrap();
        assert_eq!(read_vec(&mem, high_base, 1), vec![0xCD]);
    }
}
