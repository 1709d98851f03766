//! Boot orchestration: guest memory, BIOS/IVT/E820, kernel loading.
//!
//! A real-mode boot has no zero page and no page tables to build; the
//! guest kernel's own real-mode trampoline (the setup code copied to
//! `0x1000:0x0000`) does the protected-mode transition and E820
//! parsing itself. This module's job is purely to get bytes into the
//! right guest physical addresses before the first vCPU reset.

mod bios;
mod bzimage;
mod memory;

pub use bios::{setup_bios, BiosError};
pub use bzimage::{load_kernel, LoadedKernel};
pub use memory::{GuestMemory, MemoryError};

use crate::kvm::{KvmError, VmFd};
use thiserror::Error;

/// Default kernel command line appended when the caller doesn't
/// override it: route the console to the first emulated UART.
pub const DEFAULT_CMDLINE: &str = "console=ttyS0";

/// Maximum length (including trailing NUL) of the command line buffer
/// at `0x20000`.
pub const CMDLINE_MAX_SIZE: usize = 2048;

/// Default guest memory size (256 MiB).
pub const DEFAULT_MEM_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum BootError {
    #[error("guest memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("bios setup error: {0}")]
    Bios(#[from] BiosError),

    #[error("kvm error: {0}")]
    Kvm(#[from] KvmError),

    #[error("failed to read kernel image: {0}")]
    ReadKernel(#[source] std::io::Error),

    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),
}

/// What to boot: kernel path, optional initrd, command line, and RAM size.
pub struct BootConfig {
    pub kernel_path: String,
    pub initrd_path: Option<String>,
    pub cmdline: String,
    pub mem_size: u64,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            kernel_path: String::new(),
            initrd_path: None,
            cmdline: DEFAULT_CMDLINE.to_string(),
            mem_size: DEFAULT_MEM_SIZE,
        }
    }
}

/// Allocate guest RAM, register it with the VM, populate BIOS/IVT/E820,
/// and load the kernel (and optional initrd). Returns the allocated
/// memory and the loaded-kernel record.
pub fn setup_boot(
    vm: &VmFd,
    config: &BootConfig,
) -> Result<(GuestMemory, LoadedKernel), BootError> {
    let memory = GuestMemory::new(config.mem_size)?;

    for (guest_base, host_addr, size) in memory.host_regions() {
        let slot = vm.mem_banks.lock().unwrap().len() as u32;
        unsafe {
            vm.set_user_memory_region(slot, guest_base, size, host_addr)?;
        }
    }

    setup_bios(&memory, config.mem_size)?;

    let loaded = load_kernel(
        &memory,
        &config.kernel_path,
        &config.cmdline,
        CMDLINE_MAX_SIZE,
        config.initrd_path.as_deref(),
    )
    .map_err(|e| match e {
        BootError::ReadKernel(io) => BootError::ReadKernel(io),
        BootError::InvalidKernel(msg) => BootError::InvalidKernel(msg),
        other => other,
    })?;

    Ok((memory, loaded))
}
