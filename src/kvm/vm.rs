//! Virtual machine handle: memory banks, vCPU table, IRQ injection.
//!
//! Before a VM can run, several x86-specific components must be
//! initialized:
//!
//! - **TSS address**: Intel VT-x requires a valid TSS address even
//!   though hardware task switching is never used.
//! - **IRQ chip**: in-kernel PIC + IOAPIC emulation.
//! - **PIT**: the 8254 Programmable Interval Timer, expected during
//!   early real-mode boot even though we don't emulate timer IRQs
//!   beyond what KVM's in-kernel PIT raises on its own.

use super::{KvmError, VcpuFd};
use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, CpuId, KVM_PIT_SPEAKER_DUMMY};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// TSS address in an unused hole of the 32-bit physical address space.
const TSS_ADDRESS: u64 = 0xfffb_d000;

/// A registered guest RAM region.
#[derive(Debug, Clone, Copy)]
pub struct MemBank {
    pub guest_phys_base: u64,
    pub size: u64,
    pub slot: u32,
}

/// Per-vCPU bookkeeping owned by the VM, sized to `nrcpus` before any
/// vCPU thread starts.
pub struct VcpuHandle {
    pub cpu_id: u32,
    pub thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    pub native_id: Mutex<Option<libc::pthread_t>>,
}

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    vm: kvm_ioctls::VmFd,
    supported_cpuid: CpuId,
    pub mem_banks: Mutex<Vec<MemBank>>,
    pub vcpus: Vec<VcpuHandle>,
    pub shutdown: std::sync::Arc<AtomicBool>,
}

impl VmFd {
    /// Create a new VmFd wrapper, initializing TSS/IRQCHIP/PIT and
    /// sizing the vCPU table to `nrcpus`.
    pub fn new(vm: kvm_ioctls::VmFd, supported_cpuid: CpuId, nrcpus: u32) -> Result<Self, KvmError> {
        vm.set_tss_address(TSS_ADDRESS as usize)
            .map_err(KvmError::SetTssAddress)?;
        vm.create_irq_chip().map_err(KvmError::CreateIrqChip)?;

        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        vm.create_pit2(pit_config).map_err(KvmError::CreatePit2)?;

        let vcpus = (0..nrcpus)
            .map(|cpu_id| VcpuHandle {
                cpu_id,
                thread: Mutex::new(None),
                native_id: Mutex::new(None),
            })
            .collect();

        Ok(Self {
            vm,
            supported_cpuid,
            mem_banks: Mutex::new(Vec::new()),
            vcpus,
            shutdown: std::sync::Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register a guest memory region with KVM under a unique slot id.
    ///
    /// # Safety
    ///
    /// `userspace_addr` must remain valid host memory for the lifetime
    /// of the VM and must not overlap a previously registered region.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)?;
        }

        self.mem_banks.lock().unwrap().push(MemBank {
            guest_phys_base: guest_addr,
            size: memory_size,
            slot,
        });
        Ok(())
    }

    /// Create a new vCPU with real-mode-filtered CPUID already applied.
    pub fn create_vcpu(&self, id: u32) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id as u64).map_err(KvmError::CreateVcpu)?;
        let vcpu = VcpuFd::new(vcpu, id);
        vcpu.set_filtered_cpuid(&self.supported_cpuid)?;
        Ok(vcpu)
    }

    /// Raise or lower a virtual IRQ line.
    ///
    /// Errors are logged and swallowed: the guest may still recover, so
    /// a failed injection is never treated as fatal.
    pub fn irq_line(&self, irq: u32, level: bool) {
        if let Err(e) = self.vm.set_irq_line(irq, level) {
            warn!(irq, level, error = %e, "failed to set irq line");
        }
    }
}

impl super::IrqLine for VmFd {
    fn irq_line(&self, irq: u32, level: bool) {
        VmFd::irq_line(self, irq, level)
    }

    fn request_shutdown(&self) {
        cancel_all_vcpus(self);
    }
}

/// Send the lowest real-time signal to every vCPU thread, waking any
/// blocked `KVM_RUN` ioctl with `EINTR`.
pub fn cancel_all_vcpus(vm: &VmFd) {
    vm.shutdown.store(true, Ordering::SeqCst);
    for handle in &vm.vcpus {
        if let Some(native) = *handle.native_id.lock().unwrap() {
            unsafe {
                libc::pthread_kill(native, libc::SIGRTMIN());
            }
        }
    }
}
