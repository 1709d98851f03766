//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! Provides a safe Rust interface to the host kernel's virtualization
//! facility. The VMM talks to KVM through ioctls on `/dev/kvm` (system
//! level), the VM file descriptor (VM level: memory regions, vCPU
//! creation, IRQ lines), and each vCPU file descriptor (run, get/set
//! registers).

mod vcpu;
mod vm;

pub use vcpu::{VcpuExit, VcpuFd};
pub use vm::{cancel_all_vcpus, MemBank, VcpuHandle, VmFd};

use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::Kvm;
use thiserror::Error;

/// The API version this crate was written against. `create_vm` refuses
/// to proceed if the host reports anything else.
pub const KVM_API_VERSION: i32 = 12;

/// Non-owning interface a device uses to inject interrupts and request
/// a VM shutdown, without holding a strong reference back to the VM
/// (Design Notes §9).
pub trait IrqLine: Send + Sync {
    fn irq_line(&self, irq: u32, level: bool);

    /// Cancel every vCPU thread. The i8042 controller's `0xFE` reset
    /// command and a terminal's shutdown escape sequence are the two
    /// guest/operator-triggered paths that call this.
    fn request_shutdown(&self);
}

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    #[error("Failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("Unsupported KVM API version: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: i32, actual: i32 },

    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("Failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("Failed to create in-kernel IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("Failed to create PIT2: {0}")]
    CreatePit2(#[source] kvm_ioctls::Error),

    #[error("Failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("Failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),
}

/// Open the KVM device, check its API version, and create a new VM
/// sized for `nrcpus` vCPUs.
pub fn create_vm(nrcpus: u32) -> Result<VmFd, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;

    let actual = kvm.get_api_version();
    if actual != KVM_API_VERSION {
        return Err(KvmError::ApiVersionMismatch {
            expected: KVM_API_VERSION,
            actual,
        });
    }

    let supported_cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(KvmError::GetSupportedCpuid)?;

    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;
    VmFd::new(vm, supported_cpuid, nrcpus)
}
