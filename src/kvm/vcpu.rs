//! Virtual CPU management and execution.
//!
//! A vCPU represents a virtual processor executing guest instructions
//! under hardware-assisted virtualization. It resets into 16-bit real
//! mode and runs an unbounded loop of host entries, dispatching each
//! exit to the I/O trap registry until the guest halts or shuts down.
//!
//! # VM Exits
//!
//! - **I/O Port Access**: Guest used IN/OUT instructions.
//! - **MMIO**: Guest accessed an unmapped memory region.
//! - **HLT**: Guest executed HLT.
//! - **Shutdown**: Triple fault or explicit shutdown request.
//!
//! Per the documented asymmetry: an unhandled PIO access is fatal for
//! the owning vCPU; an unhandled MMIO access is swallowed silently
//! (some guest code probes MMIO ranges that were never wired up, e.g.
//! VGA windows we don't back).

use super::KvmError;
use crate::io_bus::IoBus;
use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs, CpuId};
use kvm_ioctls::VcpuExit as KvmVcpuExit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Real-mode segment selector/base used for CS/SS/DS/ES/FS/GS at reset.
const RESET_SEGMENT_SELECTOR: u16 = 0x1000;
/// Initial RIP: the guest's real-mode entry point within the loaded setup code.
const RESET_RIP: u64 = 0x200;
/// Initial RSP/RBP.
const RESET_SP: u64 = 0x8000;
/// RFLAGS bit 1 is always set per the x86 architecture.
const RESET_RFLAGS: u64 = 0x2;

/// Exit reasons surfaced to the dispatch loop.
#[derive(Debug)]
pub enum VcpuExit {
    /// I/O or MMIO access already handled inline by the dispatcher.
    Io,
    /// Guest executed HLT; the vCPU thread should stop.
    Hlt,
    /// Guest requested shutdown (triple fault or explicit).
    Shutdown,
    /// KVM internal error.
    InternalError,
    /// Failed to enter guest mode; contains the hardware failure reason.
    FailEntry(u64),
    /// System event (S3 sleep, reset, ...).
    SystemEvent(u32),
    /// Host entry was interrupted by the cancellation signal.
    Interrupted,
    /// Unknown or unhandled exit reason.
    Unknown(&'static str),
}

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    vcpu: kvm_ioctls::VcpuFd,
    cpu_id: u32,
}

impl VcpuFd {
    /// Wrap a raw KVM vCPU descriptor.
    pub fn new(vcpu: kvm_ioctls::VcpuFd, cpu_id: u32) -> Self {
        Self { vcpu, cpu_id }
    }

    /// Apply the supported CPUID vector, filtered per the guest-visible
    /// feature policy: leaf 1 gets its APIC id patched into bits
    /// `[31:24]` of EBX and the hypervisor-present bit set in ECX; leaf
    /// 6 has ECX bit 3 cleared; leaf 10's EAX is zeroed unless it
    /// already reports `version_id == 2` with a nonzero counter count.
    pub fn set_filtered_cpuid(&self, supported: &CpuId) -> Result<(), KvmError> {
        let mut entries = supported.as_slice().to_vec();
        for entry in &mut entries {
            match entry.function {
                1 => {
                    entry.ebx = (entry.ebx & 0x00ff_ffff) | (self.cpu_id << 24);
                    entry.ecx |= 1 << 31;
                }
                6 => entry.ecx &= !(1 << 3),
                10 => {
                    let version_id = entry.eax & 0xff;
                    let num_counters = (entry.eax >> 8) & 0xff;
                    if !(version_id == 2 && num_counters > 0) {
                        entry.eax = 0;
                    }
                }
                _ => {}
            }
        }
        let cpuid = CpuId::from_entries(&entries)
            .map_err(|_| KvmError::SetCpuid(kvm_ioctls::Error::new(libc::EINVAL)))?;
        self.vcpu.set_cpuid2(&cpuid).map_err(KvmError::SetCpuid)
    }

    /// Reset the vCPU into 16-bit real mode at the guest's entry point.
    pub fn reset(&self) -> Result<(), KvmError> {
        let mut sregs = self.vcpu.get_sregs().map_err(KvmError::GetRegisters)?;

        let seg = |selector: u16| kvm_segment {
            base: (selector as u64) << 4,
            limit: 0xffff,
            selector,
            type_: 0x3,
            present: 1,
            dpl: 0,
            db: 0,
            s: 1,
            l: 0,
            g: 0,
            avl: 0,
            ..Default::default()
        };

        sregs.cs = seg(RESET_SEGMENT_SELECTOR);
        sregs.ss = seg(RESET_SEGMENT_SELECTOR);
        sregs.ds = seg(RESET_SEGMENT_SELECTOR);
        sregs.es = seg(RESET_SEGMENT_SELECTOR);
        sregs.fs = seg(RESET_SEGMENT_SELECTOR);
        sregs.gs = seg(RESET_SEGMENT_SELECTOR);
        sregs.cr0 &= !1; // leave protected mode disabled
        self.vcpu.set_sregs(&sregs).map_err(KvmError::SetRegisters)?;

        let regs = kvm_regs {
            rip: RESET_RIP,
            rsp: RESET_SP,
            rbp: RESET_SP,
            rflags: RESET_RFLAGS,
            ..Default::default()
        };
        self.vcpu.set_regs(&regs).map_err(KvmError::SetRegisters)?;

        debug!(cpu_id = self.cpu_id, rip = RESET_RIP, "vcpu reset to real mode");
        Ok(())
    }

    /// Current general-purpose registers, for diagnostics.
    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    /// Run one host entry and dispatch the resulting exit through `bus`.
    ///
    /// `EINTR` from the cancellation signal and `EAGAIN` are translated
    /// to `VcpuExit::Interrupted`, which the caller treats as
    /// recoverable: re-check the shutdown flag, then re-enter.
    pub fn step(&mut self, bus: &IoBus) -> Result<VcpuExit, KvmError> {
        let exit = match self.vcpu.run() {
            Ok(exit) => exit,
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                return Ok(VcpuExit::Interrupted)
            }
            Err(e) => return Err(KvmError::Run(e)),
        };

        match exit {
            KvmVcpuExit::IoIn(port, data) => {
                let len = data.len();
                match bus.dispatch_io(port, data, false, len) {
                    crate::io_bus::IoOutcome::Handled => Ok(VcpuExit::Io),
                    crate::io_bus::IoOutcome::Unhandled => {
                        warn!(port, "unhandled PIO read, guest fault");
                        Ok(VcpuExit::Unknown("unhandled PIO read"))
                    }
                }
            }
            KvmVcpuExit::IoOut(port, data) => {
                let len = data.len();
                let mut buf = data.to_vec();
                match bus.dispatch_io(port, &mut buf, true, len) {
                    crate::io_bus::IoOutcome::Handled => Ok(VcpuExit::Io),
                    crate::io_bus::IoOutcome::Unhandled => {
                        warn!(port, "unhandled PIO write, guest fault");
                        Ok(VcpuExit::Unknown("unhandled PIO write"))
                    }
                }
            }
            KvmVcpuExit::MmioRead(addr, data) => {
                bus.dispatch_mmio(addr, data, false);
                Ok(VcpuExit::Io)
            }
            KvmVcpuExit::MmioWrite(addr, data) => {
                let mut buf = data.to_vec();
                bus.dispatch_mmio(addr, &mut buf, true);
                Ok(VcpuExit::Io)
            }
            KvmVcpuExit::Hlt => Ok(VcpuExit::Hlt),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(VcpuExit::InternalError),
            KvmVcpuExit::SystemEvent(event, _) => Ok(VcpuExit::SystemEvent(event)),
            KvmVcpuExit::FailEntry(reason, _) => Ok(VcpuExit::FailEntry(reason)),
            KvmVcpuExit::Hypercall(_) => Ok(VcpuExit::Unknown("Hypercall")),
            KvmVcpuExit::Debug(_) => Ok(VcpuExit::Unknown("Debug")),
            KvmVcpuExit::Exception => Ok(VcpuExit::Unknown("Exception")),
            KvmVcpuExit::IrqWindowOpen => Ok(VcpuExit::Unknown("IrqWindowOpen")),
            KvmVcpuExit::Nmi => Ok(VcpuExit::Unknown("Nmi")),
            KvmVcpuExit::Watchdog => Ok(VcpuExit::Unknown("Watchdog")),
            _ => Ok(VcpuExit::Unknown("Other")),
        }
    }

    /// Run the dispatch loop until HLT, shutdown, or `shutdown` is set.
    ///
    /// PIO misses are fatal for this vCPU; MMIO misses are swallowed
    /// per spec's documented asymmetry.
    pub fn run_loop(&mut self, bus: &IoBus, shutdown: &Arc<AtomicBool>) -> Result<(), KvmError> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.step(bus)? {
                VcpuExit::Io | VcpuExit::Interrupted => continue,
                VcpuExit::Hlt => {
                    debug!(cpu_id = self.cpu_id, "guest halted");
                    return Ok(());
                }
                VcpuExit::Shutdown => {
                    debug!(cpu_id = self.cpu_id, "guest requested shutdown");
                    return Ok(());
                }
                VcpuExit::InternalError => {
                    return Err(KvmError::Run(kvm_ioctls::Error::new(libc::EIO)));
                }
                VcpuExit::FailEntry(reason) => {
                    warn!(cpu_id = self.cpu_id, reason, "failed to enter guest");
                    return Err(KvmError::Run(kvm_ioctls::Error::new(libc::EIO)));
                }
                VcpuExit::SystemEvent(event) => {
                    debug!(cpu_id = self.cpu_id, event, "system event, stopping vcpu");
                    return Ok(());
                }
                VcpuExit::Unknown(reason) if reason.starts_with("unhandled PIO") => {
                    return Err(KvmError::Run(kvm_ioctls::Error::new(libc::EIO)));
                }
                VcpuExit::Unknown(reason) => {
                    warn!(cpu_id = self.cpu_id, reason, "unknown exit, continuing");
                    continue;
                }
            }
        }
    }
}
