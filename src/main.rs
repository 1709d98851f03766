//! carbon-core: a minimal Type-2 x86 hypervisor that boots an
//! unmodified Linux bzImage in 16-bit real mode.
//!
//! This VMM requires Linux with KVM support. It will not run on other
//! platforms.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod devices;
mod interval;
#[cfg(target_os = "linux")]
mod io_bus;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod term;

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "carbon")]
#[command(about = "A minimal real-mode x86 microVM runtime")]
struct Args {
    /// Path to the Linux kernel bzImage
    #[arg(short, long)]
    kernel: String,

    /// Path to an initial ramdisk image
    #[arg(short, long)]
    initrd: Option<String>,

    /// Kernel command line
    #[arg(short, long, default_value = "console=ttyS0")]
    cmdline: String,

    /// Memory size in megabytes
    #[arg(short, long, default_value_t = 256)]
    memory: u64,

    /// Number of virtual CPUs
    #[arg(long, default_value_t = 1)]
    smp: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "carbon-core exited with an error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use boot::BootConfig;
    use devices::{Uart, I8042, I8042_COMMAND_PORT, I8042_DATA_BASE, I8042_DATA_LEN, UART_IO_LEN, UART_PORTS};
    use io_bus::IoBus;
    use kvm::cancel_all_vcpus;
    use std::sync::Arc;
    use term::Terminal;
    use tracing::{info, warn};

    info!(kernel = %args.kernel, memory_mb = args.memory, smp = args.smp, "starting carbon-core");

    let vm = Arc::new(kvm::create_vm(args.smp)?);

    let config = BootConfig {
        kernel_path: args.kernel,
        initrd_path: args.initrd,
        cmdline: args.cmdline,
        mem_size: args.memory * 1024 * 1024,
    };
    let (_memory, loaded) = boot::setup_boot(&vm, &config)?;
    info!(
        rip = loaded.real_mode_base,
        entry = loaded.protected_mode_base,
        "kernel loaded"
    );

    let bus = Arc::new(IoBus::new());

    let terminal = Arc::new(Terminal::stdio());
    let mut uarts = Vec::with_capacity(UART_PORTS.len());
    for &(iobase, irq, sysrq_capable) in UART_PORTS.iter() {
        let uart = Arc::new(Uart::new(iobase, irq, vm.clone(), terminal.clone(), sysrq_capable));
        bus.register_pio(iobase, UART_IO_LEN, uart.clone())?;
        uarts.push(uart);
    }

    let i8042 = Arc::new(I8042::new(vm.clone()));
    bus.register_pio(I8042_DATA_BASE, I8042_DATA_LEN, i8042.clone())?;
    bus.register_pio(I8042_COMMAND_PORT, 1, i8042.clone())?;

    let orig_termios = term::enter_raw_mode()?;

    let terminals = vec![terminal.clone()];
    let poll_uarts = uarts.clone();
    let poll_shutdown = vm.shutdown.clone();
    let poll_thread = std::thread::spawn(move || {
        term::poll_thread_loop(&terminals, &poll_shutdown, || {
            for uart in &poll_uarts {
                uart.refill_rx();
            }
        });
    });

    let mut handles = Vec::new();
    for cpu_id in 0..args.smp {
        let vm = vm.clone();
        let bus = bus.clone();
        let handle = std::thread::spawn(move || -> Result<(), kvm::KvmError> {
            let mut vcpu = vm.create_vcpu(cpu_id)?;
            *vm.vcpus[cpu_id as usize].native_id.lock().unwrap() = Some(unsafe { libc::pthread_self() });
            vcpu.reset()?;
            match vcpu.run_loop(&bus, &vm.shutdown) {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(cpu_id, error = %e, "vcpu loop exited with an error");
                    Err(e)
                }
            }
        });
        handles.push(handle);
    }

    // VCPU 0 carries the boot CPU; its exit ends the VM. The rest are
    // cancelled once it returns rather than waited on independently.
    let mut handles = handles.into_iter();
    let bsp = handles.next().expect("smp is always at least 1");
    let result: Result<(), Box<dyn std::error::Error>> = match bsp.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Box::new(e)),
        Err(_) => Err("vcpu 0 thread panicked".into()),
    };

    cancel_all_vcpus(&vm);
    for handle in handles {
        let _ = handle.join();
    }
    let _ = poll_thread.join();

    if let Some(orig) = orig_termios {
        term::restore(&orig);
    }

    result
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("carbon-core requires Linux with KVM support. This platform is not supported.".into())
}
