//! Device emulation for the VMM: four 8250 UARTs and an i8042
//! keyboard/mouse controller, both PIO-mapped and registered on the
//! shared [`crate::io_bus::IoBus`].

mod i8042;
mod serial;

pub use i8042::I8042;
pub use serial::Uart;

/// `(iobase, irq, sysrq_capable)` for the four emulated UARTs, in the
/// conventional COM1-4 order.
pub const UART_PORTS: [(u16, u32, bool); 4] = [
    (0x3f8, 4, true),
    (0x2f8, 3, false),
    (0x3e8, 4, false),
    (0x2e8, 3, false),
];

/// PIO range each UART instance occupies.
pub const UART_IO_LEN: u16 = 8;

/// i8042 data/port-B range: `0x60` (data) and `0x61` (unused port B, read
/// as a constant) are registered together since they're contiguous.
pub const I8042_DATA_BASE: u16 = 0x60;
pub const I8042_DATA_LEN: u16 = 2;
/// i8042 command/status port, a separate non-contiguous range.
pub const I8042_COMMAND_PORT: u16 = 0x64;
