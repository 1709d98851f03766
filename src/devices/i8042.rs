//! i8042 keyboard/mouse controller: dual ring FIFOs, command/data port
//! state machine, IRQ level tracking.
//!
//! Fixes a documented out-of-bounds read in the source this is
//! modeled on: the empty-queue read path computed `kread - 1` and
//! indexed one past the 128-byte keyboard queue. Here the
//! last-delivered byte is held in its own field instead.

use crate::io_bus::PioDevice;
use crate::kvm::IrqLine;
use std::sync::{Arc, Mutex};

const QUEUE_SIZE: usize = 128;

const STATUS_OBF: u8 = 0x01;
const STATUS_AUXB: u8 = 0x20;

const KBD_IRQ: u32 = 1;
const MOUSE_IRQ: u32 = 12;

/// A 128-byte ring FIFO, as used for both the keyboard and mouse queues.
struct Ring {
    buf: [u8; QUEUE_SIZE],
    read: usize,
    write: usize,
    count: usize,
    last: u8,
}

impl Default for Ring {
    fn default() -> Self {
        Self {
            buf: [0; QUEUE_SIZE],
            read: 0,
            write: 0,
            count: 0,
            last: 0,
        }
    }
}

impl Ring {
    fn push(&mut self, value: u8) {
        if self.count >= QUEUE_SIZE {
            return;
        }
        self.buf[self.write] = value;
        self.write = (self.write + 1) % QUEUE_SIZE;
        self.count += 1;
    }

    /// Pop the next byte, or the last byte ever delivered if the queue
    /// is empty (the historical quirk, made safe: no out-of-bounds
    /// index, just a saved value).
    fn pop_or_last(&mut self) -> u8 {
        if self.count == 0 {
            return self.last;
        }
        let b = self.buf[self.read];
        self.read = (self.read + 1) % QUEUE_SIZE;
        self.count -= 1;
        self.last = b;
        b
    }
}

struct Inner {
    kbd: Ring,
    mouse: Ring,
    mode: u8,
    status: u8,
    write_cmd: u8,
    mstatus: u8,
    mres: u8,
    msample: u8,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            kbd: Ring::default(),
            mouse: Ring::default(),
            mode: 0x03,
            status: 0x1c,
            write_cmd: 0,
            mstatus: 0x00,
            mres: 0x02,
            msample: 100,
        }
    }
}

/// The i8042 keyboard/mouse controller, PIO-mapped at `0x60` and `0x64`.
pub struct I8042 {
    irq_line: Arc<dyn IrqLine>,
    inner: Mutex<Inner>,
}

impl I8042 {
    pub fn new(irq_line: Arc<dyn IrqLine>) -> Self {
        Self {
            irq_line,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Push a scancode byte into the keyboard queue. Out of scope per
    /// the host-keycode translation layer; exposed for callers that
    /// want to feed synthetic input (tests, a future input frontend).
    pub fn push_key(&self, scancode: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.kbd.push(scancode);
        self.update_irq(&mut inner);
    }

    fn update_irq(&self, inner: &mut Inner) {
        let kbd_level = inner.kbd.count > 0;
        let mouse_level = !kbd_level && inner.mouse.count > 0;

        inner.status &= !(STATUS_OBF | STATUS_AUXB);
        if kbd_level {
            inner.status |= STATUS_OBF;
        } else if mouse_level {
            inner.status |= STATUS_OBF | STATUS_AUXB;
        }

        self.irq_line.irq_line(KBD_IRQ, kbd_level);
        self.irq_line.irq_line(MOUSE_IRQ, mouse_level);
    }

    /// Apply a command-port write. Returns `true` for `0xFE`, so the
    /// caller (which owns vCPU 0's cancellation handle) can act on it;
    /// this controller has no reference to the VM's vCPU table.
    fn write_command_checked(&self, inner: &mut Inner, value: u8) -> bool {
        match value {
            0x20 => inner.kbd.push(inner.mode),
            0x60 | 0xd3 | 0xd4 => inner.write_cmd = value,
            0xa9 => inner.mouse.push(0x00),
            0xa7 => inner.mode |= 0x20,
            0xa8 => inner.mode &= !0x20,
            _ => {}
        }
        value == 0xfe
    }

    fn write_data(&self, inner: &mut Inner, value: u8) {
        match inner.write_cmd {
            0x60 => inner.mode = value,
            0xd3 => {
                inner.mouse.push(value);
                inner.mouse.push(0xfa);
            }
            0xd4 => {
                // The OS is sending a command to the mouse; ack first,
                // then apply the sub-command.
                inner.mouse.push(0xfa);
                match value {
                    0xe6 => inner.mstatus &= !0x10,
                    0xe8 => inner.mres = value,
                    0xe9 => {
                        inner.mouse.push(inner.mstatus);
                        inner.mouse.push(inner.mres);
                        inner.mouse.push(inner.msample);
                    }
                    0xf2 => inner.mouse.push(0x00),
                    0xf3 => inner.msample = value,
                    0xf4 => inner.mstatus |= 0x20,
                    0xf5 => inner.mstatus &= !0x20,
                    0xf6 | 0xff => {
                        inner.mstatus = 0x00;
                        inner.mres = 0x02;
                        inner.msample = 100;
                    }
                    _ => {}
                }
            }
            0 => {
                inner.kbd.push(0xfa);
                inner.kbd.push(0xab);
                inner.kbd.push(0x41);
            }
            _ => {}
        }
        inner.write_cmd = 0;
    }

    /// Process a write to port `0x64` (command). Returns `true` if the
    /// guest requested a VM shutdown (`0xFE`).
    pub fn command_write(&self, value: u8) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let shutdown = self.write_command_checked(&mut inner, value);
        self.update_irq(&mut inner);
        shutdown
    }

    fn read_status(&self) -> u8 {
        self.inner.lock().unwrap().status
    }

    fn read_data(&self) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        let byte = if inner.kbd.count > 0 {
            inner.kbd.pop_or_last()
        } else {
            inner.mouse.pop_or_last()
        };
        self.update_irq(&mut inner);
        byte
    }

    fn write_data_port(&self, value: u8) {
        let mut inner = self.inner.lock().unwrap();
        self.write_data(&mut inner, value);
        self.update_irq(&mut inner);
    }
}

impl PioDevice for I8042 {
    fn io_in(&self, port: u16, data: &mut [u8]) {
        data[0] = match port {
            0x60 => self.read_data(),
            0x61 => 0x20,
            0x64 => self.read_status(),
            _ => 0,
        };
    }

    fn io_out(&self, port: u16, data: &[u8]) {
        match port {
            0x60 => self.write_data_port(data[0]),
            0x64 => {
                if self.command_write(data[0]) {
                    self.irq_line.request_shutdown();
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingIrq {
        kbd_high: AtomicU32,
        kbd_low: AtomicU32,
        shutdowns: AtomicU32,
    }

    impl IrqLine for RecordingIrq {
        fn irq_line(&self, irq: u32, level: bool) {
            if irq == KBD_IRQ {
                if level {
                    self.kbd_high.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.kbd_low.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        fn request_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make() -> (I8042, Arc<RecordingIrq>) {
        let irq = Arc::new(RecordingIrq {
            kbd_high: AtomicU32::new(0),
            kbd_low: AtomicU32::new(0),
            shutdowns: AtomicU32::new(0),
        });
        (I8042::new(irq.clone()), irq)
    }

    #[test]
    fn keyboard_fifo_returns_bytes_in_order() {
        let (ctrl, _irq) = make();
        ctrl.push_key(0x1e);
        ctrl.push_key(0x1f);

        let mut buf = [0u8; 1];
        ctrl.io_in(0x60, &mut buf);
        assert_eq!(buf[0], 0x1e);
        ctrl.io_in(0x60, &mut buf);
        assert_eq!(buf[0], 0x1f);
    }

    #[test]
    fn empty_queue_read_returns_last_byte_safely() {
        let (ctrl, _irq) = make();
        ctrl.push_key(0x99);
        let mut buf = [0u8; 1];
        ctrl.io_in(0x60, &mut buf);
        assert_eq!(buf[0], 0x99);

        // Queue now empty; next read must not panic or read out of bounds.
        ctrl.io_in(0x60, &mut buf);
        assert_eq!(buf[0], 0x99);
    }

    #[test]
    fn identify_sequence() {
        let (ctrl, _irq) = make();
        ctrl.command_write(0x00);
        ctrl.write_data_port(0x00);

        let mut buf = [0u8; 1];
        ctrl.io_in(0x60, &mut buf);
        assert_eq!(buf[0], 0xfa);
        ctrl.io_in(0x60, &mut buf);
        assert_eq!(buf[0], 0xab);
        ctrl.io_in(0x60, &mut buf);
        assert_eq!(buf[0], 0x41);
    }

    #[test]
    fn reset_values() {
        let inner = Inner::default();
        assert_eq!(inner.status, 0x1c);
        assert_eq!(inner.mode, 0x03);
        assert_eq!(inner.mres, 0x02);
        assert_eq!(inner.msample, 100);
    }

    #[test]
    fn kbd_irq_raises_and_lowers() {
        let (ctrl, irq) = make();
        ctrl.push_key(0x10);
        assert_eq!(irq.kbd_high.load(Ordering::SeqCst), 1);

        let mut buf = [0u8; 1];
        ctrl.io_in(0x60, &mut buf);
        assert_eq!(irq.kbd_low.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_command_reported() {
        let (ctrl, _irq) = make();
        assert!(ctrl.command_write(0xfe));
        assert!(!ctrl.command_write(0x20));
    }

    #[test]
    fn shutdown_command_via_io_out_requests_shutdown() {
        let (ctrl, irq) = make();
        ctrl.io_out(0x64, &[0xfe]);
        assert_eq!(irq.shutdowns.load(Ordering::SeqCst), 1);

        ctrl.io_out(0x64, &[0x20]);
        assert_eq!(irq.shutdowns.load(Ordering::SeqCst), 1);
    }

    fn drain(ctrl: &I8042, port: u16, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let mut buf = [0u8; 1];
        for _ in 0..n {
            ctrl.io_in(port, &mut buf);
            out.push(buf[0]);
        }
        out
    }

    #[test]
    fn mouse_status_report() {
        let (ctrl, _irq) = make();
        ctrl.command_write(0xd4);
        ctrl.write_data_port(0xf4); // enable reporting, sets mstatus bit 0x20
        assert_eq!(drain(&ctrl, 0x60, 1), [0xfa]);

        ctrl.command_write(0xd4);
        ctrl.write_data_port(0xe9); // status report
        assert_eq!(drain(&ctrl, 0x60, 4), [0xfa, 0x20, 0x02, 100]);
    }

    #[test]
    fn mouse_reset_restores_defaults() {
        let (ctrl, _irq) = make();
        ctrl.command_write(0xd4);
        ctrl.write_data_port(0xf3); // set sample rate (to a non-default value)
        drain(&ctrl, 0x60, 1);

        ctrl.command_write(0xd4);
        ctrl.write_data_port(0xff); // reset
        assert_eq!(drain(&ctrl, 0x60, 1), [0xfa]);

        ctrl.command_write(0xd4);
        ctrl.write_data_port(0xe9);
        assert_eq!(drain(&ctrl, 0x60, 4), [0xfa, 0x00, 0x02, 100]);
    }

    #[test]
    fn mouse_get_id() {
        let (ctrl, _irq) = make();
        ctrl.command_write(0xd4);
        ctrl.write_data_port(0xf2);
        assert_eq!(drain(&ctrl, 0x60, 2), [0xfa, 0x00]);
    }
}
