//! I/O trap registry: the single interval-indexed dispatch table that
//! routes every guest PIO and MMIO exit to the device that claimed the
//! address range.
//!
//! One [`IoBus`] is shared by every vCPU thread in a VM. Handler
//! invocation is reference-counted so a concurrent [`IoBus::deregister`]
//! can never free a device entry out from under a handler that's still
//! running on another thread (see `update` in [`crate::interval`]).

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::interval::{IntervalError, IntervalMap};

/// A port-mapped I/O device.
///
/// Implementors hold their own interior mutability (typically a
/// `Mutex<State>`) since a single device instance may be invoked from
/// any vCPU thread.
pub trait PioDevice: Send + Sync {
    /// Handle an `IN` from `port`. `data` is 1, 2, or 4 bytes.
    fn io_in(&self, port: u16, data: &mut [u8]);
    /// Handle an `OUT` to `port`. `data` is 1, 2, or 4 bytes.
    fn io_out(&self, port: u16, data: &[u8]);
}

/// A memory-mapped I/O device.
pub trait MmioDevice: Send + Sync {
    /// Handle a read from guest physical `addr`.
    fn mmio_read(&self, addr: u64, data: &mut [u8]);
    /// Handle a write to guest physical `addr`.
    fn mmio_write(&self, addr: u64, data: &[u8]);
}

enum Handler {
    Pio(Arc<dyn PioDevice>),
    Mmio(Arc<dyn MmioDevice>),
}

struct TrapEntry {
    handler: Handler,
    refcount: u32,
    pending_remove: bool,
}

/// Errors raised while registering or dispatching through the bus.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    /// Another handler already claims a byte of the requested range.
    #[error("I/O range overlaps an existing registration: {0}")]
    Overlap(#[from] IntervalError),
}

/// Outcome of dispatching a single guest exit through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// A registered handler processed the access.
    Handled,
    /// No handler claims this address; caller decides fatal vs. swallow.
    Unhandled,
}

/// The process-wide (per-VM) I/O trap registry.
#[derive(Default)]
pub struct IoBus {
    tree: Mutex<IntervalMap<TrapEntry>>,
}

impl IoBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(IntervalMap::new()),
        }
    }

    /// Register a PIO device over `[port, port + len)`.
    pub fn register_pio(
        &self,
        port: u16,
        len: u16,
        device: Arc<dyn PioDevice>,
    ) -> Result<(), BusError> {
        let low = port as u64;
        let high = low + len as u64;
        let mut tree = self.tree.lock().unwrap();
        tree.insert(
            low,
            high,
            TrapEntry {
                handler: Handler::Pio(device),
                refcount: 0,
                pending_remove: false,
            },
        )?;
        Ok(())
    }

    /// Register an MMIO device over `[addr, addr + len)`.
    pub fn register_mmio(
        &self,
        addr: u64,
        len: u64,
        device: Arc<dyn MmioDevice>,
    ) -> Result<(), BusError> {
        let mut tree = self.tree.lock().unwrap();
        tree.insert(
            addr,
            addr + len,
            TrapEntry {
                handler: Handler::Mmio(device),
                refcount: 0,
                pending_remove: false,
            },
        )?;
        Ok(())
    }

    /// Deregister the device whose range starts at `start_addr`.
    ///
    /// If no handler invocation is currently in flight (refcount 0), the
    /// entry is removed immediately. Otherwise removal is deferred until
    /// the last in-flight invocation completes.
    pub fn deregister(&self, start_addr: u64) {
        let mut tree = self.tree.lock().unwrap();
        let Some(entry) = tree.get_mut(start_addr) else {
            return;
        };
        if entry.refcount == 0 {
            tree.remove(start_addr);
        } else {
            entry.pending_remove = true;
        }
    }

    /// Dispatch a single guest PIO exit.
    ///
    /// `data` holds `count` back-to-back `len`-byte transfers (string
    /// I/O); each chunk is delivered to the handler as its own call, with
    /// `data_ptr` advanced by `len` between iterations, per the hot-path
    /// algorithm this registry implements.
    pub fn dispatch_io(&self, port: u16, data: &mut [u8], is_write: bool, len: usize) -> IoOutcome {
        let low = port as u64;
        let high = low + len as u64;

        let key = {
            let mut tree = self.tree.lock().unwrap();
            let Some(key) = tree.search_range_key(low, high) else {
                return IoOutcome::Unhandled;
            };
            tree.get_mut(key).unwrap().refcount += 1;
            key
        };

        // Re-borrow the handler for the duration of the call without
        // holding the registry mutex, so deregistration on another
        // thread can proceed concurrently.
        let handler = {
            let mut tree = self.tree.lock().unwrap();
            match &tree.get_mut(key).unwrap().handler {
                Handler::Pio(dev) => dev.clone(),
                Handler::Mmio(_) => unreachable!("PIO range resolved to an MMIO handler"),
            }
        };

        for chunk in data.chunks_mut(len.max(1)) {
            if is_write {
                handler.io_out(port, chunk);
            } else {
                handler.io_in(port, chunk);
            }
        }

        self.finish_dispatch(key);
        IoOutcome::Handled
    }

    /// Dispatch a single guest MMIO exit.
    pub fn dispatch_mmio(&self, addr: u64, data: &mut [u8], is_write: bool) -> IoOutcome {
        let len = data.len() as u64;

        let key = {
            let mut tree = self.tree.lock().unwrap();
            let Some(key) = tree.search_range_key(addr, addr + len) else {
                return IoOutcome::Unhandled;
            };
            tree.get_mut(key).unwrap().refcount += 1;
            key
        };

        let handler = {
            let mut tree = self.tree.lock().unwrap();
            match &tree.get_mut(key).unwrap().handler {
                Handler::Mmio(dev) => dev.clone(),
                Handler::Pio(_) => unreachable!("MMIO range resolved to a PIO handler"),
            }
        };

        if is_write {
            handler.mmio_write(addr, data);
        } else {
            handler.mmio_read(addr, data);
        }

        self.finish_dispatch(key);
        IoOutcome::Handled
    }

    fn finish_dispatch(&self, key: u64) {
        let mut tree = self.tree.lock().unwrap();
        if let Some(entry) = tree.get_mut(key) {
            entry.refcount -= 1;
            if entry.pending_remove && entry.refcount == 0 {
                tree.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    struct CountingDevice {
        reads: AtomicU32,
        writes: AtomicU32,
    }

    impl PioDevice for CountingDevice {
        fn io_in(&self, _port: u16, data: &mut [u8]) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            data.fill(0x42);
        }
        fn io_out(&self, _port: u16, _data: &[u8]) {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn register_and_dispatch() {
        let bus = IoBus::new();
        let dev = Arc::new(CountingDevice {
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        });
        bus.register_pio(0x3f8, 8, dev.clone()).unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(bus.dispatch_io(0x3f8, &mut buf, false, 1), IoOutcome::Handled);
        assert_eq!(buf[0], 0x42);
        assert_eq!(dev.reads.load(Ordering::SeqCst), 1);

        assert_eq!(
            bus.dispatch_io(0x500, &mut buf, false, 1),
            IoOutcome::Unhandled
        );
    }

    #[test]
    fn overlap_rejected() {
        let bus = IoBus::new();
        let dev = Arc::new(CountingDevice {
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        });
        bus.register_pio(0x60, 2, dev.clone()).unwrap();
        assert!(bus.register_pio(0x61, 2, dev).is_err());
    }

    #[test]
    fn string_io_advances_chunks() {
        let bus = IoBus::new();
        let dev = Arc::new(CountingDevice {
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        });
        bus.register_pio(0x3f8, 8, dev.clone()).unwrap();

        let mut buf = [0u8; 3];
        bus.dispatch_io(0x3f8, &mut buf, false, 1);
        assert_eq!(dev.reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn deregister_under_concurrent_dispatch() {
        let bus = Arc::new(IoBus::new());
        let dev = Arc::new(CountingDevice {
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        });
        bus.register_pio(0x3f8, 8, dev.clone()).unwrap();

        let bus_a = bus.clone();
        let worker = thread::spawn(move || {
            let mut buf = [0u8; 1];
            for _ in 0..2000 {
                bus_a.dispatch_io(0x3f8, &mut buf, false, 1);
            }
        });

        bus.deregister(0x3f8);
        worker.join().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(
            bus.dispatch_io(0x3f8, &mut buf, false, 1),
            IoOutcome::Unhandled
        );
    }
}
