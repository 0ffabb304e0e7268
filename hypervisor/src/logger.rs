//! The debug-ring logger.
//!
//! Formatted `log` records are pushed byte-wise into the shared debug
//! ring the host drains. One writer per CPU, serialized by a spinlock;
//! readers never block the writer.

use {
    core::fmt::{self, Write},
    mirage_shared::ring::DebugRing,
    spin::Mutex,
};

/// Installs the ring logger. `ring` is the loader-owned debug ring,
/// already mapped into the VMM address space; it must stay valid for the
/// lifetime of the VMM.
///
/// # Safety
///
/// The caller guarantees `ring` points at a live `DebugRing` that no one
/// else writes concurrently.
pub unsafe fn init_ring_logger(
    ring: *mut DebugRing,
    level: log::LevelFilter,
) -> Result<(), log::SetLoggerError> {
    *RING_LOGGER.ring.lock() = Some(RingWriter(ring));
    log::set_logger(&RING_LOGGER).map(|()| log::set_max_level(level))
}

struct RingLogger {
    ring: Mutex<Option<RingWriter>>,
}

struct RingWriter(*mut DebugRing);

// The pointer is only dereferenced under the logger's lock.
unsafe impl Send for RingWriter {}

impl Write for RingWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let ring = unsafe { &mut *self.0 };
        ring.write_bytes(s.as_bytes());
        Ok(())
    }
}

impl log::Log for RingLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(writer) = self.ring.lock().as_mut() {
            let _ = writeln!(writer, "{}: {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static RING_LOGGER: RingLogger = RingLogger {
    ring: Mutex::new(None),
};
