//! `log` backend printing on the OS service console.
//!
//! Records go out as inline print frames, 29 bytes at a time, so nothing
//! needs to stay valid in DDR while the peer prints.

use arrayvec::ArrayVec;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Mutex, Once};

use crate::ipi::frame::INLINE_TEXT_MAX;
use crate::ipi::Transport;
use crate::os_services::OsServices;

pub struct ServiceLogger<T: Transport + Send> {
    level: LevelFilter,
    services: Once<Mutex<OsServices<T>>>,
}

impl<T: Transport + Send> ServiceLogger<T> {
    pub const fn new(level: LevelFilter) -> Self {
        ServiceLogger {
            level,
            services: Once::new(),
        }
    }

    /// Records are dropped until this is called. Only the first call counts.
    pub fn attach(&self, services: OsServices<T>) {
        self.services.call_once(|| Mutex::new(services));
    }

    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self).map(|_| log::set_max_level(self.level))
    }
}

impl<T: Transport + Send> Log for ServiceLogger<T> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(services) = self.services.get() else {
            return;
        };
        // A record raised while printing another one is lost.
        let Some(mut services) = services.try_lock() else {
            return;
        };

        let mut writer = InlineWriter::new(&mut services);
        let _ = writeln!(writer, "{} {}: {}", record.level(), record.target(), record.args());
        writer.flush();
    }

    fn flush(&self) {}
}

/// Packs formatted text into full inline print frames.
struct InlineWriter<'a, T: Transport> {
    services: &'a mut OsServices<T>,
    pending: ArrayVec<u8, INLINE_TEXT_MAX>,
}

impl<'a, T: Transport> InlineWriter<'a, T> {
    fn new(services: &'a mut OsServices<T>) -> Self {
        InlineWriter {
            services,
            pending: ArrayVec::new(),
        }
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.services.inline_print(&self.pending);
            self.pending.clear();
        }
    }
}

impl<T: Transport> fmt::Write for InlineWriter<'_, T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if self.pending.is_full() {
                self.flush();
            }
            self.pending.push(byte);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimPeer;
    use log::Level;

    fn log_to(logger: &ServiceLogger<SimPeer>, level: Level, text: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("boot_mmu::mmu")
                .args(format_args!("{}", text))
                .build(),
        );
    }

    fn printed(logger: &ServiceLogger<SimPeer>) -> std::string::String {
        let services = logger.services.get().unwrap().lock();
        std::string::String::from_utf8(services.transport().printed()).unwrap()
    }

    #[test]
    fn drops_records_until_attached() {
        let logger = ServiceLogger::<SimPeer>::new(LevelFilter::Trace);
        log_to(&logger, Level::Error, "lost");

        logger.attach(OsServices::new(SimPeer::new()));
        log_to(&logger, Level::Error, "kept");
        assert_eq!(printed(&logger), "ERROR boot_mmu::mmu: kept\n");
    }

    #[test]
    fn filters_by_level() {
        let logger = ServiceLogger::new(LevelFilter::Warn);
        logger.attach(OsServices::new(SimPeer::new()));

        log_to(&logger, Level::Debug, "noise");
        log_to(&logger, Level::Warn, "careful");
        assert_eq!(printed(&logger), "WARN boot_mmu::mmu: careful\n");
    }

    #[test]
    fn long_records_fill_whole_frames() {
        let logger = ServiceLogger::new(LevelFilter::Info);
        logger.attach(OsServices::new(SimPeer::new()));

        let text = "a record long enough to need three inline print frames";
        log_to(&logger, Level::Info, text);

        let expected = std::format!("INFO boot_mmu::mmu: {}\n", text);
        assert_eq!(printed(&logger), expected);

        let services = logger.services.get().unwrap().lock();
        let frames = services.transport().requests();
        assert_eq!(frames.len(), (expected.len() + INLINE_TEXT_MAX - 1) / INLINE_TEXT_MAX);
        assert!(frames[..frames.len() - 1].iter().all(|r| match r {
            crate::ipi::frame::Request::InlinePrint(text) => text.is_full(),
            _ => false,
        }));
    }
}
