//! Logging for the lazuli binaries.
//!
//! Records are captured on the calling thread and handed through a bounded
//! queue to a writer thread that owns the sink, so logging from the packet
//! path never blocks on a slow terminal. When the queue is full the record
//! is dropped and counted; the count is reported on the next record that
//! does get through.

use chrono::{DateTime, Local};
use log::{Level, Log, Metadata, Record, SetLoggerError, set_boxed_logger, set_max_level};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One record, captured where it happened and formatted on the writer
/// thread.
struct Line {
    at: DateTime<Local>,
    level: Level,
    target: String,
    text: String,
}

enum Command {
    Line(Line),
    /// Flush the sink and acknowledge, so `log::logger().flush()` only
    /// returns once everything queued before it is out.
    Flush(SyncSender<()>),
}

pub struct LazuliLogger {
    max_level: Level,
    tx: SyncSender<Command>,
    /// Records discarded because the queue was full.
    dropped: AtomicU64,
}

impl LazuliLogger {
    /// Installs the logger writing to stdout.
    pub fn init(max_level: Level) -> Result<(), SetLoggerError> {
        Self::init_with(max_level, DEFAULT_QUEUE_CAPACITY, io::stdout())
    }

    /// Installs the logger with an explicit queue capacity and sink.
    pub fn init_with<W>(max_level: Level, capacity: usize, sink: W) -> Result<(), SetLoggerError>
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = sync_channel(capacity);
        thread::Builder::new()
            .name("lazuli-log".into())
            .spawn(move || write_loop(rx, sink))
            .expect("spawning the log writer thread");

        set_boxed_logger(Box::new(LazuliLogger { max_level, tx, dropped: AtomicU64::new(0) }))?;
        set_max_level(max_level.to_level_filter());
        Ok(())
    }
}

fn write_loop<W: Write>(rx: Receiver<Command>, mut sink: W) {
    while let Ok(command) = rx.recv() {
        match command {
            Command::Line(line) => {
                let _ = writeln!(
                    sink,
                    "[{} {:<5}] {}: {}",
                    line.at.format("%H:%M:%S%.3f"),
                    line.level,
                    line.target,
                    line.text
                );
            }
            Command::Flush(ack) => {
                let _ = sink.flush();
                let _ = ack.send(());
            }
        }
    }
    // Channel gone: the logger was dropped. Get the tail out.
    let _ = sink.flush();
}

impl Log for LazuliLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        let mut text = record.args().to_string();
        if dropped > 0 {
            text.push_str(&format!(" ({dropped} earlier records dropped)"));
        }

        let line = Line {
            at: Local::now(),
            level: record.level(),
            target: record.target().to_string(),
            text,
        };
        if self.tx.try_send(Command::Line(line)).is_err() {
            // Queue full (or writer gone): drop rather than stall the
            // caller, but keep the count, this record's included.
            self.dropped.fetch_add(dropped + 1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {
        let (ack_tx, ack_rx) = sync_channel(1);
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logger(max_level: Level, capacity: usize) -> (LazuliLogger, Receiver<Command>) {
        let (tx, rx) = sync_channel(capacity);
        (LazuliLogger { max_level, tx, dropped: AtomicU64::new(0) }, rx)
    }

    fn emit(logger: &LazuliLogger, level: Level, text: &str) {
        logger.log(
            &Record::builder()
                .args(format_args!("{text}"))
                .level(level)
                .target("lazuli::test")
                .build(),
        );
    }

    #[test]
    fn formats_through_the_writer() {
        let (logger, rx) = logger(Level::Trace, 8);
        let sink = SharedSink::default();

        emit(&logger, Level::Info, "hello");
        emit(&logger, Level::Warn, "uh oh");
        drop(logger);
        write_loop(rx, sink.clone());

        let out = sink.contents();
        assert!(out.contains("INFO ] lazuli::test: hello"), "{out:?}");
        assert!(out.contains("WARN ] lazuli::test: uh oh"), "{out:?}");
    }

    #[test]
    fn records_above_max_level_are_skipped() {
        let (logger, rx) = logger(Level::Info, 8);
        let sink = SharedSink::default();

        emit(&logger, Level::Debug, "too chatty");
        emit(&logger, Level::Info, "kept");
        drop(logger);
        write_loop(rx, sink.clone());

        let out = sink.contents();
        assert!(!out.contains("too chatty"));
        assert!(out.contains("kept"));
    }

    #[test]
    fn full_queue_drops_are_counted_and_reported() {
        let (logger, rx) = logger(Level::Trace, 1);
        let sink = SharedSink::default();

        emit(&logger, Level::Info, "one");
        emit(&logger, Level::Info, "two");
        emit(&logger, Level::Info, "three");
        assert_eq!(logger.dropped.load(Ordering::Relaxed), 2);

        // Free the slot; the next record carries the count.
        let first = rx.try_recv();
        assert!(first.is_ok());
        emit(&logger, Level::Info, "four");

        drop(logger);
        write_loop(rx, sink.clone());

        let out = sink.contents();
        assert!(out.contains("four (2 earlier records dropped)"), "{out:?}");
        assert!(!out.contains("two"));
        assert!(!out.contains("three"));
    }

    #[test]
    fn flush_acknowledges_even_without_records() {
        let (logger, rx) = logger(Level::Trace, 4);
        let sink = SharedSink::default();
        let writer = thread::spawn(move || write_loop(rx, sink));

        // Must not hang.
        logger.flush();
        emit(&logger, Level::Info, "after flush");
        logger.flush();

        drop(logger);
        writer.join().unwrap();
    }
}
