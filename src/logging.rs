//! Logging capability injected into each component at construction.
//!
//! Components never call the `log` macros directly. They hold a [`ConsumerLog`]
//! which prefixes every line with the consumer name and forwards it to a
//! [`log::Log`] sink: the process-wide logger in production, a capturing sink
//! in tests.

use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use log::{Level, Log, Metadata, Record};

const TARGET: &str = "rabbitmq_consumer";

/// Forwards to whatever logger `env_logger` (or anything else) installed.
struct ProcessLogger;

impl Log for ProcessLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level() && log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            log::logger().log(record);
        }
    }

    fn flush(&self) {
        log::logger().flush();
    }
}

/// A named handle onto a log sink.
#[derive(Clone)]
pub struct ConsumerLog {
    sink: Arc<dyn Log>,
    name: Arc<str>,
}

impl ConsumerLog {
    /// Logs through the process-wide `log` logger.
    pub fn process(name: &str) -> Self {
        Self::with_sink(name, Arc::new(ProcessLogger))
    }

    pub fn with_sink(name: &str, sink: Arc<dyn Log>) -> Self {
        Self {
            sink,
            name: Arc::from(name),
        }
    }

    /// Same sink, different component name.
    pub fn named(&self, name: &str) -> Self {
        Self {
            sink: self.sink.clone(),
            name: Arc::from(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The record carries the file and line of the calling code.
    #[track_caller]
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let caller = Location::caller();
        let metadata = Metadata::builder().level(level).target(TARGET).build();
        if !self.sink.enabled(&metadata) {
            return;
        }
        self.sink.log(
            &Record::builder()
                .metadata(metadata)
                .args(format_args!("[{}] {}", self.name, args))
                .file_static(Some(caller.file()))
                .line(Some(caller.line()))
                .build(),
        );
    }

    #[track_caller]
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    #[track_caller]
    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    #[track_caller]
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    #[track_caller]
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }
}

impl fmt::Debug for ConsumerLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerLog").field("name", &self.name).finish()
    }
}

#[cfg(test)]
pub(crate) mod capture {
    use std::sync::{Arc, Mutex};

    use log::{Level, Log, Metadata, Record};

    use super::ConsumerLog;

    /// Keeps every record in memory.
    #[derive(Default)]
    pub(crate) struct CapturingLog {
        lines: Mutex<Vec<(Level, String)>>,
        sources: Mutex<Vec<(String, u32)>>,
    }

    impl CapturingLog {
        pub(crate) fn lines(&self) -> Vec<(Level, String)> {
            self.lines.lock().unwrap().clone()
        }

        /// File and line of each record, in order.
        pub(crate) fn sources(&self) -> Vec<(String, u32)> {
            self.sources.lock().unwrap().clone()
        }

        pub(crate) fn contains(&self, level: Level, needle: &str) -> bool {
            self.lines()
                .iter()
                .any(|(l, line)| *l == level && line.contains(needle))
        }
    }

    impl Log for CapturingLog {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &Record<'_>) {
            self.sources.lock().unwrap().push((
                record.file().unwrap_or_default().to_string(),
                record.line().unwrap_or_default(),
            ));
            self.lines
                .lock()
                .unwrap()
                .push((record.level(), record.args().to_string()));
        }

        fn flush(&self) {}
    }

    pub(crate) fn capturing(name: &str) -> (ConsumerLog, Arc<CapturingLog>) {
        let sink = Arc::new(CapturingLog::default());
        (ConsumerLog::with_sink(name, sink.clone()), sink)
    }
}

#[cfg(test)]
mod tests {
    use super::capture::capturing;
    use log::Level;

    #[test]
    fn test_lines_are_prefixed_with_component_name() {
        let (log, sink) = capturing("PARSE_CONSUMER");
        log.info(format_args!("Connection opened"));
        log.named("SUPERVISOR").warn(format_args!("Reconnecting after {} seconds", 3));

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (Level::Info, "[PARSE_CONSUMER] Connection opened".to_string()));
        assert_eq!(lines[1], (Level::Warn, "[SUPERVISOR] Reconnecting after 3 seconds".to_string()));
    }

    #[test]
    fn test_records_point_at_calling_line() {
        let (log, sink) = capturing("PARSE_CONSUMER");

        let expected_line = line!() + 1;
        log.warn(format_args!("Channel was closed"));

        assert_eq!(sink.sources(), vec![(file!().to_string(), expected_line)]);
    }
}
