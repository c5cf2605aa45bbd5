//! Logger that prefixes every line with the program name and pid

use log::{Level, Log, Metadata, Record, SetLoggerError};
use std::io::{self, Write};

struct Logger {
    name: String,
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // the pid is looked up per line, forked children keep the same logger
        let line = format_line(&self.name, std::process::id(), record);
        let _ = io::stderr().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

fn format_line(name: &str, pid: u32, record: &Record) -> String {
    format!(
        "{} {} [{}] {}\n",
        record.level().as_str().to_lowercase(),
        name,
        pid,
        record.args()
    )
}

/// Install the logger. `name` is usually the program or stressor name.
pub fn init(name: &str, level: Level) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(Logger {
        name: name.to_string(),
        level,
    }))
    .map(|()| log::set_max_level(level.to_level_filter()))
}

#[test]
fn test_format_line() {
    let line = format_line(
        "kstress",
        42,
        &Record::builder()
            .args(format_args!("fork: child died: SIGBUS (instance 0)"))
            .level(Level::Debug)
            .build(),
    );
    assert_eq!(
        line,
        "debug kstress [42] fork: child died: SIGBUS (instance 0)\n"
    );
}
