/*++

Licensed under the Apache-2.0 license.

File Name:

    logger.rs

Abstract:

    Console logger with an optional tee into the append-only trace log.

--*/

use log::{LevelFilter, Log, Metadata, Record};
use simple_logger::SimpleLogger;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

struct TraceLogger {
    console: SimpleLogger,
    trace: Option<Mutex<BufWriter<std::fs::File>>>,
}

impl Log for TraceLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata) || self.trace.is_some()
    }

    fn log(&self, record: &Record) {
        self.console.log(record);
        if let Some(trace) = &self.trace {
            let mut trace = trace.lock().unwrap();
            let _ = writeln!(trace, "[{:<5}] {}", record.level(), record.args());
            let _ = trace.flush();
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(trace) = &self.trace {
            let _ = trace.lock().unwrap().flush();
        }
    }
}

/// Installs the logger; `trace_log` receives every record additionally.
pub fn init(trace_log: Option<&Path>, verbose: bool) -> io::Result<()> {
    let trace = match trace_log {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(Mutex::new(BufWriter::new(file)))
        }
        None => None,
    };
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let logger = TraceLogger {
        console: SimpleLogger::new().with_level(level),
        trace,
    };
    log::set_boxed_logger(Box::new(logger))
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    log::set_max_level(level);
    Ok(())
}
