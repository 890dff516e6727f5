use flume::{Receiver, Sender, unbounded};
use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use owo_colors::OwoColorize;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

pub static PROGRAM_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

struct Logger {
    level: LevelFilter,
    file: Option<Sender<String>>,
}

fn colored_level(level: Level) -> String {
    match level {
        Level::Error => format!("{}", "ERROR".red()),
        Level::Warn => format!("{}", " WARN".yellow()),
        Level::Info => format!("{}", " INFO".green()),
        Level::Debug => format!("{}", "DEBUG".blue()),
        Level::Trace => format!("{}", "TRACE".magenta()),
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let time_ms = PROGRAM_START_TIME.elapsed().as_secs_f64() * 1000.0;
        eprintln!(
            "[{:>12.3}ms] {} {}",
            time_ms.red(),
            colored_level(record.level()),
            record.args()
        );

        if let Some(file) = &self.file {
            let _ = file.send(format!(
                "[{time_ms:.3}ms] {:>5} {}: {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

fn log_writer(rx: Receiver<String>, log_file: PathBuf) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    while let Ok(line) = rx.recv() {
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// Installs the process logger. Lines go to stderr and, when `log_file` is
/// set, are appended to it from a writer thread.
pub fn init(level: LevelFilter, log_file: Option<PathBuf>) -> Result<(), log::SetLoggerError> {
    Lazy::force(&PROGRAM_START_TIME);

    let file = log_file.map(|path| {
        let (logger_tx, logger_rx) = unbounded();
        std::thread::spawn(move || {
            if let Err(err) = log_writer(logger_rx, path) {
                eprintln!("Log file writer stopped: {err}");
            }
        });
        logger_tx
    });

    log::set_logger(Box::leak(Box::new(Logger { level, file })))?;
    log::set_max_level(level);
    Ok(())
}
