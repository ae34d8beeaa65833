//! Logging setup for rover executables
//!
//! Every record goes to stdout and to the session log file. Records carry the seconds elapsed since
//! the session began, the executable and the emitting thread, since executables such as the
//! coordinator log from several threads at once (`coordinator`, `dispatch`, `status_server`, ...).
//! Level tags are coloured on stdout only, the log file stays plain text.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External imports
use colored::{ColoredString, Colorize};
use log::{self, info, Level, Record};
use thiserror::Error;

// Internal imports
use crate::session;

// Re-exports
pub use log::LevelFilter;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Targets capped at `Info` whatever the requested level. zmq reports every socket monitor event
/// at debug, which buries the executable's own debug output.
const QUIET_TARGETS: [&str; 1] = ["zmq"];

/// Name used for threads spawned without one.
const UNNAMED_THREAD: &str = "?";

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors associated with initialising the logger.
#[derive(Debug, Error)]
pub enum LoggerInitError {
    #[error("Expected a log level of at least `INFO`, found `{0}`")]
    InvalidMinLogLevel(log::LevelFilter),

    #[error("Error initialising the log file: {0}")]
    LogFileInitError(std::io::Error),

    #[error("An error occured while setting up the logger: {0}")]
    FernInitError(log::SetLoggerError),
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Initialise the logger for this execution.
///
/// `min_level` must be at least `Info`. Only call this once per process, a second call fails with
/// [`LoggerInitError::FernInitError`].
pub fn logger_init(
    min_level: LevelFilter,
    session: &session::Session,
) -> Result<(), LoggerInitError> {
    if min_level < Level::Info {
        return Err(LoggerInitError::InvalidMinLogLevel(min_level));
    }

    let log_file = fern::log_file(session.log_file_path.clone())
        .map_err(LoggerInitError::LogFileInitError)?;

    let stdout_exec = session.exec_name.clone();
    let file_exec = session.exec_name.clone();

    let mut dispatch = fern::Dispatch::new().level(min_level);
    for target in QUIET_TARGETS.iter() {
        dispatch = dispatch.level_for(*target, LevelFilter::Info);
    }

    dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    out.finish(format_args!(
                        "{} {}",
                        prefix(&stdout_exec, record, level_colour(record.level())),
                        message
                    ))
                })
                .chain(std::io::stdout()),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    out.finish(format_args!(
                        "{} {}",
                        prefix(&file_exec, record, level_tag(record.level())),
                        message
                    ))
                })
                .chain(log_file),
        )
        .apply()
        .map_err(LoggerInitError::FernInitError)?;

    info!("Logging initialised");
    if let Some(epoch) = session::get_epoch() {
        info!("    Session epoch: {}", epoch);
    }
    info!("    Log level: {:?}", min_level);
    info!("    Log file path: {:?}", session.log_file_path);

    Ok(())
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn prefix<T: std::fmt::Display>(exec_name: &str, record: &Record, tag: T) -> String {
    format_prefix(
        session::get_elapsed_seconds(),
        exec_name,
        std::thread::current().name().unwrap_or(UNNAMED_THREAD),
        tag,
        // The target is only useful when debugging
        match record.level() > Level::Info {
            true => Some(record.target()),
            false => None,
        },
    )
}

/// Build the `[elapsed exec/thread LVL] target:` prefix of a record.
fn format_prefix<T: std::fmt::Display>(
    elapsed_s: f64,
    exec_name: &str,
    thread_name: &str,
    tag: T,
    target: Option<&str>,
) -> String {
    match target {
        Some(t) => format!(
            "[{:10.6} {}/{} {}] {}:",
            elapsed_s, exec_name, thread_name, tag, t
        ),
        None => format!("[{:10.6} {}/{} {}]", elapsed_s, exec_name, thread_name, tag),
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Trace => "TRC",
        Level::Debug => "DBG",
        Level::Info => "INF",
        Level::Warn => "WRN",
        Level::Error => "ERR",
    }
}

fn level_colour(level: Level) -> ColoredString {
    let tag = level_tag(level);

    match level {
        Level::Trace => tag.dimmed().italic(),
        Level::Debug => tag.dimmed(),
        Level::Info => tag.normal(),
        Level::Warn => tag.yellow(),
        Level::Error => tag.red().bold(),
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prefix() {
        assert_eq!(
            format_prefix(1.5, "coord_exec", "dispatch", level_tag(Level::Warn), None),
            "[  1.500000 coord_exec/dispatch WRN]"
        );
        assert_eq!(
            format_prefix(
                0.25,
                "coord_exec",
                "coordinator",
                level_tag(Level::Debug),
                Some("coord_lib::coordinator")
            ),
            "[  0.250000 coord_exec/coordinator DBG] coord_lib::coordinator:"
        );
    }

    #[test]
    fn test_level_tags_plain() {
        for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error].iter() {
            let tag = level_tag(*level);
            assert_eq!(tag.len(), 3);
            assert!(tag.chars().all(|c| c.is_ascii_uppercase()));
        }
    }
}
