//! Diagnostic logging for the `OxideC` runtime.
//!
//! The runtime has no error channel at the message-send call site, so every
//! diagnostic it produces goes through this crate: recoverable oddities
//! (forwarding fallbacks, type mismatches) are logged and dispatch carries
//! on, while unrecoverable conditions go through [`fatal!`], which reports
//! and aborts the process.
//!
//! All output is written to standard error. The level tag is colored only
//! when standard error is a terminal.
//!
//! # Example
//!
//! ```
//! use oxidec_log::{debug, warn, Level};
//!
//! oxidec_log::set_level(Level::Debug);
//!
//! debug!("built dispatch table for {}", "NSObject");
//! warn!("{} does not recognize selector {}", "NSObject", "frobnicate");
//! ```

use std::fmt::Arguments;
use std::io::{IsTerminal, Write};
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Environment variable consulted by [`init_from_env`].
pub const LOG_ENV_VAR: &str = "OXIDEC_LOG";

/// Severity of a log record.
///
/// Lower numeric values are more severe; a logger at level `L` emits every
/// record whose level is `<= L`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Unrecoverable or near-unrecoverable runtime conditions.
    Error = 0,
    /// Recovered conditions a developer probably wants to know about.
    Warn = 1,
    /// Coarse lifecycle events (images loaded, classes registered).
    Info = 2,
    /// Table builds, class resolution, initializers.
    Debug = 3,
    /// Per-selector and per-method detail.
    Trace = 4,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Level {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl FromStr for Level {
    type Err = String;

    /// Parses a level name, case-insensitively.
    ///
    /// ```
    /// use oxidec_log::Level;
    ///
    /// assert_eq!("debug".parse::<Level>(), Ok(Level::Debug));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(format!("invalid log level: {s}")),
        }
    }
}

/// Process-wide logger state.
///
/// Obtained through [`get_logger`]. The level is a single atomic, so
/// filtering a disabled record costs one relaxed load.
pub struct Logger {
    level: AtomicU8,
    colored: bool,
}

impl Logger {
    fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            colored: std::io::stderr().is_terminal(),
        }
    }

    /// Sets the most verbose level that will be emitted.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Returns the current level.
    #[must_use]
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Returns `true` if a record at `level` would be emitted.
    #[must_use]
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    fn write_record(&self, level: Level, target: &str, args: Arguments) {
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        // A failed diagnostic write has nowhere left to be reported.
        let _ = if self.colored {
            writeln!(
                out,
                "{}[{}]\x1b[0m {target}: {args}",
                level.color_code(),
                level.as_str()
            )
        } else {
            writeln!(out, "[{}] {target}: {args}", level.as_str())
        };
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, creating it at [`Level::Warn`] on first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Warn))
}

/// Sets the global log level.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the global log level from its name.
///
/// # Errors
///
/// Returns the rejected input when it does not name a [`Level`].
pub fn set_level_from_str(s: &str) -> Result<(), String> {
    set_level(s.parse()?);
    Ok(())
}

/// Applies `OXIDEC_LOG` if it is set to a valid level.
///
/// Returns the level in effect afterwards. An invalid value is reported at
/// warn level and otherwise ignored.
pub fn init_from_env() -> Level {
    if let Ok(value) = std::env::var(LOG_ENV_VAR) {
        if let Err(e) = set_level_from_str(&value) {
            __log_with_target(Level::Warn, module_path!(), format_args!("{LOG_ENV_VAR}: {e}"));
        }
    }
    get_logger().level()
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments) {
    let logger = get_logger();
    if logger.enabled(level) {
        logger.write_record(level, target, args);
    }
}

/// Extra diagnostics run by [`fatal!`] just before the process aborts.
pub type FatalHook = fn();

static FATAL_HOOK: AtomicPtr<()> = AtomicPtr::new(std::ptr::null_mut());

/// Installs the hook run by [`fatal!`] before aborting. Last writer wins.
pub fn set_fatal_hook(hook: FatalHook) {
    FATAL_HOOK.store(hook as *mut (), Ordering::Release);
}

#[doc(hidden)]
pub fn __fatal(target: &str, args: Arguments) -> ! {
    // Fatal records ignore the level filter.
    get_logger().write_record(Level::Error, target, args);
    let raw = FATAL_HOOK.load(Ordering::Acquire);
    if !raw.is_null() {
        // SAFETY: only `set_fatal_hook` stores into FATAL_HOOK, always from
        // a valid `FatalHook`.
        let hook: FatalHook = unsafe { std::mem::transmute::<*mut (), FatalHook>(raw) };
        hook();
    }
    std::process::abort()
}

/// Logs at the given level, capturing the calling module as the target.
///
/// ```
/// use oxidec_log::{log, Level};
///
/// log!(level: Level::Info, "loaded {} classes", 3);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::get_logger().enabled(level) {
            $crate::__log_with_target(level, module_path!(), format_args!($($arg)*));
        }
    }};
}

/// Logs at [`Level::Error`].
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Error, $($arg)*) };
}

/// Logs at [`Level::Warn`].
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Warn, $($arg)*) };
}

/// Logs at [`Level::Info`].
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Info, $($arg)*) };
}

/// Logs at [`Level::Debug`].
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Debug, $($arg)*) };
}

/// Logs at [`Level::Trace`].
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Trace, $($arg)*) };
}

/// Reports an unrecoverable runtime condition and aborts the process.
///
/// The record is written regardless of the configured level, the hook
/// installed with [`set_fatal_hook`] runs, and then
/// [`std::process::abort`] is called. Shared runtime structures may be
/// half-linked at this point, so unwinding is never attempted.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::__fatal(module_path!(), format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("error".parse::<Level>(), Ok(Level::Error));
        assert_eq!("Warning".parse::<Level>(), Ok(Level::Warn));
        assert_eq!(" info ".parse::<Level>(), Ok(Level::Info));
        assert_eq!("TRACE".parse::<Level>(), Ok(Level::Trace));
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn test_level_round_trips_through_u8() {
        for level in [Level::Error, Level::Warn, Level::Info, Level::Debug, Level::Trace] {
            assert_eq!(Level::from_u8(level as u8), level);
        }
    }

    #[test]
    fn test_logger_filtering() {
        let logger = Logger::new(Level::Warn);
        assert!(logger.enabled(Level::Error));
        assert!(logger.enabled(Level::Warn));
        assert!(!logger.enabled(Level::Info));

        logger.set_level(Level::Trace);
        assert!(logger.enabled(Level::Trace));
        assert_eq!(logger.level(), Level::Trace);
    }

    #[test]
    fn test_set_level_from_str_rejects_garbage() {
        assert!(set_level_from_str("nonsense").is_err());
    }

    #[test]
    fn test_macros_from_many_threads() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    warn!("thread {i} warning");
                    trace!("thread {i} trace");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
