pub mod error;
pub mod fmt;

use std::{
    sync::OnceLock,
    time::Instant,
};

use core::str::FromStr;

use parking_lot::Mutex;

use termcolor::{WriteColor, StandardStream, ColorChoice};

pub use termcolor::{ColorSpec, Color};

use rustc_hash::FxHashMap;

use compact_str::CompactString;

use crate::*;

use fmt::Record;

/// Handle to a format registered with [`custom_fmt`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CustomFmt(u32);

#[repr(i8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Level {
    Always = -1,
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

pub enum LevelFmt {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Other(CustomFmt, Level),
}

impl Level {

    pub fn name(self) -> &'static str {
        match self {
            Self::Always => "LOG",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

impl FromStr for Level {

    type Err = ();

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("error") {
            Ok(Self::Error)
        } else if s.eq_ignore_ascii_case("warn") {
            Ok(Self::Warn)
        } else if s.eq_ignore_ascii_case("info") {
            Ok(Self::Info)
        } else if s.eq_ignore_ascii_case("debug") {
            Ok(Self::Debug)
        } else if s.eq_ignore_ascii_case("trace") {
            Ok(Self::Trace)
        } else {
            Err(())
        }
    }
}

/// Per-target level filter parsed from a `target=level,level` string.
#[derive(Default)]
struct Filter {
    target_levels: FxHashMap<CompactString, Level>,
    base_level: Option<Level>,
}

impl Filter {

    fn parse(env: &str) -> Self {
        let mut filter = Self::default();
        for arg in env.split(',') {
            let arg = arg.trim();
            if arg.is_empty() {
                continue
            }
            let (module, level) = match arg.find('=') {
                Some(j) => (Some(arg[0..j].trim()), arg[j + 1..].trim()),
                None => (None, arg),
            };
            let Ok(level) = Level::from_str(level) else {
                continue
            };
            if let Some(module) = module {
                let entry = filter.target_levels
                    .entry(CompactString::new(module))
                    .or_insert(level);
                *entry = (*entry).min(level);
            } else {
                filter.base_level = Some(level);
            }
        }
        filter
    }

    fn target_level(&self, target: &str, default: Level) -> Level {
        let mut substr = target;
        if let Some(&level) = self.target_levels.get(substr) {
            return level
        }
        while let Some(i) = substr.rfind("::") {
            substr = &substr[0..i];
            if let Some(&level) = self.target_levels.get(substr) {
                return level
            }
        }
        self.base_level.unwrap_or(default)
    }
}

struct Logger {
    stderr: StandardStream,
    info_fmt: LogFmt,
    warn_fmt: LogFmt,
    error_fmt: LogFmt,
    debug_fmt: LogFmt,
    trace_fmt: LogFmt,
    custom_fmt: Vec<LogFmt>,
    filter: Filter,
    since: Instant,
}

impl Logger {

    fn new() -> Self {
        let filter = std::env::var("KASA_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .map(|env| Filter::parse(&env))
            .unwrap_or_default();
        Self {
            stderr: StandardStream::stderr(ColorChoice::Auto),
            info_fmt: LogFmt::tagged(Color::Green),
            warn_fmt: LogFmt::tagged(Color::Yellow),
            error_fmt: LogFmt::tagged(Color::Red),
            debug_fmt: LogFmt::tagged(Color::Blue),
            trace_fmt: LogFmt::tagged(Color::Magenta),
            custom_fmt: Vec::new(),
            filter,
            since: Instant::now(),
        }
    }

    fn log(&mut self, target: &str, level: LevelFmt, msg: core::fmt::Arguments) -> Result<bool> {
        let target_level = self.filter.target_level(target, Level::Warn);
        let (fmt, level) = match level {
            LevelFmt::Error => (&self.error_fmt, Level::Error),
            LevelFmt::Warn => (&self.warn_fmt, Level::Warn),
            LevelFmt::Info => (&self.info_fmt, Level::Info),
            LevelFmt::Debug => (&self.debug_fmt, Level::Debug),
            LevelFmt::Trace => (&self.trace_fmt, Level::Trace),
            LevelFmt::Other(fmt, level) => {
                let fmt = self.custom_fmt
                    .get(fmt.0 as usize)
                    .ok_or(LogError::InvalidFormat(fmt.0))?;
                (fmt, level)
            },
        };
        if target_level < level {
            return Ok(false)
        }
        fmt.write(&mut self.stderr, &Record {
            target,
            level,
            args: msg,
            since: self.since,
        })?;
        Ok(true)
    }
}

static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

#[inline(always)]
fn logger() -> &'static Mutex<Logger> {
    LOGGER.get_or_init(|| Mutex::new(Logger::new()))
}

/// Initializes the logger from `KASA_LOG` (or `RUST_LOG`).
///
/// Calling this is optional, the first log call initializes the logger lazily.
pub fn init() {
    logger();
}

/// Overrides the level of every target without an explicit filter entry.
pub fn set_base_level(level: Level) {
    logger().lock().filter.base_level = Some(level);
}

/// Overrides the level of `target` and every module below it.
pub fn set_target_level(target: &str, level: Level) {
    logger().lock().filter.target_levels.insert(CompactString::new(target), level);
}

/// Returns whether a message of `level` from `target` would be written.
pub fn enabled(target: &str, level: Level) -> bool {
    logger().lock().filter.target_level(target, Level::Warn) >= level
}

#[inline(always)]
pub fn error_fmt(mut f: impl FnMut(&mut LogFmtBuilder)) {
    let mut logger = logger().lock();
    let mut builder = LogFmtBuilder::new(&mut logger.error_fmt);
    f(&mut builder);
}

#[inline(always)]
pub fn warn_fmt(mut f: impl FnMut(&mut LogFmtBuilder)) {
    let mut logger = logger().lock();
    let mut builder = LogFmtBuilder::new(&mut logger.warn_fmt);
    f(&mut builder);
}

#[inline(always)]
pub fn info_fmt(mut f: impl FnMut(&mut LogFmtBuilder)) {
    let mut logger = logger().lock();
    let mut builder = LogFmtBuilder::new(&mut logger.info_fmt);
    f(&mut builder);
}

#[inline(always)]
pub fn debug_fmt(mut f: impl FnMut(&mut LogFmtBuilder)) {
    let mut logger = logger().lock();
    let mut builder = LogFmtBuilder::new(&mut logger.debug_fmt);
    f(&mut builder);
}

#[inline(always)]
pub fn trace_fmt(mut f: impl FnMut(&mut LogFmtBuilder)) {
    let mut logger = logger().lock();
    let mut builder = LogFmtBuilder::new(&mut logger.trace_fmt);
    f(&mut builder);
}

#[inline(always)]
pub fn custom_fmt(fmt: LogFmt) -> CustomFmt {
    let mut logger = logger().lock();
    let index = logger.custom_fmt.len() as u32;
    logger.custom_fmt.push(fmt);
    CustomFmt(index)
}

#[inline(always)]
pub fn log(target: &str, level: LevelFmt, args: core::fmt::Arguments) -> Result<bool> {
    logger()
        .lock()
        .log(target, level, args)
}

#[macro_export]
macro_rules! error {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::log(module_path!(), $crate::LevelFmt::Error, format_args!($fmt, $($arg),*))
            .unwrap_or(false)
    };
}

#[macro_export]
macro_rules! warn {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::log(module_path!(), $crate::LevelFmt::Warn, format_args!($fmt, $($arg),*))
            .unwrap_or(false)
    };
}

#[macro_export]
macro_rules! info {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::log(module_path!(), $crate::LevelFmt::Info, format_args!($fmt, $($arg),*))
            .unwrap_or(false)
    };
}

#[macro_export]
macro_rules! debug {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::log(module_path!(), $crate::LevelFmt::Debug, format_args!($fmt, $($arg),*))
            .unwrap_or(false)
    };
}

#[macro_export]
macro_rules! trace {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::log(module_path!(), $crate::LevelFmt::Trace, format_args!($fmt, $($arg),*))
            .unwrap_or(false)
    };
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn filter_parses_targets_and_base() {
        let filter = Filter::parse("info, kasa::memory=trace ,kasa::memory=debug,bogus=loud");
        assert_eq!(filter.base_level, Some(Level::Info));
        assert_eq!(filter.target_level("kasa::memory::heap", Level::Warn), Level::Debug);
        assert_eq!(filter.target_level("kasa::fence", Level::Warn), Level::Info);
        assert!(!filter.target_levels.contains_key("bogus"));
    }

    #[test]
    fn filter_falls_back_to_default() {
        let filter = Filter::parse("");
        assert_eq!(filter.target_level("anything", Level::Warn), Level::Warn);
    }
}
