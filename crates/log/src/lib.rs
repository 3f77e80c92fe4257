//! Process-wide logging for the node crates.
//!
//! One packed atomic word holds the runtime settings, so reconfiguring
//! and the per-call threshold check are both lock-free. Lines go to
//! stderr, either as human-readable text or as JSON records.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Accepts the level names used on the command line, case-insensitive.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        for (name, level) in [
            ("error", Self::Error),
            ("warn", Self::Warn),
            ("warning", Self::Warn),
            ("info", Self::Info),
            ("debug", Self::Debug),
            ("trace", Self::Trace),
        ] {
            if raw.eq_ignore_ascii_case(name) {
                return Some(level);
            }
        }
        None
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("text") {
            Some(Self::Text)
        } else if raw.eq_ignore_ascii_case("json") {
            Some(Self::Json)
        } else {
            None
        }
    }
}

/// Runtime logging settings, applied with [`init`].
#[derive(Clone, Copy, Debug)]
pub struct LogSettings {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

// Settings packed into one word: low three bits carry the level, then
// one bit each for JSON output and timestamps.
const LEVEL_MASK: u32 = 0b0111;
const JSON_BIT: u32 = 1 << 3;
const TIMESTAMP_BIT: u32 = 1 << 4;

const DEFAULT_WORD: u32 = Level::Info as u32 | TIMESTAMP_BIT;

static SETTINGS: AtomicU32 = AtomicU32::new(DEFAULT_WORD);

pub fn init(settings: LogSettings) {
    let mut word = settings.level as u32;
    if settings.format == Format::Json {
        word |= JSON_BIT;
    }
    if settings.timestamps {
        word |= TIMESTAMP_BIT;
    }
    SETTINGS.store(word, Ordering::Relaxed);
}

pub fn level_enabled(level: Level) -> bool {
    level as u32 <= SETTINGS.load(Ordering::Relaxed) & LEVEL_MASK
}

/// Call site captured by the logging macros.
#[derive(Clone, Copy, Debug)]
pub struct Site {
    pub module: &'static str,
    pub file: &'static str,
    pub line: u32,
}

/// Writes one record. The macros have already checked the level.
pub fn emit(level: Level, site: Site, args: fmt::Arguments<'_>) {
    let word = SETTINGS.load(Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let mut line = String::with_capacity(96);
    if word & JSON_BIT != 0 {
        let record = json!({
            "ts_ms": now.as_millis() as u64,
            "level": level.label(),
            "target": site.module,
            "file": site.file,
            "line": site.line,
            "msg": args.to_string(),
        });
        line.push_str(&record.to_string());
    } else {
        if word & TIMESTAMP_BIT != 0 {
            push_utc(&mut line, now.as_secs(), now.subsec_millis());
            line.push(' ');
        }
        line.push_str(level.label());
        line.push(' ');
        line.push_str(site.module);
        line.push_str(": ");
        let _ = fmt::write(&mut line, args);
    }
    line.push('\n');

    let _ = io::stderr().lock().write_all(line.as_bytes());
}

#[macro_export]
macro_rules! log_site {
    () => {
        $crate::Site {
            module: module_path!(),
            file: file!(),
            line: line!(),
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        if $crate::level_enabled($crate::Level::Error) {
            $crate::emit($crate::Level::Error, $crate::log_site!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        if $crate::level_enabled($crate::Level::Warn) {
            $crate::emit($crate::Level::Warn, $crate::log_site!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        if $crate::level_enabled($crate::Level::Info) {
            $crate::emit($crate::Level::Info, $crate::log_site!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        if $crate::level_enabled($crate::Level::Debug) {
            $crate::emit($crate::Level::Debug, $crate::log_site!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        if $crate::level_enabled($crate::Level::Trace) {
            $crate::emit($crate::Level::Trace, $crate::log_site!(), format_args!($($arg)*));
        }
    }};
}

fn is_leap_year(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_year(year: u32) -> u64 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

const MONTH_LENGTHS: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Appends `secs.millis` since the epoch as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
///
/// Log volume is low enough that walking the calendar year by year
/// beats carrying a closed-form date conversion around.
fn push_utc(out: &mut String, unix_seconds: u64, millis: u32) {
    let mut days = unix_seconds / 86_400;
    let secs_of_day = unix_seconds % 86_400;

    let mut year = 1970u32;
    while days >= days_in_year(year) {
        days -= days_in_year(year);
        year += 1;
    }

    let mut month = 0usize;
    loop {
        let mut len = MONTH_LENGTHS[month];
        if month == 1 && is_leap_year(year) {
            len += 1;
        }
        if days < len {
            break;
        }
        days -= len;
        month += 1;
    }

    use fmt::Write as _;
    let _ = write!(
        out,
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z",
        month = month + 1,
        day = days + 1,
        hour = secs_of_day / 3600,
        minute = (secs_of_day % 3600) / 60,
        second = secs_of_day % 60,
    );
}
