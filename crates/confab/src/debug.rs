//! Leveled, categorized diagnostic output.
//!
//! Every record is forwarded both to the installed [`DebugUiOps`] (or an
//! ANSI-colorizing stderr fallback) and to `tracing`, so embedders can pick
//! either surface. State is loop-local: the sink lives in a thread-local,
//! matching the single-threaded core.
//!
//! `CONFAB_VERBOSE_DEBUG` and `CONFAB_UNSAFE_DEBUG` seed the verbose and
//! unsafe flags once, at [`init`]; they are never re-read.

use std::cell::RefCell;
use std::io::{IsTerminal, Write};
use std::rc::Rc;

/// Debug levels, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Matches every level; only meaningful as a filter.
    All,
    /// General chatter.
    Misc,
    /// Normal operation.
    Info,
    /// Something unexpected but recoverable.
    Warning,
    /// An operation failed.
    Error,
    /// The process cannot continue.
    Fatal,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::All => "all",
            Level::Misc => "misc",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    fn ansi(self) -> &'static str {
        match self {
            Level::All | Level::Misc => "\x1b[2m",
            Level::Info => "",
            Level::Warning => "\x1b[33m",
            Level::Error => "\x1b[31m",
            Level::Fatal => "\x1b[1;31m",
        }
    }
}

/// Embedder-supplied sink.
pub trait DebugUiOps {
    /// Deliver one formatted record.
    fn print(&self, level: Level, category: &str, message: &str);

    /// Whether records at `level`/`category` are worth formatting at all.
    fn is_enabled(&self, _level: Level, _category: &str) -> bool {
        true
    }
}

struct State {
    enabled: bool,
    verbose: bool,
    unsafe_ok: bool,
    colorize: bool,
    ops: Option<Rc<dyn DebugUiOps>>,
}

impl Default for State {
    fn default() -> Self {
        State {
            enabled: true,
            verbose: false,
            unsafe_ok: false,
            colorize: std::io::stderr().is_terminal(),
            ops: None,
        }
    }
}

thread_local! {
    static STATE: RefCell<State> = RefCell::new(State::default());
}

/// Seed flags from the environment. Called once from `core::init`.
pub(crate) fn init() {
    STATE.with_borrow_mut(|s| {
        if std::env::var_os("CONFAB_VERBOSE_DEBUG").is_some() {
            s.verbose = true;
        }
        if std::env::var_os("CONFAB_UNSAFE_DEBUG").is_some() {
            s.unsafe_ok = true;
        }
    });
}

pub(crate) fn reset() {
    STATE.with_borrow_mut(|s| *s = State::default());
}

/// Install the embedder's sink.
pub fn set_ui_ops(ops: Rc<dyn DebugUiOps>) {
    STATE.with_borrow_mut(|s| s.ops = Some(ops));
}

/// Master switch.
pub fn set_enabled(enabled: bool) {
    STATE.with_borrow_mut(|s| s.enabled = enabled);
}

pub fn is_enabled() -> bool {
    STATE.with_borrow(|s| s.enabled)
}

pub fn set_verbose(verbose: bool) {
    STATE.with_borrow_mut(|s| s.verbose = verbose);
}

/// Whether chatty diagnostics should be produced.
pub fn is_verbose() -> bool {
    STATE.with_borrow(|s| s.verbose)
}

/// Whether logging secrets (passwords, raw auth exchanges) is permitted.
pub fn is_unsafe() -> bool {
    STATE.with_borrow(|s| s.unsafe_ok)
}

/// Emit one record.
pub fn log(level: Level, category: &str, message: &str) {
    match level {
        Level::All | Level::Misc => {
            tracing::trace!(category, "{message}");
        }
        Level::Info => tracing::debug!(category, "{message}"),
        Level::Warning => tracing::warn!(category, "{message}"),
        Level::Error | Level::Fatal => tracing::error!(category, "{message}"),
    }

    // Snapshot outside the borrow so a sink that logs (or re-installs
    // itself) cannot re-enter a held cell.
    let (enabled, ops, colorize) =
        STATE.with_borrow(|s| (s.enabled, s.ops.clone(), s.colorize));
    if !enabled {
        return;
    }
    match ops {
        Some(ops) => {
            if ops.is_enabled(level, category) {
                ops.print(level, category, message);
            }
        }
        None => {
            let mut err = std::io::stderr().lock();
            let (pre, post) = if colorize {
                (level.ansi(), "\x1b[0m")
            } else {
                ("", "")
            };
            let _ = writeln!(err, "{pre}{}: {category}: {message}{post}", level.label());
        }
    }
}

/// General chatter.
pub fn misc(category: &str, message: &str) {
    log(Level::Misc, category, message);
}

/// Normal operation.
pub fn info(category: &str, message: &str) {
    log(Level::Info, category, message);
}

pub fn warning(category: &str, message: &str) {
    log(Level::Warning, category, message);
}

pub fn error(category: &str, message: &str) {
    log(Level::Error, category, message);
}

pub fn fatal(category: &str, message: &str) {
    log(Level::Fatal, category, message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct Capture {
        records: StdRefCell<Vec<(Level, String, String)>>,
    }

    impl DebugUiOps for Capture {
        fn print(&self, level: Level, category: &str, message: &str) {
            self.records
                .borrow_mut()
                .push((level, category.into(), message.into()));
        }

        fn is_enabled(&self, level: Level, _category: &str) -> bool {
            level >= Level::Info
        }
    }

    #[test]
    fn test_ops_receive_records() {
        let cap = Rc::new(Capture { records: StdRefCell::new(Vec::new()) });
        set_ui_ops(cap.clone());
        info("unit", "hello");
        misc("unit", "filtered out");
        let records = cap.records.borrow();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, Level::Info);
        assert_eq!(records[0].1, "unit");
        reset();
    }

    #[test]
    fn test_disabled_suppresses() {
        let cap = Rc::new(Capture { records: StdRefCell::new(Vec::new()) });
        set_ui_ops(cap.clone());
        set_enabled(false);
        error("unit", "dropped");
        assert!(cap.records.borrow().is_empty());
        reset();
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Fatal > Level::Error);
        assert!(Level::Error > Level::Warning);
        assert!(Level::Misc > Level::All);
    }
}
