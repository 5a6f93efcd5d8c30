//! Diagnostics sink.
//!
//! Analyses and passes never fail; structural IR problems and dynamically
//! undefined operations are reported here and recovery is local. Messages
//! carry the reporting source location and are mirrored to the `log` crate.

use core::fmt;
use std::panic::Location;

/// How bad it is.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Severity {
    /// A structural IR violation; the offending edge or operation was
    /// skipped.
    Error,
    /// A dynamically undefined operation; the transform was suppressed.
    Warning,
}

/// One reported message.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    /// Severity.
    pub severity: Severity,
    /// Reporting source file.
    pub file: &'static str,
    /// Reporting source line.
    pub line: u32,
    /// Message text.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}:{}: {}: {}", self.file, self.line, sev, self.message)
    }
}

/// Collects diagnostics for one procedure run.
#[derive(Default)]
pub struct Diagnostics {
    messages: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a structural IR error.
    #[track_caller]
    pub fn error(&mut self, message: impl Into<String>) {
        let loc = Location::caller();
        let message = message.into();
        log::error!("{}: {}", loc, message);
        self.messages.push(Diagnostic {
            severity: Severity::Error,
            file: loc.file(),
            line: loc.line(),
            message,
        });
    }

    /// Report a dynamically undefined operation.
    #[track_caller]
    pub fn warning(&mut self, message: impl Into<String>) {
        let loc = Location::caller();
        let message = message.into();
        log::warn!("{}: {}", loc, message);
        self.messages.push(Diagnostic {
            severity: Severity::Warning,
            file: loc.file(),
            line: loc.line(),
            message,
        });
    }

    /// All messages reported so far.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.messages.iter()
    }

    /// Number of messages with the given severity.
    pub fn count(&self, severity: Severity) -> usize {
        self.messages
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    /// Has anything been reported?
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop all messages.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
