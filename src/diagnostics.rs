//! Shared diagnostic type used by every pipeline stage. Each stage owns a
//! local [`Diagnostics`] buffer which the driver drains at phase boundaries.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use colored::Colorize;
use serde::{Deserialize, Serialize};

/// A zero-based (line, column) pair. Every token and every AST node carries
/// the position of its first significant character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.column + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub position: Position,
    pub file_path: PathBuf,
    pub message: String,
}

impl Diagnostic {
    /// Render with severity colouring for terminal output.
    pub fn ansi(&self) -> String {
        let severity = match self.severity {
            Severity::Info => "info".cyan(),
            Severity::Warning => "warning".yellow(),
            Severity::Error => "error".red(),
        };
        format!(
            "{severity}: {} ({}:{})",
            self.message,
            self.file_path.display(),
            self.position
        )
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} ({}:{})",
            self.severity,
            self.message,
            self.file_path.display(),
            self.position
        )
    }
}

/// A per-subsystem diagnostics buffer. Errors flip `has_errors`, which the
/// driver consults when deciding whether to run the link step.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
    has_errors: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(
        &mut self,
        severity: Severity,
        position: Position,
        file_path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) {
        if severity == Severity::Error {
            self.has_errors = true;
        }
        self.list.push(Diagnostic {
            severity,
            position,
            file_path: file_path.into(),
            message: message.into(),
        });
    }

    pub fn info(&mut self, position: Position, file: &Path, message: impl Into<String>) {
        self.report(Severity::Info, position, file, message);
    }

    pub fn warning(&mut self, position: Position, file: &Path, message: impl Into<String>) {
        self.report(Severity::Warning, position, file, message);
    }

    pub fn error(&mut self, position: Position, file: &Path, message: impl Into<String>) {
        self.report(Severity::Error, position, file, message);
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.list.iter()
    }

    /// Move every buffered diagnostic into `target`, leaving this buffer
    /// empty. The `has_errors` flag carries over.
    pub fn drain_into(&mut self, target: &mut Diagnostics) {
        if self.has_errors {
            target.has_errors = true;
        }
        target.list.append(&mut self.list);
        self.has_errors = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_sets_flag() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.warning(Position::default(), Path::new("a.ch"), "meh");
        assert!(!diagnostics.has_errors());

        diagnostics.error(Position::new(3, 1), Path::new("a.ch"), "boom");
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.len(), 2);
    }

    #[test]
    fn test_drain_carries_error_flag() {
        let mut source = Diagnostics::new();
        source.error(Position::default(), Path::new("a.ch"), "boom");

        let mut target = Diagnostics::new();
        source.drain_into(&mut target);

        assert!(target.has_errors());
        assert!(source.is_empty());
        assert!(!source.has_errors());
    }
}
