// Silt Error Handling Module
// Provides error reporting with line numbers, spans, and source context.

use colored::*;
use std::fmt;

/// Represents a position in the source code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self {
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

/// Represents a span in the source code (start to end position)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn from_positions(
        start_line: usize,
        start_col: usize,
        end_line: usize,
        end_col: usize,
    ) -> Self {
        Self {
            start: Position::new(start_line, start_col, 0),
            end: Position::new(end_line, end_col, 0),
        }
    }

    pub fn single(line: usize, column: usize, offset: usize) -> Self {
        let pos = Position::new(line, column, offset);
        Self {
            start: pos,
            end: pos,
        }
    }

    /// Shorthand used all over the tests: a span covering one line.
    pub fn line(line: usize) -> Self {
        Self::single(line, 1, 0)
    }
}

/// Types of errors in Silt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    SyntaxError,
    TypeError,
    NameError,
    ValueError,
    RuntimeError,
    AttributeError,
    NotSupportedError,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SyntaxError => write!(f, "SyntaxError"),
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::NameError => write!(f, "NameError"),
            ErrorKind::ValueError => write!(f, "ValueError"),
            ErrorKind::RuntimeError => write!(f, "RuntimeError"),
            ErrorKind::AttributeError => write!(f, "AttributeError"),
            ErrorKind::NotSupportedError => write!(f, "NotSupportedError"),
            ErrorKind::InternalError => write!(f, "InternalError"),
        }
    }
}

/// Main error type for Silt
#[derive(Debug, Clone)]
pub struct SiltError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub file: String,
    pub help: Option<String>,
    source_lines: Vec<String>,
}

impl SiltError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        span: Span,
        file: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            file: file.into(),
            help: None,
            source_lines: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_lines = source.lines().map(String::from).collect();
        self
    }

    /// Format the error for display
    pub fn format(&self) -> String {
        let mut output = String::new();

        // Error header: SyntaxError: message at file:line:column
        let header = format!(
            "{}: {} at {}:{}:{}",
            self.kind.to_string().red().bold(),
            self.message.white().bold(),
            self.file,
            self.span.start.line,
            self.span.start.column
        );
        output.push_str(&header);
        output.push('\n');

        // Source context (show 3 lines: before, error line, after)
        if !self.source_lines.is_empty() {
            let error_line = self.span.start.line;
            let start_line = if error_line > 1 { error_line - 1 } else { 1 };
            let end_line = (error_line + 1).min(self.source_lines.len());

            output.push('\n');

            for line_num in start_line..=end_line {
                if line_num <= self.source_lines.len() {
                    let line_content = &self.source_lines[line_num - 1];
                    let line_num_str = format!("{:>4} |", line_num);

                    if line_num == error_line {
                        output.push_str(&format!("{} {}\n", line_num_str.red(), line_content));

                        let spaces = " ".repeat(6 + self.span.start.column);
                        let caret_len = if self.span.end.column > self.span.start.column {
                            self.span.end.column - self.span.start.column + 1
                        } else {
                            1
                        };
                        let carets = "^".repeat(caret_len);
                        output.push_str(&format!("{}{}\n", spaces, carets.red().bold()));
                    } else {
                        output.push_str(&format!("{} {}\n", line_num_str.dimmed(), line_content));
                    }
                }
            }
        }

        if let Some(ref help) = self.help {
            output.push_str(&format!("\n      {}: {}\n", "Help".cyan().bold(), help));
        }

        output
    }
}

impl fmt::Display for SiltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl std::error::Error for SiltError {}

/// Result type for Silt operations
pub type SiltResult<T> = Result<T, SiltError>;

// Convenience constructors for common errors
impl SiltError {
    pub fn syntax_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::SyntaxError, message, span, file)
    }

    pub fn type_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message, span, file)
    }

    pub fn name_error(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::NameError, message, span, file)
    }

    pub fn not_supported(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupportedError, message, span, file)
    }

    pub fn internal(message: impl Into<String>, span: Span, file: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message, span, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_kind_and_location() {
        let err = SiltError::syntax_error("bad thing", Span::from_positions(3, 7, 3, 9), "demo.si");
        let text = err.to_string();
        assert!(text.contains("SyntaxError"));
        assert!(text.contains("demo.si:3:7"));
    }

    #[test]
    fn source_context_marks_error_line() {
        let err = SiltError::name_error("name 'q' is not defined", Span::line(2), "demo.si")
            .with_source("a = 1\nb = q\nc = 3");
        let text = err.to_string();
        assert!(text.contains("b = q"));
        assert!(text.contains('^'));
    }
}
