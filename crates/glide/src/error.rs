use std::fmt::{self, Display};

use smallvec::SmallVec;
use strum::{Display, EnumString, IntoStaticStr};

/// Result type alias for operations that can fail at any pipeline stage.
pub type RunResult<T> = Result<T, RunError>;

/// Failure classification used in reports.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and
/// `Into<&'static str>` implementations. The string representation matches
/// the variant name exactly (e.g., `TypeError` -> "TypeError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum ErrorKind {
    /// Malformed source, reported by the lexer or parser.
    SyntaxError,
    /// Structural or refinement mismatch, re-annotation, invalid cast.
    TypeError,
    /// Function call argument did not match its parameter type.
    ArgTypeError,
    /// Index/key out of range, unsupported operator pair, undefined
    /// variable, unresolvable or ambiguous overload.
    RuntimeError,
    /// A wrapped failure from an imported file; the message preserves the
    /// inner location.
    ImportError,
}

/// A fatal interpreter error with its source position and call chain.
///
/// Every error is fatal: the pipeline never recovers, it reports a single
/// line and the process exits with status 1. The chain starts with the file
/// name and grows one segment per function call, so a failure inside nested
/// calls reads `main.gl/outer/inner`.
#[derive(Debug, Clone)]
pub struct GlideError {
    pub kind: ErrorKind,
    pub chain: SmallVec<[String; 4]>,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl GlideError {
    pub(crate) fn new(kind: ErrorKind, chain: SmallVec<[String; 4]>, line: u32, column: u32, message: String) -> Self {
        Self {
            kind,
            chain,
            line,
            column,
            message,
        }
    }

    /// The `file/func1/func2` portion of the report.
    pub fn chain_display(&self) -> String {
        self.chain.join("/")
    }
}

impl Display for GlideError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in '{}' @ ({}, {}): {}",
            self.kind,
            self.chain_display(),
            self.line,
            self.column,
            self.message
        )
    }
}

impl std::error::Error for GlideError {}

/// Control-flow escape from the walkers.
///
/// Everything unwinds as an `Err`; only the top level (the CLI, or
/// whoever drives `Runner`) converts it into a process exit.
#[derive(Debug, Clone)]
pub enum RunError {
    /// A fatal diagnostic.
    Fatal(Box<GlideError>),
    /// The `exit(code)` built-in was called.
    Exit(i32),
}

impl RunError {
    /// The exit status the process should terminate with.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fatal(_) => 1,
            Self::Exit(code) => code.rem_euclid(256),
        }
    }
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal(err) => err.fmt(f),
            Self::Exit(code) => write!(f, "exit({code})"),
        }
    }
}

impl From<GlideError> for RunError {
    fn from(err: GlideError) -> Self {
        Self::Fatal(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn report_format() {
        let err = GlideError::new(
            ErrorKind::TypeError,
            smallvec!["main.gl".to_owned(), "f".to_owned()],
            3,
            7,
            "Cannot assign value of type 'string' to variable of type 'int'.".to_owned(),
        );
        assert_eq!(
            err.to_string(),
            "TypeError in 'main.gl/f' @ (3, 7): Cannot assign value of type 'string' to variable of type 'int'."
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RunError::Exit(0).exit_code(), 0);
        assert_eq!(RunError::Exit(300).exit_code(), 44);
        assert_eq!(RunError::Exit(-1).exit_code(), 255);
        let err: RunError = GlideError::new(ErrorKind::RuntimeError, smallvec!["m.gl".to_owned()], 1, 1, "x".into()).into();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn kind_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(ErrorKind::from_str("ArgTypeError").unwrap(), ErrorKind::ArgTypeError);
        assert_eq!(ErrorKind::SyntaxError.to_string(), "SyntaxError");
    }
}
