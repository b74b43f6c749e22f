use thiserror::Error;

use crate::token::Span;

/// A structurally invalid input, reported with the position of the token
/// the parser was looking at when it gave up.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message} at line {}, column {}", .span.line, .span.column)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;
