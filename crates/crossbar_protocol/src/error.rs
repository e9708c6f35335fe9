use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Plugin output is not valid UTF-8 (invalid byte sequence after {valid_up_to} bytes)")]
    InvalidUtf8 { valid_up_to: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntervalError {
    #[error("Missing interval segment")]
    Missing,

    #[error("Invalid interval '{0}'. Expected a positive number followed by one of s, m or h")]
    Malformed(String),

    #[error("Interval '{0}' must be greater than zero")]
    Zero(String),
}

static_assertions::assert_impl_all!(ParseError: Send, Sync);
static_assertions::assert_impl_all!(IntervalError: Send, Sync);
