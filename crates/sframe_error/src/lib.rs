//! Error types used throughout the sframe engine.

use std::borrow::Cow;
use std::fmt;

pub type Result<T, E = SframeError> = std::result::Result<T, E>;

/// The error type for all fallible engine operations.
///
/// Errors carry a human-readable message naming the offending entity
/// (column, path, aggregator) plus an optional source error.
#[derive(Debug)]
pub struct SframeError {
    inner: Box<ErrorInner>,
}

#[derive(Debug)]
struct ErrorInner {
    msg: Cow<'static, str>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SframeError {
    pub fn new(msg: impl Into<Cow<'static, str>>) -> Self {
        SframeError {
            inner: Box::new(ErrorInner {
                msg: msg.into(),
                source: None,
            }),
        }
    }

    pub fn with_source(
        msg: impl Into<Cow<'static, str>>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        SframeError {
            inner: Box::new(ErrorInner {
                msg: msg.into(),
                source: Some(source.into()),
            }),
        }
    }

    pub fn message(&self) -> &str {
        &self.inner.msg
    }
}

impl fmt::Display for SframeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;
        if let Some(source) = &self.inner.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SframeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for SframeError {
    fn from(err: std::io::Error) -> Self {
        SframeError::with_source("IO error", err)
    }
}

impl From<std::fmt::Error> for SframeError {
    fn from(err: std::fmt::Error) -> Self {
        SframeError::with_source("Format error", err)
    }
}

impl From<std::num::ParseIntError> for SframeError {
    fn from(err: std::num::ParseIntError) -> Self {
        SframeError::with_source("Failed to parse integer", err)
    }
}

/// Extension trait for adding context to error results.
pub trait ResultExt<T> {
    /// Wrap the error with a static context message.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap the error with a lazily computed context message.
    fn context_fn<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<Cow<'static, str>>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(SframeError::with_source(msg, e)),
        }
    }

    fn context_fn<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<Cow<'static, str>>,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(SframeError::with_source(f(), e)),
        }
    }
}

/// Return early with a "not implemented" error.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {
        return Err($crate::SframeError::new(format!(
            "Not implemented: {}",
            format!($($arg)*)
        )))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = SframeError::with_source("Failed to open index", io);
        assert_eq!("Failed to open index: missing", err.to_string());
    }

    #[test]
    fn context_wraps() {
        let res: Result<(), std::io::Error> = Err(std::io::Error::other("boom"));
        let err = res.context("Reading segment").unwrap_err();
        assert!(err.to_string().starts_with("Reading segment"));
    }
}
