//! Error type shared by all svcql crates.
use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

/// Field name used to mark errors that callers must not retry.
pub const FATAL_FIELD: &str = "fatal";

#[derive(Debug)]
pub struct DbError {
    inner: Box<DbErrorInner>,
}

struct DbErrorInner {
    /// Message for the error.
    msg: String,
    /// Source of the error.
    source: Option<Box<dyn Error + Send + Sync>>,
    /// Extra fields attached to the error, printed after the message.
    fields: Vec<ErrorField>,
    /// Captured backtrace, only populated if `RUST_BACKTRACE` is set.
    backtrace: Backtrace,
}

struct ErrorField {
    key: Cow<'static, str>,
    value: String,
}

impl fmt::Debug for DbErrorInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbErrorInner")
            .field("msg", &self.msg)
            .field("source", &self.source)
            .field("fields", &self.fields.len())
            .finish_non_exhaustive()
    }
}

impl DbError {
    pub fn new(msg: impl Into<String>) -> Self {
        DbError {
            inner: Box::new(DbErrorInner {
                msg: msg.into(),
                source: None,
                fields: Vec::new(),
                backtrace: Backtrace::capture(),
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        let mut err = Self::new(msg);
        err.inner.source = Some(source);
        err
    }

    /// Create an error that indicates an unrecoverable failure.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::new(msg).with_field(FATAL_FIELD, true)
    }

    /// Attach a key/value field to the error.
    pub fn with_field(mut self, key: impl Into<Cow<'static, str>>, value: impl fmt::Display) -> Self {
        self.inner.fields.push(ErrorField {
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    pub fn get_msg(&self) -> &str {
        self.inner.msg.as_str()
    }

    pub fn get_field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|field| field.key == key)
            .map(|field| field.value.as_str())
    }

    /// If this error was marked as fatal.
    pub fn is_fatal(&self) -> bool {
        self.get_field(FATAL_FIELD) == Some("true")
    }

    pub fn get_backtrace(&self) -> &Backtrace {
        &self.inner.backtrace
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;

        if !self.inner.fields.is_empty() {
            write!(f, " (")?;
            for (idx, field) in self.inner.fields.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", field.key, field.value)?;
            }
            write!(f, ")")?;
        }

        if let Some(source) = &self.inner.source {
            write!(f, "\nError source: {source}")?;
        }

        if self.inner.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace: {}", self.inner.backtrace)?;
        }

        Ok(())
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|e| e.as_ref() as _)
    }
}

macro_rules! impl_from_error {
    ($($ty:ty => $msg:expr),* $(,)?) => {
        $(
            impl From<$ty> for DbError {
                fn from(value: $ty) -> Self {
                    DbError::with_source($msg, Box::new(value))
                }
            }
        )*
    };
}

impl_from_error!(
    std::io::Error => "IO error",
    std::fmt::Error => "Format error",
    std::num::ParseIntError => "Failed to parse integer",
    std::num::ParseFloatError => "Failed to parse float",
    std::string::FromUtf8Error => "Invalid UTF-8",
);

/// An extension trait for adding context to the Error variant of a result.
pub trait ResultExt<T, E> {
    /// Wrap an error with a static context string.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap an error with a context string generated from a function.
    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Error + Send + Sync + 'static> ResultExt<T, E> for std::result::Result<T, E> {
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(DbError::with_source(msg, Box::new(e))),
        }
    }

    fn context_fn<F: Fn() -> String>(self, f: F) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(DbError::with_source(f(), Box::new(e))),
        }
    }
}

pub trait OptionExt<T> {
    /// Return an error indicating that `what` was required but was `None`.
    fn required(self, what: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, what: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(DbError::new(format!("Missing {what}"))),
        }
    }
}

/// Return a "not implemented" error for features that can be parsed but not
/// executed.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {{
        let msg = std::format!($($arg)*);
        $crate::DbError::new(std::format!("Not yet implemented: {msg}"))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_fields() {
        let err = DbError::new("bad things").with_field("id", "abc").with_field("rows", 3);
        let s = err.to_string();
        assert!(s.starts_with("bad things (id: abc, rows: 3)"), "{s}");
    }

    #[test]
    fn fatal_marker() {
        assert!(DbError::fatal("interrupted").is_fatal());
        assert!(!DbError::new("plain").is_fatal());
    }

    #[test]
    fn context_wraps_source() {
        let res: std::result::Result<i64, _> = "abc".parse::<i64>();
        let err = res.context("parsing row limit").unwrap_err();
        assert_eq!("parsing row limit", err.get_msg());
        assert!(err.source().is_some());
    }

    #[test]
    fn required_on_none() {
        let err = None::<i32>.required("source graph").unwrap_err();
        assert_eq!("Missing source graph", err.get_msg());
    }
}
