use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error;
use std::fmt;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

/// Broad classification of an error.
///
/// The kind determines how far an error is allowed to travel. Plan errors are
/// raised before any operator is opened, protocol violations and resource
/// errors abort the current execution after the driver has closed every
/// opened operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown kind tag, arity mismatch, missing parameter, unresolvable
    /// function body.
    PlanMalformed,
    /// Misuse of the open/next/close contract, or an input that breaks an
    /// operator's precondition (empty input to reduce, multiple tuples where
    /// one is required).
    ProtocolViolation,
    /// Allocation or I/O failure reported by a collaborator.
    Resource,
    /// Functionality that hasn't been implemented.
    NotImplemented,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlanMalformed => write!(f, "plan malformed"),
            Self::ProtocolViolation => write!(f, "protocol violation"),
            Self::Resource => write!(f, "resource"),
            Self::NotImplemented => write!(f, "not implemented"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug)]
pub struct DbError {
    inner: Box<DbErrorInner>,
}

#[derive(Debug)]
struct DbErrorInner {
    /// Message for the error.
    msg: String,
    /// Classification of this error.
    kind: ErrorKind,
    /// Source of the error.
    source: Option<Box<dyn Error + Send + Sync>>,
    /// Captured backtrace.
    ///
    /// Only populated when RUST_BACKTRACE is set.
    backtrace: Backtrace,
    /// Extra key/value pairs providing context for the error.
    fields: Vec<ErrorField>,
}

#[derive(Debug)]
struct ErrorField {
    key: &'static str,
    value: String,
}

impl DbError {
    /// Create a new internal error.
    pub fn new(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Internal, msg)
    }

    pub fn plan(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::PlanMalformed, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::ProtocolViolation, msg)
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Resource, msg)
    }

    pub fn with_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        DbError {
            inner: Box::new(DbErrorInner {
                msg: msg.into(),
                kind,
                source: None,
                backtrace: Backtrace::capture(),
                fields: Vec::new(),
            }),
        }
    }

    /// Create a new error wrapping some other error.
    ///
    /// Errors created this way are treated as resource errors since wrapped
    /// errors almost always come from I/O.
    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        let mut err = Self::resource(msg);
        err.inner.source = Some(source);
        err
    }

    /// Attach a key/value pair to the error.
    pub fn with_field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.inner.fields.push(ErrorField {
            key,
            value: value.to_string(),
        });
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn message(&self) -> &str {
        &self.inner.msg
    }

    pub fn get_field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.inner.backtrace
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;

        for field in &self.inner.fields {
            write!(f, "\n{}: {}", field.key, field.value)?;
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

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        DbError::with_source("IO error", Box::new(value))
    }
}

impl From<fmt::Error> for DbError {
    fn from(value: fmt::Error) -> Self {
        DbError::with_source("Format error", Box::new(value))
    }
}

pub trait ResultExt<T, E> {
    /// Wrap an error with some additional context.
    ///
    /// The kind of the wrapped error is carried over when it's a `DbError`.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Like `context`, but the message is only built on error.
    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: Fn() -> String;
}

impl<T, E> ResultExt<T, E> for std::result::Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        self.map_err(|e| wrap_with_kind(msg.to_string(), e))
    }

    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: Fn() -> String,
    {
        self.map_err(|e| wrap_with_kind(f(), e))
    }
}

fn wrap_with_kind<E>(msg: String, err: E) -> DbError
where
    E: Error + Send + Sync + 'static,
{
    let kind = (&err as &dyn Error)
        .downcast_ref::<DbError>()
        .map(|e| e.kind())
        .unwrap_or(ErrorKind::Resource);
    let mut wrapped = DbError::with_kind(kind, msg);
    wrapped.inner.source = Some(Box::new(err));
    wrapped
}

pub trait OptionExt<T> {
    /// Return a plan error if the option is None.
    ///
    /// `what` should describe the missing value, e.g. "num_keys".
    fn required(self, what: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, what: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(DbError::plan(format!("Missing required value: {what}"))),
        }
    }
}

/// Return a not implemented error with the formatted message.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {
        return Err($crate::DbError::with_kind(
            $crate::ErrorKind::NotImplemented,
            format!("Not yet implemented: {}", format!($($arg)*)),
        ))
    };
}
