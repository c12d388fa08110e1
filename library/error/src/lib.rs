pub use error_derive::ExecError;
pub use kind::Kind;
pub use retry;
pub use retry::{Retry, Retryable};
use serde::{Serialize, Serializer};
use serde_json::json;
pub use thiserror;
pub use thiserror::Error;

/// An ExecError is the trait by which all errors returned by any executor
/// component MUST adhere.
///
/// The easiest way to implement this error type is to utilize the derive
/// macros re-exported by this library. Notably, [Error](thiserror::Error),
/// [ExecError](error_derive::ExecError), [Retryable](retry::Retryable), and
/// [Kind](kind::Kind). [Debug](std::fmt::Debug) is required to fulfill the
/// standard library [Error](std::error::Error).
///
/// ```
/// use error::*;
///
/// #[derive(Error, ExecError, Retryable, Kind, Debug)]
/// #[error(
/// "This is the string that will end up in logs and, for fatal errors, on \
/// the event stream. You can also (and should) interpolate data members into \
/// this string. For example, here is some {info} about this {action}!"
/// )]
/// #[retry(Retry::Fatal)]
/// struct MyError {
///     action: String,
///     info: String,
///     // Any aggregated error type that is annotated as a source will be
///     // formatted and serialized into the 'cause' key of the resulting JSON.
///     #[source]
///     cause: std::io::Error,
/// }
/// ```
pub trait ExecError: std::error::Error + Kind + Retryable + Send + Sync {}

/// This conversion supports the automatic boxing of any type that
/// implements [ExecError](crate::ExecError).
///
/// Note that this conversion results in a heap allocated error type with
/// dynamic dispatch (that is, it behaves more like an interface
/// object would in Java or Go).
impl<T: 'static + ExecError> From<T> for Box<dyn ExecError> {
    fn from(err: T) -> Self {
        Box::new(err)
    }
}

impl Retryable for Box<dyn ExecError> {
    fn retry(&self) -> Retry {
        self.as_ref().retry()
    }
}

impl Kind for Box<dyn ExecError> {
    fn kind(&self) -> String {
        self.as_ref().kind()
    }
}

/// The [Serialize](serde::Serialize) trait implementation for an
/// [ExecError](crate::ExecError) is a JSON object. Given the following struct
/// definition...
///
/// ```
/// use error::*;
///
/// #[derive(Error, ExecError, Retryable, Kind, Debug)]
/// #[error(
/// "This is the string that will show up in the 'message' key of the resulting JSON."
/// )]
/// #[retry(Retry::Fatal)]
/// struct MyError {
///     #[source]
///     cause: std::io::Error,
/// }
/// ```
///
/// ...the following JSON will be emitted.
///
/// ```ignore
/// {
///     "kind": "MyError",
///     "message": "This is the string that will show up in the 'message' key of the resulting JSON.",
///     "cause": "Failed to open file because of reasons."
/// }
/// ```
///
/// This is the representation embedded in `failed` events so that downstream
/// consumers receive the machine readable kind alongside the human prose.
impl Serialize for Box<dyn ExecError> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        json!({
            "kind": self.kind(),
            "message": format!("{}", self),
            "cause": self.source().map(|cause| format!("{}", cause)),
        })
        .serialize(serializer)
    }
}

/// A `StringError` is a convenient way to convert a raw String type into a first
/// class ExecError. This is especially useful when you would like to embed a raw
/// string as [source](std::error::Error::source) for a higher ExecError, for
/// example the reason text the central server attaches to a declined lease.
///
/// The raw string, as is, is used as the [display](std::fmt::Display) for this
/// type. A StringError is always fatal; transient conditions have first class
/// error types of their own.
///
/// ```
/// use error::*;
///
/// #[derive(Error, ExecError, Kind, Retryable, Debug)]
/// #[retry(Retry::Fatal)]
/// #[error("Something rather bad happened, and this is the gentle explanation.")]
/// struct HigherError {
///     #[source]
///     cause: StringError
/// }
///
/// fn do_work() -> Result<(), HigherError> {
///     Err(HigherError{cause: "and this is the gnarly explanation".into()})
/// }
/// ```
#[derive(Error, ExecError, Kind, Retryable, Debug)]
#[retry(Retry::Fatal)]
#[error("{inner}")]
pub struct StringError {
    inner: String,
}

impl<T: AsRef<str>> From<T> for StringError {
    fn from(inner: T) -> Self {
        Self {
            inner: inner.as_ref().to_string(),
        }
    }
}

impl From<Box<dyn ExecError>> for StringError {
    fn from(inner: Box<dyn ExecError>) -> Self {
        Self {
            inner: format!("{:?}", inner),
        }
    }
}
