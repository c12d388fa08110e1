pub use retry_derive::*;

/// The disposition of an error with respect to retrying the operation that
/// produced it.
///
/// Every error in the executor falls into exactly one of two buckets:
///
/// * [Transient](Retry::Transient) errors are the weather. The Kubernetes API
///   server hiccuped, the central server dropped a connection, a conflict was
///   hit on a patch. Nothing is done about these beyond a log entry and a
///   metrics increment because the periodic task that hit them will simply run
///   again on its next tick.
/// * [Fatal](Retry::Fatal) errors are final for the job that they concern. A
///   pod spec that the API server rejects today will be rejected tomorrow.
///   These are the errors whose text ends up on the event stream, either as a
///   `failed` event or as the reason attached to a returned lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Transient,
    Fatal,
}

/// A type that implements Retryable can classify itself as [Transient](Retry::Transient)
/// or [Fatal](Retry::Fatal).
///
/// The easiest way to implement Retryable is via the derive macro.
///
/// ```
/// use retry::{Retry, Retryable};
///
/// #[derive(Retryable)]
/// #[retry(Retry::Fatal)]
/// struct InvalidPodSpec {}
///
/// #[derive(Retryable)]
/// enum Weather {
///     #[retry(Retry::Transient)]
///     ConnectionReset,
///     #[retry(Retry::Fatal)]
///     Quota,
/// }
///
/// assert_eq!(Retry::Fatal, InvalidPodSpec {}.retry());
/// assert_eq!(Retry::Transient, Weather::ConnectionReset.retry());
/// ```
pub trait Retryable {
    fn retry(&self) -> Retry;

    fn is_transient(&self) -> bool {
        self.retry() == Retry::Transient
    }

    fn is_fatal(&self) -> bool {
        self.retry() == Retry::Fatal
    }
}

#[cfg(test)]
mod tests {
    use crate as retry;
    use retry::*;

    #[derive(Retryable)]
    #[retry(retry::Retry::Fatal)]
    struct Struct {}

    #[derive(Retryable)]
    enum Enum {
        #[retry(retry::Retry::Transient)]
        Flaky,
        #[retry(retry::Retry::Fatal)]
        Busted,
        #[retry(retry::Retry::Transient)]
        Weird(u32),
    }

    #[test]
    fn smoke() {
        assert_eq!(retry::Retry::Fatal, Struct {}.retry());
        assert_eq!(retry::Retry::Transient, Enum::Flaky.retry());
        assert_eq!(retry::Retry::Fatal, Enum::Busted.retry());
        assert_eq!(retry::Retry::Transient, Enum::Weird(42).retry());
        assert!(Enum::Flaky.is_transient());
        assert!(Struct {}.is_fatal());
    }
}
