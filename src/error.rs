use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use serde_json::Value;
use strum_macros::Display;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A connect attempt was terminated before the session reached the open state
    ConnectAbort,
    /// A send timeout, acknowledgement timeout or once-listener timeout elapsed
    Timeout,
    /// The caller canceled the call before its package left the buffer
    Cancellation,
    /// The remote end rejected an invocation
    Remote,
    /// Error related to invalid input or state
    Validation,
    /// Internal error from dependencies
    Internal,
    /// Error related to the underlying WebSocket
    WebSocket,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn timeout<S: Into<String>>(message: S, origin: TimeoutOrigin) -> Self {
        Timeout {
            message: message.into(),
            origin,
        }
        .into()
    }

    #[must_use]
    pub fn cancellation() -> Self {
        Cancellation::default().into()
    }

    #[must_use]
    pub fn remote(data: Value) -> Self {
        Remote { data }.into()
    }

    /// Returns the origin tag when this error is a [`Timeout`].
    #[must_use]
    pub fn timeout_origin(&self) -> Option<TimeoutOrigin> {
        self.downcast_ref::<Timeout>().map(|t| t.origin)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// A connect attempt ended before the server signalled that the connection is ready.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAbort {
    pub url: String,
    pub code: u16,
    pub reason: String,
}

impl ConnectAbort {
    #[must_use]
    pub fn new<U: Into<String>, R: Into<String>>(url: U, code: u16, reason: R) -> Self {
        Self {
            url: url.into(),
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConnectAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connect abort to URL: {} with reason: {} and code: {}",
            self.url, self.reason, self.code
        )
    }
}

impl StdError for ConnectAbort {}

impl From<ConnectAbort> for Error {
    fn from(err: ConnectAbort) -> Self {
        Error::with_source(Kind::ConnectAbort, err)
    }
}

/// Where a [`Timeout`] was raised.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TimeoutOrigin {
    /// The package was not handed to the socket in time
    SendTimeout,
    /// The remote end did not acknowledge an invocation in time
    AckTimeout,
    /// A once-listener did not observe its event in time
    OnceListener,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeout {
    pub message: String,
    pub origin: TimeoutOrigin,
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.origin)
    }
}

impl StdError for Timeout {}

impl From<Timeout> for Error {
    fn from(err: Timeout) -> Self {
        Error::with_source(Kind::Timeout, err)
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub message: String,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self {
            message: "the promise was cancelled".to_owned(),
        }
    }
}

impl fmt::Display for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for Cancellation {}

impl From<Cancellation> for Error {
    fn from(err: Cancellation) -> Self {
        Error::with_source(Kind::Cancellation, err)
    }
}

/// Rejection payload returned by the remote end for an invocation.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct Remote {
    pub data: Value,
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote end rejected the invocation: {}", self.data)
    }
}

impl StdError for Remote {}

impl From<Remote> for Error {
    fn from(err: Remote) -> Self {
        Error::with_source(Kind::Remote, err)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn connect_abort_display_should_succeed() {
        let abort = ConnectAbort::new("ws://localhost:3000", 4007, "Connect timeout");

        assert_eq!(
            abort.to_string(),
            "connect abort to URL: ws://localhost:3000 with reason: Connect timeout and code: 4007"
        );
    }

    #[test]
    fn connect_abort_into_error_should_succeed() {
        let error: Error = ConnectAbort::new("ws://localhost", 1006, "hang up").into();

        assert_eq!(error.kind(), Kind::ConnectAbort);
        let abort = error.downcast_ref::<ConnectAbort>().unwrap();
        assert_eq!(abort.code, 1006);
    }

    #[test]
    fn timeout_origin_is_exposed() {
        let error = Error::timeout("Invoke send timeout reached.", TimeoutOrigin::SendTimeout);

        assert_eq!(error.kind(), Kind::Timeout);
        assert_eq!(error.timeout_origin(), Some(TimeoutOrigin::SendTimeout));
        assert!(error.to_string().contains("SendTimeout"));
    }

    #[test]
    fn cancellation_has_default_message() {
        let error = Error::cancellation();

        assert_eq!(error.kind(), Kind::Cancellation);
        assert!(error.to_string().contains("cancelled"));
        assert_eq!(error.timeout_origin(), None);
    }

    #[test]
    fn remote_carries_rejection_data() {
        let error = Error::remote(json!({"name": "AccessDenied"}));

        assert_eq!(error.kind(), Kind::Remote);
        assert_eq!(
            error.downcast_ref::<Remote>().unwrap().data,
            json!({"name": "AccessDenied"})
        );
    }
}
